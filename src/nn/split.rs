//! Слой Split: раздает один тензор нескольким потребителям.
//!
//! Сеть вставляет его автоматически, когда выход одного слоя читают
//! несколько слоев. Значения не копируются: все выходы разделяют буфер
//! значений входа. Градиенты выходов при обратном проходе суммируются.

use crate::nn::layer::{DeviceKernels, Layer, Result};
use crate::tensor::Tensor;

#[derive(Debug, Default)]
pub struct Split;

impl Split {
    pub fn new() -> Self {
        Split
    }
}

fn sum_gradients(dys: &[&[f32]], dx: &mut [f32]) {
    dx.copy_from_slice(dys[0]);
    for dy in &dys[1..] {
        for (dx, &dy) in dx.iter_mut().zip(dy.iter()) {
            *dx += dy;
        }
    }
}

impl Layer for Split {
    fn layer_type(&self) -> &'static str {
        "Split"
    }

    fn exact_num_bottoms(&self) -> Option<usize> {
        Some(1)
    }

    fn min_tops(&self) -> Option<usize> {
        Some(1)
    }

    fn reshape(&mut self, bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()> {
        for t in top.iter_mut() {
            t.reshape_like(bottom[0]);
            t.share_value(bottom[0]);
        }
        Ok(())
    }

    fn forward_cpu(&mut self, _bottom: &[&Tensor], _top: &mut [Tensor]) -> Result<()> {
        // Значения уже разделены в reshape.
        Ok(())
    }

    fn backward_cpu(
        &mut self,
        top: &[&Tensor],
        propagate_down: &[bool],
        bottom: &[&Tensor],
    ) -> Result<()> {
        if !propagate_down[0] {
            return Ok(());
        }
        let guards: Vec<_> = top.iter().map(|t| t.gradient()).collect();
        let dys: Vec<&[f32]> = guards.iter().map(|g| &**g).collect();
        sum_gradients(&dys, &mut bottom[0].gradient_mut());
        Ok(())
    }

    fn device_kernels(&mut self) -> Option<&mut dyn DeviceKernels> {
        Some(self)
    }
}

impl DeviceKernels for Split {
    fn forward_device(&mut self, _bottom: &[&Tensor], _top: &mut [Tensor]) -> Result<()> {
        Ok(())
    }

    fn backward_device(
        &mut self,
        top: &[&Tensor],
        propagate_down: &[bool],
        bottom: &[&Tensor],
    ) -> Result<()> {
        if !propagate_down[0] {
            return Ok(());
        }
        let guards: Vec<_> = top.iter().map(|t| t.device_gradient()).collect();
        let dys: Vec<&[f32]> = guards.iter().map(|g| &**g).collect();
        sum_gradients(&dys, &mut bottom[0].device_gradient_mut());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outputs_share_input_values() {
        let mut split = Split::new();
        let x = Tensor::from_slice(&[2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let mut top = vec![Tensor::default(), Tensor::default(), Tensor::default()];
        split.reshape(&[&x], &mut top).unwrap();
        split.forward_cpu(&[&x], &mut top).unwrap();
        for t in &top {
            assert!(t.shares_value_with(&x));
            assert_eq!(&*t.value(), &[1.0, 2.0, 3.0, 4.0]);
        }
    }

    #[test]
    fn test_backward_sums_output_gradients() {
        let mut split = Split::new();
        let x = Tensor::from_slice(&[3], &[0.0; 3]);
        let mut top = vec![Tensor::default(), Tensor::default()];
        split.reshape(&[&x], &mut top).unwrap();
        top[0].gradient_mut().copy_from_slice(&[1.0, 2.0, 3.0]);
        top[1].gradient_mut().copy_from_slice(&[10.0, 20.0, 30.0]);

        let top_refs: Vec<&Tensor> = top.iter().collect();
        split.backward_cpu(&top_refs, &[true], &[&x]).unwrap();
        assert_eq!(&*x.gradient(), &[11.0, 22.0, 33.0]);
    }
}
