//! Модуль, реализующий полносвязный слой (InnerProduct).

use crate::nn::config::LayerConfig;
use crate::nn::filler::Filler;
use crate::nn::layer::{Layer, LayerError, Result};
use crate::runtime::Context;
use crate::tensor::Tensor;
use ndarray::linalg::general_mat_mul;
use ndarray::{ArrayView2, ArrayViewMut2, Axis};
use rand::rngs::StdRng;

/// Полносвязный слой `Y = X·W (+ 1·b)`.
///
/// Вход сворачивается в матрицу `X: [M, K]`, где `M` - произведение осей до
/// `axis`, а `K` - произведение осей начиная с `axis`. Параметры:
/// веса `W: [K, N]` и (опционально) смещения `b: [N]`.
pub struct InnerProduct {
    num_output: usize,
    bias_term: bool,
    axis: isize,
    m: usize,
    k: usize,
    blobs: Vec<Tensor>,
    param_propagate_down: Vec<bool>,
    weight_filler: Filler,
    bias_filler: Filler,
    rng: StdRng,
}

fn matrix<'a>(data: &'a [f32], rows: usize, cols: usize) -> Result<ArrayView2<'a, f32>> {
    ArrayView2::from_shape((rows, cols), data)
        .map_err(|e| LayerError::ShapeMismatch(format!("{}x{} view: {}", rows, cols, e)))
}

fn matrix_mut<'a>(data: &'a mut [f32], rows: usize, cols: usize) -> Result<ArrayViewMut2<'a, f32>> {
    ArrayViewMut2::from_shape((rows, cols), data)
        .map_err(|e| LayerError::ShapeMismatch(format!("{}x{} view: {}", rows, cols, e)))
}

impl InnerProduct {
    pub fn new(config: &LayerConfig, ctx: &Context) -> Result<Self> {
        let params = &config.inner_product;
        if params.num_output == 0 {
            return Err(LayerError::InvalidConfig(
                "InnerProduct needs num_output > 0".to_string(),
            ));
        }
        Ok(Self {
            num_output: params.num_output,
            bias_term: params.bias_term,
            axis: params.axis,
            m: 0,
            k: 0,
            blobs: Vec::new(),
            param_propagate_down: Vec::new(),
            weight_filler: Filler::from_config(&params.weight_filler)?,
            bias_filler: Filler::from_config(&params.bias_filler)?,
            rng: ctx.fork_rng(),
        })
    }

    pub fn weights(&self) -> &Tensor {
        &self.blobs[0]
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.blobs.get(1)
    }

    fn needs_param_gradient(&self, index: usize) -> bool {
        self.param_propagate_down.get(index).copied().unwrap_or(true)
    }
}

impl Layer for InnerProduct {
    fn layer_type(&self) -> &'static str {
        "InnerProduct"
    }

    fn exact_num_bottoms(&self) -> Option<usize> {
        Some(1)
    }

    fn exact_num_tops(&self) -> Option<usize> {
        Some(1)
    }

    fn layer_setup(&mut self, bottom: &[&Tensor], _top: &mut [Tensor]) -> Result<()> {
        let axis = bottom[0].canonical_axis_index(self.axis);
        self.k = bottom[0].count_from(axis);
        if !self.blobs.is_empty() {
            tracing::debug!("InnerProduct: skipping parameter initialization");
            return Ok(());
        }
        let weights = Tensor::new(&[self.k, self.num_output]);
        self.weight_filler.fill(&weights, &mut self.rng)?;
        self.blobs.push(weights);
        if self.bias_term {
            let bias = Tensor::new(&[self.num_output]);
            self.bias_filler.fill(&bias, &mut self.rng)?;
            self.blobs.push(bias);
        }
        self.param_propagate_down = vec![true; self.blobs.len()];
        Ok(())
    }

    fn reshape(&mut self, bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()> {
        let axis = bottom[0].canonical_axis_index(self.axis);
        let k = bottom[0].count_from(axis);
        if k != self.k {
            return Err(LayerError::ShapeMismatch(format!(
                "InnerProduct input size {} does not match the weight size {}",
                k, self.k
            )));
        }
        self.m = bottom[0].count_range(0, axis);
        let mut shape = bottom[0].shape()[..axis].to_vec();
        shape.push(self.num_output);
        top[0].reshape(&shape);
        Ok(())
    }

    fn forward_cpu(&mut self, bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()> {
        let (m, k, n) = (self.m, self.k, self.num_output);
        let x_data = bottom[0].value();
        let w_data = self.blobs[0].value();
        let mut y_data = top[0].value_mut();

        let x = matrix(&x_data, m, k)?;
        let w = matrix(&w_data, k, n)?;
        let mut y = matrix_mut(&mut y_data, m, n)?;
        general_mat_mul(1.0, &x, &w, 0.0, &mut y);

        if self.bias_term {
            let b_data = self.blobs[1].value();
            let b = ndarray::ArrayView1::from(&b_data[..]);
            for mut row in y.rows_mut() {
                row += &b;
            }
        }
        Ok(())
    }

    fn backward_cpu(
        &mut self,
        top: &[&Tensor],
        propagate_down: &[bool],
        bottom: &[&Tensor],
    ) -> Result<()> {
        let (m, k, n) = (self.m, self.k, self.num_output);
        let dy_data = top[0].gradient();
        let dy = matrix(&dy_data, m, n)?;

        if self.needs_param_gradient(0) {
            let x_data = bottom[0].value();
            let x = matrix(&x_data, m, k)?;
            let mut dw_data = self.blobs[0].gradient_mut();
            let mut dw = matrix_mut(&mut dw_data, k, n)?;
            // dW += Xᵗ·dY
            general_mat_mul(1.0, &x.t(), &dy, 1.0, &mut dw);
        }
        if self.bias_term && self.needs_param_gradient(1) {
            let mut db = self.blobs[1].gradient_mut();
            let column_sums = dy.sum_axis(Axis(0));
            for (db, s) in db.iter_mut().zip(column_sums.iter()) {
                *db += s;
            }
        }
        if propagate_down[0] {
            let w_data = self.blobs[0].value();
            let w = matrix(&w_data, k, n)?;
            let mut dx_data = bottom[0].gradient_mut();
            let mut dx = matrix_mut(&mut dx_data, m, k)?;
            general_mat_mul(1.0, &dy, &w.t(), 0.0, &mut dx);
        }
        Ok(())
    }

    fn blobs(&self) -> &[Tensor] {
        &self.blobs
    }

    fn blobs_mut(&mut self) -> &mut [Tensor] {
        &mut self.blobs
    }

    fn set_param_propagate_down(&mut self, index: usize, value: bool) {
        if index >= self.param_propagate_down.len() {
            self.param_propagate_down.resize(index + 1, true);
        }
        self.param_propagate_down[index] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::filler::FillerConfig;
    use approx::assert_abs_diff_eq;

    fn layer(num_output: usize) -> InnerProduct {
        let mut config = LayerConfig::new("fc", "InnerProduct");
        config.inner_product.num_output = num_output;
        config.inner_product.weight_filler = FillerConfig::constant(0.0);
        InnerProduct::new(&config, &Context::default()).unwrap()
    }

    #[test]
    fn test_num_output_required() {
        let config = LayerConfig::new("fc", "InnerProduct");
        assert!(InnerProduct::new(&config, &Context::default()).is_err());
    }

    #[test]
    fn test_forward_backward_by_hand() {
        let mut fc = layer(2);
        // X: [2, 3]
        let x = Tensor::from_slice(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let mut top = vec![Tensor::default()];
        fc.layer_setup(&[&x], &mut top).unwrap();
        fc.reshape(&[&x], &mut top).unwrap();
        assert_eq!(top[0].shape(), &[2, 2]);

        // W: [3, 2], b: [2]
        fc.blobs[0].set_value(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        fc.blobs[1].set_value(&[0.5, -0.5]);
        fc.forward_cpu(&[&x], &mut top).unwrap();
        assert_eq!(&*top[0].value(), &[4.5, 4.5, 10.5, 10.5]);

        top[0].gradient_mut().copy_from_slice(&[1.0, 0.0, 0.0, 1.0]);
        fc.backward_cpu(&[&top[0]], &[true], &[&x]).unwrap();

        // dW = Xᵗ·dY
        assert_eq!(&*fc.blobs[0].gradient(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(&*fc.blobs[1].gradient(), &[1.0, 1.0]);
        // dX = dY·Wᵗ
        let dx = x.gradient().to_vec();
        for (a, b) in dx.iter().zip(&[1.0, 0.0, 1.0, 0.0, 1.0, 1.0]) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_param_gradients_accumulate_and_can_be_frozen() {
        let mut fc = layer(1);
        let x = Tensor::from_slice(&[1, 2], &[1.0, 1.0]);
        let mut top = vec![Tensor::default()];
        fc.layer_setup(&[&x], &mut top).unwrap();
        fc.reshape(&[&x], &mut top).unwrap();
        fc.forward_cpu(&[&x], &mut top).unwrap();
        top[0].fill_gradient(1.0);

        fc.backward_cpu(&[&top[0]], &[false], &[&x]).unwrap();
        fc.backward_cpu(&[&top[0]], &[false], &[&x]).unwrap();
        assert_eq!(&*fc.blobs[0].gradient(), &[2.0, 2.0]);

        fc.set_param_propagate_down(0, false);
        fc.backward_cpu(&[&top[0]], &[false], &[&x]).unwrap();
        assert_eq!(&*fc.blobs[0].gradient(), &[2.0, 2.0]);
        assert_eq!(&*fc.blobs[1].gradient(), &[3.0]);
    }

    #[test]
    fn test_reshape_rejects_changed_input_width() {
        let mut fc = layer(2);
        let x = Tensor::new(&[4, 3]);
        let mut top = vec![Tensor::default()];
        fc.layer_setup(&[&x], &mut top).unwrap();
        let wider = Tensor::new(&[4, 5]);
        assert!(matches!(
            fc.reshape(&[&wider], &mut top),
            Err(LayerError::ShapeMismatch(_))
        ));
    }
}
