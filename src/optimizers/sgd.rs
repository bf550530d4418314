//! Stochastic Gradient Descent с моментом.

use super::{zeroed_like, UpdateRule};
use crate::tensor::Tensor;
use ndarray::{azip, ArrayView1, ArrayViewMut1};

pub struct Sgd {
    momentum: f32,
    history: Vec<Tensor>,
}

impl Sgd {
    pub fn new(params: &[Tensor], momentum: f32) -> Self {
        Self {
            momentum,
            history: zeroed_like(params),
        }
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }
}

impl UpdateRule for Sgd {
    fn name(&self) -> &'static str {
        "SGD"
    }

    fn compute_update_value(&mut self, index: usize, param: &Tensor, rate: f32, lr_mult: f32) {
        let local_rate = rate * lr_mult;
        let momentum = self.momentum;
        let mut history = self.history[index].value_mut();
        let mut gradient = param.gradient_mut();

        // history = momentum * history + local_rate * grad; grad = history
        let mut h = ArrayViewMut1::from(&mut history[..]);
        let g = ArrayView1::from(&gradient[..]);
        azip!((h in &mut h, &g in &g) *h = momentum * *h + local_rate * g);
        gradient.copy_from_slice(&history);
    }

    fn history(&self) -> &[Tensor] {
        &self.history
    }

    fn history_mut(&mut self) -> &mut [Tensor] {
        &mut self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_momentum_accumulates() {
        let param = Tensor::from_slice(&[2], &[1.0, 1.0]);
        let mut sgd = Sgd::new(std::slice::from_ref(&param), 0.9);

        param.gradient_mut().copy_from_slice(&[1.0, -2.0]);
        sgd.compute_update_value(0, &param, 0.1, 1.0);
        assert_abs_diff_eq!(param.gradient()[0], 0.1, epsilon = 1e-6);
        assert_abs_diff_eq!(param.gradient()[1], -0.2, epsilon = 1e-6);

        param.gradient_mut().copy_from_slice(&[1.0, -2.0]);
        sgd.compute_update_value(0, &param, 0.1, 2.0);
        // 0.9 * 0.1 + 0.2 * 1.0
        assert_abs_diff_eq!(param.gradient()[0], 0.29, epsilon = 1e-6);
        assert_abs_diff_eq!(sgd.history()[0].value()[1], -0.58, epsilon = 1e-6);

        param.update();
        assert_abs_diff_eq!(param.value()[0], 0.71, epsilon = 1e-6);
    }
}
