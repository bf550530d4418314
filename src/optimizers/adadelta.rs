//! AdaDelta: шаг без глобальной скорости обучения.
//!
//! ```text
//! E[g²] = m * E[g²] + (1 - m) * g²
//! Δ     = g * sqrt(E[Δ²] + eps) / sqrt(E[g²] + eps)
//! E[Δ²] = m * E[Δ²] + (1 - m) * Δ²
//! grad  = lr_mult * Δ
//! ```

use super::{zeroed_like, OptimizerError, Result, UpdateRule};
use crate::tensor::Tensor;
use ndarray::{azip, ArrayViewMut1};

pub struct AdaDelta {
    momentum: f32,
    delta: f32,
    /// E[g²]
    history: Vec<Tensor>,
    /// E[Δ²]
    update: Vec<Tensor>,
}

impl AdaDelta {
    pub fn new(params: &[Tensor], momentum: f32, delta: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&momentum) {
            return Err(OptimizerError::InvalidConfig(format!(
                "AdaDelta momentum must be in [0, 1), got {}",
                momentum
            )));
        }
        if delta <= 0.0 {
            return Err(OptimizerError::InvalidConfig(format!(
                "AdaDelta delta must be positive, got {}",
                delta
            )));
        }
        Ok(Self {
            momentum,
            delta,
            history: zeroed_like(params),
            update: zeroed_like(params),
        })
    }
}

impl UpdateRule for AdaDelta {
    fn name(&self) -> &'static str {
        "AdaDelta"
    }

    // Базовая скорость обучения в AdaDelta не участвует.
    fn compute_update_value(&mut self, index: usize, param: &Tensor, _rate: f32, lr_mult: f32) {
        let (m, eps) = (self.momentum, self.delta);
        let mut sq_grad = self.history[index].value_mut();
        let mut sq_update = self.update[index].value_mut();
        let mut gradient = param.gradient_mut();

        let mut g = ArrayViewMut1::from(&mut gradient[..]);
        let mut eg = ArrayViewMut1::from(&mut sq_grad[..]);
        let mut ed = ArrayViewMut1::from(&mut sq_update[..]);
        azip!((g in &mut g, eg in &mut eg, ed in &mut ed) {
            *eg = m * *eg + (1.0 - m) * *g * *g;
            let step = *g * ((*ed + eps).sqrt() / (*eg + eps).sqrt());
            *ed = m * *ed + (1.0 - m) * step * step;
            *g = lr_mult * step;
        });
    }

    fn history(&self) -> &[Tensor] {
        &self.history
    }

    fn history_mut(&mut self) -> &mut [Tensor] {
        &mut self.history
    }

    fn update_history(&self) -> &[Tensor] {
        &self.update
    }

    fn update_history_mut(&mut self) -> &mut [Tensor] {
        &mut self.update
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_constant_gradient_recurrence() {
        let (m, eps, g, lr_mult) = (0.95f64, 1e-6f64, 0.5f64, 2.0f64);
        let param = Tensor::from_slice(&[1], &[0.0]);
        let mut rule = AdaDelta::new(std::slice::from_ref(&param), m as f32, eps as f32).unwrap();

        let mut ed = 0.0f64;
        for t in 1..=5 {
            param.gradient_mut()[0] = g as f32;
            rule.compute_update_value(0, &param, 123.0, lr_mult as f32);

            // E[g²] после t шагов с постоянным g: (1 - m^t) g²
            let eg = (1.0 - m.powi(t)) * g * g;
            let step = g * (ed + eps).sqrt() / (eg + eps).sqrt();
            ed = m * ed + (1.0 - m) * step * step;

            assert_relative_eq!(rule.history()[0].value()[0] as f64, eg, max_relative = 1e-4);
            assert_relative_eq!(rule.update_history()[0].value()[0] as f64, ed, max_relative = 1e-3);
            assert_relative_eq!(param.gradient()[0] as f64, lr_mult * step, max_relative = 1e-3);
        }
    }

    #[test]
    fn test_rejects_bad_settings() {
        assert!(AdaDelta::new(&[], 1.0, 1e-6).is_err());
        assert!(AdaDelta::new(&[], 0.9, 0.0).is_err());
    }
}
