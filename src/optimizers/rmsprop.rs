//! RMSProp: градиент делится на скользящий корень среднего квадрата.

use super::{zeroed_like, OptimizerError, Result, UpdateRule};
use crate::tensor::Tensor;
use ndarray::{azip, ArrayViewMut1};

pub struct RmsProp {
    rms_decay: f32,
    delta: f32,
    history: Vec<Tensor>,
}

impl RmsProp {
    pub fn new(params: &[Tensor], rms_decay: f32, delta: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&rms_decay) {
            return Err(OptimizerError::InvalidConfig(format!(
                "rms_decay must be in [0, 1), got {}",
                rms_decay
            )));
        }
        if !(delta > 0.0) {
            return Err(OptimizerError::InvalidConfig(format!(
                "RMSProp delta must be positive, got {}",
                delta
            )));
        }
        Ok(Self {
            rms_decay,
            delta,
            history: zeroed_like(params),
        })
    }
}

impl UpdateRule for RmsProp {
    fn name(&self) -> &'static str {
        "RMSProp"
    }

    fn compute_update_value(&mut self, index: usize, param: &Tensor, rate: f32, lr_mult: f32) {
        let local_rate = rate * lr_mult;
        let (d, eps) = (self.rms_decay, self.delta);
        let mut mean_square = self.history[index].value_mut();
        let mut gradient = param.gradient_mut();

        let mut e = ArrayViewMut1::from(&mut mean_square[..]);
        let mut g = ArrayViewMut1::from(&mut gradient[..]);
        azip!((g in &mut g, e in &mut e) {
            *e = d * *e + (1.0 - d) * *g * *g;
            *g = local_rate * *g / (e.sqrt() + eps);
        });
    }

    fn history(&self) -> &[Tensor] {
        &self.history
    }

    fn history_mut(&mut self) -> &mut [Tensor] {
        &mut self.history
    }
}
