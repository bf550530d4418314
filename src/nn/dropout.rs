//! Dropout слой для регуляризации.
//!
//! В фазе TRAIN каждый элемент сохраняется с вероятностью `1 - p`
//! (маска Бернулли) и обнуляется иначе. В фазе TEST выход масштабируется
//! на `1 - p`, чтобы математическое ожидание совпадало с обучением.

use crate::nn::config::{LayerConfig, Phase};
use crate::nn::layer::{Layer, LayerError, Result};
use crate::runtime::Context;
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;

/// Слой Dropout.
///
/// # Пример
/// ```ignore
/// let config = LayerConfig::new("drop1", "Dropout");
/// let dropout = Dropout::new(&config, Phase::Train, &ctx)?; // p = 0.5
/// ```
pub struct Dropout {
    /// Вероятность обнуления (0.0 - 1.0)
    ratio: f32,
    phase: Phase,
    /// Маска последнего прямого прохода (1.0 - элемент сохранен).
    mask: Vec<f32>,
    rng: StdRng,
}

impl Dropout {
    /// Создаёт слой Dropout.
    ///
    /// Возвращает ошибку конфигурации, если `dropout_ratio` не в диапазоне `[0, 1)`.
    pub fn new(config: &LayerConfig, phase: Phase, ctx: &Context) -> Result<Self> {
        let ratio = config.dropout.dropout_ratio;
        if !(0.0..1.0).contains(&ratio) {
            return Err(LayerError::InvalidConfig(format!(
                "dropout probability must be in [0, 1), got {}",
                ratio
            )));
        }
        Ok(Self {
            ratio,
            phase,
            mask: Vec::new(),
            rng: ctx.fork_rng(),
        })
    }

    pub fn ratio(&self) -> f32 {
        self.ratio
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }
}

impl Layer for Dropout {
    fn layer_type(&self) -> &'static str {
        "Dropout"
    }

    fn exact_num_bottoms(&self) -> Option<usize> {
        Some(1)
    }

    fn exact_num_tops(&self) -> Option<usize> {
        Some(1)
    }

    fn reshape(&mut self, bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()> {
        top[0].reshape_like(bottom[0]);
        self.mask.resize(bottom[0].count(), 0.0);
        Ok(())
    }

    fn forward_cpu(&mut self, bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()> {
        let x = bottom[0].value();
        let mut y = top[0].value_mut();
        match self.phase {
            Phase::Train => {
                let keep = 1.0 - self.ratio;
                for m in self.mask.iter_mut() {
                    *m = if self.rng.gen::<f32>() < keep { 1.0 } else { 0.0 };
                }
                for ((y, &x), &m) in y.iter_mut().zip(x.iter()).zip(&self.mask) {
                    *y = x * m;
                }
            }
            Phase::Test => {
                let scale = 1.0 - self.ratio;
                for (y, &x) in y.iter_mut().zip(x.iter()) {
                    *y = x * scale;
                }
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
        if !propagate_down[0] {
            return Ok(());
        }
        if self.phase == Phase::Test {
            return Err(LayerError::Unimplemented(
                "Dropout backward in the TEST phase".to_string(),
            ));
        }
        let dy = top[0].gradient();
        let mut dx = bottom[0].gradient_mut();
        for ((dx, &dy), &m) in dx.iter_mut().zip(dy.iter()).zip(&self.mask) {
            *dx = dy * m;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dropout(ratio: f32, phase: Phase) -> Result<Dropout> {
        let mut config = LayerConfig::new("drop", "Dropout");
        config.dropout.dropout_ratio = ratio;
        Dropout::new(&config, phase, &Context::default().with_seed(3))
    }

    #[test]
    fn test_dropout_creation() {
        let layer = dropout(0.3, Phase::Train).unwrap();
        assert_eq!(layer.ratio(), 0.3);
        assert_eq!(layer.phase(), Phase::Train);
    }

    #[test]
    fn test_dropout_invalid_p() {
        assert!(matches!(
            dropout(1.5, Phase::Train),
            Err(LayerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_train_mask_is_applied_to_gradient() {
        let mut layer = dropout(0.5, Phase::Train).unwrap();
        let x = Tensor::from_slice(&[1000], &vec![2.0; 1000]);
        let mut top = vec![Tensor::default()];
        layer.reshape(&[&x], &mut top).unwrap();
        layer.forward_cpu(&[&x], &mut top).unwrap();

        let y = top[0].value().to_vec();
        assert!(y.iter().all(|&v| v == 0.0 || v == 2.0));
        let kept = y.iter().filter(|&&v| v != 0.0).count();
        assert!((350..650).contains(&kept), "kept {} of 1000", kept);

        top[0].fill_gradient(1.0);
        layer.backward_cpu(&[&top[0]], &[true], &[&x]).unwrap();
        let dx = x.gradient().to_vec();
        for (dx, y) in dx.iter().zip(&y) {
            assert_eq!(*dx, if *y == 0.0 { 0.0 } else { 1.0 });
        }
    }

    #[test]
    fn test_test_phase_scales_and_has_no_backward() {
        let mut layer = dropout(0.25, Phase::Test).unwrap();
        let x = Tensor::from_slice(&[2], &[4.0, -8.0]);
        let mut top = vec![Tensor::default()];
        layer.reshape(&[&x], &mut top).unwrap();
        layer.forward_cpu(&[&x], &mut top).unwrap();
        assert_eq!(&*top[0].value(), &[3.0, -6.0]);

        let err = layer.backward_cpu(&[&top[0]], &[true], &[&x]).unwrap_err();
        assert!(matches!(err, LayerError::Unimplemented(_)));
    }
}
