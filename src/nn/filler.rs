//! Инициализаторы параметров (fillers).

use super::layer::{LayerError, Result};
use crate::tensor::Tensor;
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Описание инициализатора в конфигурации слоя.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FillerConfig {
    #[serde(rename = "type")]
    pub filler_type: String,
    pub value: f32,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub std: f32,
}

impl Default for FillerConfig {
    fn default() -> Self {
        Self {
            filler_type: "constant".to_string(),
            value: 0.0,
            min: 0.0,
            max: 1.0,
            mean: 0.0,
            std: 1.0,
        }
    }
}

impl FillerConfig {
    pub fn constant(value: f32) -> Self {
        Self {
            value,
            ..Self::default()
        }
    }

    pub fn uniform(min: f32, max: f32) -> Self {
        Self {
            filler_type: "uniform".to_string(),
            min,
            max,
            ..Self::default()
        }
    }

    pub fn gaussian(mean: f32, std: f32) -> Self {
        Self {
            filler_type: "gaussian".to_string(),
            mean,
            std,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Filler {
    Constant(f32),
    Uniform { min: f32, max: f32 },
    Gaussian { mean: f32, std: f32 },
}

impl Filler {
    /// Разбирает конфигурацию; неизвестный тип - ошибка конфигурации.
    pub fn from_config(config: &FillerConfig) -> Result<Self> {
        match config.filler_type.as_str() {
            "constant" => Ok(Filler::Constant(config.value)),
            "uniform" => {
                if config.min >= config.max {
                    return Err(LayerError::InvalidConfig(format!(
                        "uniform filler needs min < max, got [{}, {}]",
                        config.min, config.max
                    )));
                }
                Ok(Filler::Uniform {
                    min: config.min,
                    max: config.max,
                })
            }
            "gaussian" => {
                if config.std < 0.0 {
                    return Err(LayerError::InvalidConfig(format!(
                        "gaussian filler needs std >= 0, got {}",
                        config.std
                    )));
                }
                Ok(Filler::Gaussian {
                    mean: config.mean,
                    std: config.std,
                })
            }
            other => Err(LayerError::UnknownFiller(other.to_string())),
        }
    }

    /// Заполняет значения тензора.
    pub fn fill<R: Rng + ?Sized>(&self, tensor: &Tensor, rng: &mut R) -> Result<()> {
        let shape = IxDyn(tensor.shape());
        let values: ArrayD<f32> = match *self {
            Filler::Constant(value) => ArrayD::from_elem(shape, value),
            Filler::Uniform { min, max } => ArrayD::random_using(shape, Uniform::new(min, max), rng),
            Filler::Gaussian { mean, std } => {
                let normal = Normal::new(mean, std)
                    .map_err(|e| LayerError::InvalidConfig(format!("gaussian filler: {}", e)))?;
                ArrayD::random_using(shape, normal, rng)
            }
        };
        let mut dst = tensor.value_mut();
        for (d, &v) in dst.iter_mut().zip(values.iter()) {
            *d = v;
        }
        Ok(())
    }
}
