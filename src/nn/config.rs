//! Конфигурация слоев.
//!
//! Разобранное (in-memory) описание слоя. Загружается из JSON через `serde`;
//! все поля, кроме имени и типа, имеют значения по умолчанию.

use crate::data::TransformConfig;
use crate::nn::filler::FillerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Фаза работы сети.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Train,
    Test,
}

/// Множители обучения для одного параметра слоя.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParamSpec {
    /// Множитель learning rate; `0` замораживает параметр.
    pub lr_mult: f32,
    /// Множитель коэффициента регуляризации.
    pub decay_mult: f32,
}

impl Default for ParamSpec {
    fn default() -> Self {
        Self {
            lr_mult: 1.0,
            decay_mult: 1.0,
        }
    }
}

/// Описание одного слоя сети.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub layer_type: String,
    #[serde(default)]
    pub bottoms: Vec<String>,
    #[serde(default)]
    pub tops: Vec<String>,
    /// Если задано, слой включается только в сеть этой фазы.
    #[serde(default)]
    pub phase: Option<Phase>,
    /// Веса выходов в общей функции потерь (по одному на выход).
    #[serde(default)]
    pub loss_weights: Vec<f32>,
    #[serde(default)]
    pub params: Vec<ParamSpec>,

    #[serde(default)]
    pub relu: ReluParams,
    #[serde(default)]
    pub dropout: DropoutParams,
    #[serde(default)]
    pub inner_product: InnerProductParams,
    #[serde(default)]
    pub softmax: SoftmaxParams,
    #[serde(default)]
    pub loss: LossParams,
    #[serde(default)]
    pub accuracy: AccuracyParams,
    #[serde(default)]
    pub data: DataParams,
    #[serde(default)]
    pub transform: TransformConfig,
}

impl LayerConfig {
    pub fn new(name: &str, layer_type: &str) -> Self {
        Self {
            name: name.to_string(),
            layer_type: layer_type.to_string(),
            ..Self::default()
        }
    }

    pub fn with_bottoms(mut self, bottoms: &[&str]) -> Self {
        self.bottoms = bottoms.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_tops(mut self, tops: &[&str]) -> Self {
        self.tops = tops.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_loss_weights(mut self, weights: &[f32]) -> Self {
        self.loss_weights = weights.to_vec();
        self
    }

    pub fn with_params(mut self, params: &[ParamSpec]) -> Self {
        self.params = params.to_vec();
        self
    }

    /// Множители для параметра с индексом `index` (по умолчанию `1.0 / 1.0`).
    pub fn param_spec(&self, index: usize) -> ParamSpec {
        self.params.get(index).copied().unwrap_or_default()
    }

    /// Входит ли слой в сеть фазы `phase`.
    pub fn included_in(&self, phase: Phase) -> bool {
        self.phase.map_or(true, |p| p == phase)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReluParams {
    pub negative_slope: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DropoutParams {
    pub dropout_ratio: f32,
}

impl Default for DropoutParams {
    fn default() -> Self {
        Self { dropout_ratio: 0.5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InnerProductParams {
    pub num_output: usize,
    pub bias_term: bool,
    /// Оси `[axis, rank)` сворачиваются в один вектор признаков.
    pub axis: isize,
    pub weight_filler: FillerConfig,
    pub bias_filler: FillerConfig,
}

impl Default for InnerProductParams {
    fn default() -> Self {
        Self {
            num_output: 0,
            bias_term: true,
            axis: 1,
            weight_filler: FillerConfig::default(),
            bias_filler: FillerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftmaxParams {
    pub axis: isize,
}

impl Default for SoftmaxParams {
    fn default() -> Self {
        Self { axis: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LossParams {
    pub ignore_label: Option<i32>,
    /// Делить на число учтенных примеров (иначе - на внешний размер).
    pub normalize: bool,
}

impl Default for LossParams {
    fn default() -> Self {
        Self {
            ignore_label: None,
            normalize: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccuracyParams {
    pub top_k: usize,
    pub axis: isize,
    pub ignore_label: Option<i32>,
}

impl Default for AccuracyParams {
    fn default() -> Self {
        Self {
            top_k: 1,
            axis: 1,
            ignore_label: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataParams {
    /// Путь к хранилищу примеров.
    pub source: PathBuf,
    pub batch_size: usize,
}
