//! Модуль, содержащий правила обновления обучаемых параметров.
//!
//! Правило получает параметр с уже накопленным градиентом и превращает
//! градиент в готовый шаг: после `compute_update_value` буфер градиента
//! содержит величину, которую `Tensor::update` вычтет из значений.
//!
//! Здесь же общие шаги перед правилом: обрезка по глобальной норме,
//! нормализация по `iter_size` и регуляризация.

pub mod adadelta;
pub mod lr_policy;
pub mod rmsprop;
pub mod sgd;

pub use adadelta::AdaDelta;
pub use lr_policy::LrPolicy;
pub use rmsprop::RmsProp;
pub use sgd::Sgd;

use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum OptimizerError {
    #[error("unknown learning rate policy '{0}'")]
    UnknownPolicy(String),

    #[error("unknown regularization type '{0}'")]
    UnknownRegularizer(String),

    #[error("invalid optimizer setting: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, OptimizerError>;

/// Трейт, определяющий общий интерфейс для всех правил обновления.
pub trait UpdateRule: Send {
    fn name(&self) -> &'static str;

    /// Заменяет градиент параметра `index` шагом обновления.
    ///
    /// * `rate` - текущая скорость обучения солвера.
    /// * `lr_mult` - множитель скорости для этого параметра.
    fn compute_update_value(&mut self, index: usize, param: &Tensor, rate: f32, lr_mult: f32);

    /// История по одной на параметр; сохраняется в снапшотах.
    fn history(&self) -> &[Tensor];

    fn history_mut(&mut self) -> &mut [Tensor];

    /// Дополнительный буфер правила (AdaDelta хранит в нем E[Δ²]).
    fn update_history(&self) -> &[Tensor] {
        &[]
    }

    fn update_history_mut(&mut self) -> &mut [Tensor] {
        &mut []
    }
}

/// Тип правила обновления в конфигурации солвера.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RuleKind {
    #[default]
    #[serde(rename = "SGD")]
    Sgd,
    #[serde(rename = "AdaDelta")]
    AdaDelta,
    #[serde(rename = "RMSProp")]
    RmsProp,
}

/// Гиперпараметры правил.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleParams {
    pub momentum: f32,
    pub delta: f32,
    pub rms_decay: f32,
}

/// Создает правило с нулевой историей под формы `params`.
pub fn build_rule(kind: RuleKind, params: &[Tensor], hyper: RuleParams) -> Result<Box<dyn UpdateRule>> {
    Ok(match kind {
        RuleKind::Sgd => Box::new(Sgd::new(params, hyper.momentum)),
        RuleKind::AdaDelta => Box::new(AdaDelta::new(params, hyper.momentum, hyper.delta)?),
        RuleKind::RmsProp => Box::new(RmsProp::new(params, hyper.rms_decay, hyper.delta)?),
    })
}

/// История той же формы, что и параметры, заполненная нулями.
pub(crate) fn zeroed_like(params: &[Tensor]) -> Vec<Tensor> {
    params
        .iter()
        .map(|param| {
            let tensor = Tensor::new(param.shape());
            tensor.fill_value(0.0);
            tensor
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regularization {
    L1,
    L2,
}

impl Regularization {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "L1" => Ok(Self::L1),
            "L2" => Ok(Self::L2),
            other => Err(OptimizerError::UnknownRegularizer(other.to_string())),
        }
    }

    /// Добавляет к градиенту `decay * value` (L2) или `decay * sign(value)` (L1).
    pub fn apply(self, param: &Tensor, decay: f32) {
        if decay == 0.0 {
            return;
        }
        let value = param.value();
        let mut gradient = param.gradient_mut();
        match self {
            Self::L2 => {
                for (g, &v) in gradient.iter_mut().zip(value.iter()) {
                    *g += decay * v;
                }
            }
            Self::L1 => {
                for (g, &v) in gradient.iter_mut().zip(value.iter()) {
                    let sign = if v > 0.0 {
                        1.0
                    } else if v < 0.0 {
                        -1.0
                    } else {
                        0.0
                    };
                    *g += decay * sign;
                }
            }
        }
    }
}

/// Глобальная L2-норма всех градиентов.
pub fn global_gradient_norm(params: &[Tensor]) -> f32 {
    params
        .iter()
        .map(|param| param.sum_squared_gradient())
        .sum::<f32>()
        .sqrt()
}

/// Масштабирует все градиенты на `clip / norm`, если норма больше `clip`.
///
/// Отрицательный `clip` отключает обрезку. Возвращает норму до обрезки,
/// если обрезка произошла.
pub fn clip_gradients(params: &[Tensor], clip: f32) -> Option<f32> {
    if clip < 0.0 {
        return None;
    }
    let norm = global_gradient_norm(params);
    if norm <= clip {
        return None;
    }
    let factor = clip / norm;
    for param in params {
        param.scale_gradient(factor);
    }
    Some(norm)
}

/// Усредняет градиент, накопленный за `iter_size` проходов.
pub fn normalize(param: &Tensor, iter_size: usize) {
    if iter_size > 1 {
        param.scale_gradient(1.0 / iter_size as f32);
    }
}
