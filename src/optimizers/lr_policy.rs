//! Политики изменения скорости обучения по итерациям.

use super::{OptimizerError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum LrPolicy {
    /// `base_lr`
    Fixed,
    /// `base_lr * gamma ^ floor(iter / stepsize)`
    Step { gamma: f32, stepsize: usize },
    /// `base_lr * gamma ^ iter`
    Exp { gamma: f32 },
    /// `base_lr * (1 + gamma * iter) ^ (-power)`
    Inv { gamma: f32, power: f32 },
    /// Как `Step`, но шаги в заданных итерациях.
    MultiStep { gamma: f32, stepvalues: Vec<usize> },
    /// `base_lr * (1 - iter / max_iter) ^ power`
    Poly { power: f32, max_iter: usize },
}

impl LrPolicy {
    /// Разбирает политику по имени из конфигурации солвера.
    pub fn parse(
        name: &str,
        gamma: f32,
        power: f32,
        stepsize: usize,
        stepvalues: &[usize],
        max_iter: usize,
    ) -> Result<Self> {
        let policy = match name {
            "fixed" => Self::Fixed,
            "step" => {
                if stepsize == 0 {
                    return Err(OptimizerError::InvalidConfig(
                        "the step policy needs stepsize > 0".to_string(),
                    ));
                }
                Self::Step { gamma, stepsize }
            }
            "exp" => Self::Exp { gamma },
            "inv" => Self::Inv { gamma, power },
            "multistep" => {
                if stepvalues.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(OptimizerError::InvalidConfig(
                        "stepvalues must be strictly increasing".to_string(),
                    ));
                }
                Self::MultiStep {
                    gamma,
                    stepvalues: stepvalues.to_vec(),
                }
            }
            "poly" => {
                if max_iter == 0 {
                    return Err(OptimizerError::InvalidConfig(
                        "the poly policy needs max_iter > 0".to_string(),
                    ));
                }
                Self::Poly { power, max_iter }
            }
            other => return Err(OptimizerError::UnknownPolicy(other.to_string())),
        };
        Ok(policy)
    }

    /// Скорость обучения на итерации `iter`.
    ///
    /// `current_step` - номер текущей ступени; политики `step` и `multistep`
    /// продвигают его, и он сохраняется в снапшоте солвера.
    pub fn learning_rate(&self, base_lr: f32, iter: usize, current_step: &mut usize) -> f32 {
        match self {
            Self::Fixed => base_lr,
            Self::Step { gamma, stepsize } => {
                *current_step = iter / stepsize;
                base_lr * gamma.powi(*current_step as i32)
            }
            Self::Exp { gamma } => base_lr * gamma.powf(iter as f32),
            Self::Inv { gamma, power } => base_lr * (1.0 + gamma * iter as f32).powf(-power),
            Self::MultiStep { gamma, stepvalues } => {
                while *current_step < stepvalues.len() && iter >= stepvalues[*current_step] {
                    *current_step += 1;
                    tracing::info!(
                        "MultiStep Status: Iteration {}, step = {}",
                        iter,
                        current_step
                    );
                }
                base_lr * gamma.powi(*current_step as i32)
            }
            Self::Poly { power, max_iter } => {
                let progress = (iter as f32 / *max_iter as f32).min(1.0);
                base_lr * (1.0 - progress).powf(*power)
            }
        }
    }
}
