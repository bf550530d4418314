// --- File: src/losses.rs ---

//! Loss layers.
//!
//! # Available Loss Layers
//!
//! - **SoftmaxWithLoss**: softmax over a configurable axis followed by the
//!   multinomial logistic loss, with `ignore_label` and normalization options.

use crate::nn::config::LayerConfig;
use crate::nn::layer::{Layer, LayerError, Result};
use crate::nn::softmax::Softmax;
use crate::tensor::Tensor;
use std::slice;

// ============================================================================
// Softmax With Loss
// ============================================================================

/// Softmax followed by the negative log-likelihood of the target class.
///
/// Inputs: logits `[outer, classes, inner]` and `outer * inner` labels.
/// Outputs: the scalar loss and, optionally, the probabilities (the second
/// output shares the internal probability buffer instead of copying it).
///
/// Formula: `loss = -Σ log(max(p[label], f32::MIN_POSITIVE)) / normalizer`,
/// where the normalizer is the number of non-ignored labels when `normalize`
/// is set and `outer` otherwise.
pub struct SoftmaxWithLoss {
    softmax: Softmax,
    prob: Tensor,
    ignore_label: Option<i32>,
    normalize: bool,
    axis: isize,
    outer_num: usize,
    inner_num: usize,
    loss_weight: f32,
    /// Normalizer of the last forward pass, reused by backward.
    normalizer: f32,
}

impl SoftmaxWithLoss {
    pub fn new(config: &LayerConfig) -> Self {
        Self {
            softmax: Softmax::new(config),
            prob: Tensor::default(),
            ignore_label: config.loss.ignore_label,
            normalize: config.loss.normalize,
            axis: config.softmax.axis,
            outer_num: 0,
            inner_num: 0,
            loss_weight: 1.0,
            normalizer: 1.0,
        }
    }

    /// Probabilities computed by the last forward pass.
    pub fn prob(&self) -> &Tensor {
        &self.prob
    }

    fn label_at(&self, labels: &[f32], i: usize, j: usize, classes: usize) -> Result<Option<usize>> {
        let label = labels[i * self.inner_num + j] as i32;
        if self.ignore_label == Some(label) {
            return Ok(None);
        }
        if label < 0 || label as usize >= classes {
            return Err(LayerError::InvalidConfig(format!(
                "label {} is outside [0, {})",
                label, classes
            )));
        }
        Ok(Some(label as usize))
    }
}

impl Layer for SoftmaxWithLoss {
    fn layer_type(&self) -> &'static str {
        "SoftmaxWithLoss"
    }

    fn exact_num_bottoms(&self) -> Option<usize> {
        Some(2)
    }

    fn min_tops(&self) -> Option<usize> {
        Some(1)
    }

    fn max_tops(&self) -> Option<usize> {
        Some(2)
    }

    fn is_loss(&self) -> bool {
        true
    }

    fn set_loss_weights(&mut self, weights: &[f32]) {
        self.loss_weight = weights.first().copied().unwrap_or(1.0);
    }

    /// Labels never receive gradients.
    fn allow_force_backward(&self, bottom_index: usize) -> bool {
        bottom_index != 1
    }

    fn layer_setup(&mut self, bottom: &[&Tensor], _top: &mut [Tensor]) -> Result<()> {
        self.softmax
            .layer_setup(&bottom[..1], slice::from_mut(&mut self.prob))
    }

    fn reshape(&mut self, bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()> {
        self.softmax
            .reshape(&bottom[..1], slice::from_mut(&mut self.prob))?;
        let axis = bottom[0].canonical_axis_index(self.axis);
        self.outer_num = bottom[0].count_range(0, axis);
        self.inner_num = bottom[0].count_from(axis + 1);
        if self.outer_num * self.inner_num != bottom[1].count() {
            return Err(LayerError::ShapeMismatch(format!(
                "number of labels {} must match the number of predictions {} \
                 (labels must be [outer, inner] with the class axis removed)",
                bottom[1].count(),
                self.outer_num * self.inner_num
            )));
        }
        top[0].reshape(&[]);
        if top.len() > 1 {
            top[1].reshape_like(bottom[0]);
            top[1].share_value(&self.prob);
        }
        Ok(())
    }

    fn forward_cpu(&mut self, bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()> {
        self.softmax
            .forward_cpu(&bottom[..1], slice::from_mut(&mut self.prob))?;

        let classes = bottom[0].shape()[bottom[0].canonical_axis_index(self.axis)];
        let dim = classes * self.inner_num;
        let prob = self.prob.value();
        let labels = bottom[1].value();

        let mut loss = 0.0f32;
        let mut count = 0usize;
        for i in 0..self.outer_num {
            for j in 0..self.inner_num {
                let Some(label) = self.label_at(&labels, i, j, classes)? else {
                    continue;
                };
                let p = prob[i * dim + label * self.inner_num + j];
                loss -= p.max(f32::MIN_POSITIVE).ln();
                count += 1;
            }
        }

        self.normalizer = if self.normalize {
            count.max(1) as f32
        } else {
            self.outer_num.max(1) as f32
        };
        top[0].value_mut()[0] = loss / self.normalizer;
        Ok(())
    }

    fn backward_cpu(
        &mut self,
        _top: &[&Tensor],
        propagate_down: &[bool],
        bottom: &[&Tensor],
    ) -> Result<()> {
        if propagate_down.get(1).copied().unwrap_or(false) {
            return Err(LayerError::LabelGradient("SoftmaxWithLoss"));
        }
        if !propagate_down[0] {
            return Ok(());
        }

        let classes = bottom[0].shape()[bottom[0].canonical_axis_index(self.axis)];
        let dim = classes * self.inner_num;
        let labels = bottom[1].value();
        let mut dx = bottom[0].gradient_mut();
        dx.copy_from_slice(&self.prob.value());

        for i in 0..self.outer_num {
            for j in 0..self.inner_num {
                match self.label_at(&labels, i, j, classes)? {
                    Some(label) => dx[i * dim + label * self.inner_num + j] -= 1.0,
                    None => {
                        for c in 0..classes {
                            dx[i * dim + c * self.inner_num + j] = 0.0;
                        }
                    }
                }
            }
        }

        let scale = self.loss_weight / self.normalizer;
        dx.iter_mut().for_each(|g| *g *= scale);
        Ok(())
    }
}
