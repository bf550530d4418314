//! Слой точности классификации (top-k).

use crate::nn::config::LayerConfig;
use crate::nn::layer::{Layer, LayerError, Result};
use crate::tensor::Tensor;

/// Доля примеров, у которых правильный класс входит в `top_k` лучших.
///
/// Входы: оценки `[outer, classes, inner]` и метки (`outer * inner` штук).
/// Выходы: скалярная точность и, опционально, точность по каждому классу.
pub struct Accuracy {
    top_k: usize,
    axis: isize,
    ignore_label: Option<i32>,
    outer_num: usize,
    inner_num: usize,
}

impl Accuracy {
    pub fn new(config: &LayerConfig) -> Result<Self> {
        let params = &config.accuracy;
        if params.top_k == 0 {
            return Err(LayerError::InvalidConfig(
                "Accuracy needs top_k >= 1".to_string(),
            ));
        }
        Ok(Self {
            top_k: params.top_k,
            axis: params.axis,
            ignore_label: params.ignore_label,
            outer_num: 0,
            inner_num: 0,
        })
    }
}

impl Layer for Accuracy {
    fn layer_type(&self) -> &'static str {
        "Accuracy"
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

    fn allow_force_backward(&self, _bottom_index: usize) -> bool {
        false
    }

    fn reshape(&mut self, bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()> {
        let axis = bottom[0].canonical_axis_index(self.axis);
        let classes = bottom[0].shape()[axis];
        if self.top_k > classes {
            return Err(LayerError::InvalidConfig(format!(
                "top_k ({}) must not exceed the number of classes ({})",
                self.top_k, classes
            )));
        }
        self.outer_num = bottom[0].count_range(0, axis);
        self.inner_num = bottom[0].count_from(axis + 1);
        if self.outer_num * self.inner_num != bottom[1].count() {
            return Err(LayerError::ShapeMismatch(format!(
                "number of labels {} must match the number of predictions {}",
                bottom[1].count(),
                self.outer_num * self.inner_num
            )));
        }
        top[0].reshape(&[]);
        if top.len() > 1 {
            top[1].reshape(&[classes]);
        }
        Ok(())
    }

    fn forward_cpu(&mut self, bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()> {
        let scores = bottom[0].value();
        let labels = bottom[1].value();
        let classes = bottom[0].count() / (self.outer_num * self.inner_num).max(1);
        let dim = classes * self.inner_num;

        let mut correct = 0usize;
        let mut count = 0usize;
        let mut class_correct = vec![0usize; classes];
        let mut class_count = vec![0usize; classes];

        for i in 0..self.outer_num {
            for j in 0..self.inner_num {
                let label = labels[i * self.inner_num + j] as i32;
                if self.ignore_label == Some(label) {
                    continue;
                }
                if label < 0 || label as usize >= classes {
                    return Err(LayerError::InvalidConfig(format!(
                        "label {} is outside [0, {})",
                        label, classes
                    )));
                }
                let label = label as usize;
                let at = |c: usize| i * dim + c * self.inner_num + j;
                let target = scores[at(label)];
                // Ранг метки: сколько классов строго лучше нее.
                let better = (0..classes).filter(|&c| scores[at(c)] > target).count();
                class_count[label] += 1;
                count += 1;
                if better < self.top_k {
                    correct += 1;
                    class_correct[label] += 1;
                }
            }
        }

        top[0].value_mut()[0] = if count == 0 {
            0.0
        } else {
            correct as f32 / count as f32
        };
        if top.len() > 1 {
            let mut per_class = top[1].value_mut();
            for (c, out) in per_class.iter_mut().enumerate() {
                *out = if class_count[c] == 0 {
                    0.0
                } else {
                    class_correct[c] as f32 / class_count[c] as f32
                };
            }
        }
        Ok(())
    }

    fn backward_cpu(
        &mut self,
        _top: &[&Tensor],
        propagate_down: &[bool],
        _bottom: &[&Tensor],
    ) -> Result<()> {
        if propagate_down.iter().any(|&p| p) {
            return Err(LayerError::Unimplemented("Accuracy backward".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn run(config: &LayerConfig, scores: &Tensor, labels: &Tensor, tops: usize) -> Vec<Tensor> {
        let mut layer = Accuracy::new(config).unwrap();
        let mut top: Vec<Tensor> = (0..tops).map(|_| Tensor::default()).collect();
        layer.reshape(&[scores, labels], &mut top).unwrap();
        layer.forward_cpu(&[scores, labels], &mut top).unwrap();
        top
    }

    #[test]
    fn test_top1_and_per_class() {
        let scores = Tensor::from_slice(
            &[4, 3],
            &[
                0.9, 0.05, 0.05, // 0 - верно
                0.1, 0.8, 0.1, // 1 - верно
                0.6, 0.3, 0.1, // 1 - неверно
                0.2, 0.2, 0.6, // 2 - верно
            ],
        );
        let labels = Tensor::from_slice(&[4], &[0.0, 1.0, 1.0, 2.0]);
        let top = run(&LayerConfig::new("acc", "Accuracy"), &scores, &labels, 2);
        assert_relative_eq!(top[0].value()[0], 0.75);
        assert_eq!(&*top[1].value(), &[1.0, 0.5, 1.0]);
    }

    #[test]
    fn test_top_k_and_ignore_label() {
        let scores = Tensor::from_slice(&[2, 3], &[0.6, 0.3, 0.1, 0.1, 0.2, 0.7]);
        let labels = Tensor::from_slice(&[2], &[1.0, 0.0]);
        let mut config = LayerConfig::new("acc", "Accuracy");
        config.accuracy.top_k = 2;
        let top = run(&config, &scores, &labels, 1);
        assert_relative_eq!(top[0].value()[0], 0.5);

        config.accuracy.ignore_label = Some(0);
        let top = run(&config, &scores, &labels, 1);
        assert_relative_eq!(top[0].value()[0], 1.0);
    }

    #[test]
    fn test_backward_is_rejected() {
        let mut layer = Accuracy::new(&LayerConfig::new("acc", "Accuracy")).unwrap();
        let t = Tensor::new(&[1]);
        assert!(layer.backward_cpu(&[&t], &[true, false], &[&t, &t]).is_err());
        assert!(layer.backward_cpu(&[&t], &[false, false], &[&t, &t]).is_ok());
    }
}
