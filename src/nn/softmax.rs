//! Слой Softmax по произвольной оси.
//!
//! Вход рассматривается как `[outer_num, channels, inner_num]`, где
//! `channels` - размер оси softmax.

use crate::nn::config::LayerConfig;
use crate::nn::layer::{Layer, Result};
use crate::tensor::Tensor;

pub struct Softmax {
    axis: isize,
    outer_num: usize,
    channels: usize,
    inner_num: usize,
}

impl Softmax {
    pub fn new(config: &LayerConfig) -> Self {
        Self::with_axis(config.softmax.axis)
    }

    pub fn with_axis(axis: isize) -> Self {
        Self {
            axis,
            outer_num: 0,
            channels: 0,
            inner_num: 0,
        }
    }

    pub fn outer_num(&self) -> usize {
        self.outer_num
    }

    pub fn inner_num(&self) -> usize {
        self.inner_num
    }

    pub fn channels(&self) -> usize {
        self.channels
    }
}

/// Численно устойчивый softmax (с вычитанием максимума).
pub(crate) fn softmax_forward(x: &[f32], y: &mut [f32], outer: usize, channels: usize, inner: usize) {
    let dim = channels * inner;
    for i in 0..outer {
        for j in 0..inner {
            let at = |c: usize| i * dim + c * inner + j;
            let max = (0..channels).map(|c| x[at(c)]).fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0;
            for c in 0..channels {
                let e = (x[at(c)] - max).exp();
                y[at(c)] = e;
                sum += e;
            }
            for c in 0..channels {
                y[at(c)] /= sum;
            }
        }
    }
}

/// `dx = (dy - Σ_c dy·y) * y`.
fn softmax_backward(
    y: &[f32],
    dy: &[f32],
    dx: &mut [f32],
    outer: usize,
    channels: usize,
    inner: usize,
) {
    let dim = channels * inner;
    for i in 0..outer {
        for j in 0..inner {
            let at = |c: usize| i * dim + c * inner + j;
            let dot: f32 = (0..channels).map(|c| dy[at(c)] * y[at(c)]).sum();
            for c in 0..channels {
                dx[at(c)] = (dy[at(c)] - dot) * y[at(c)];
            }
        }
    }
}

impl Layer for Softmax {
    fn layer_type(&self) -> &'static str {
        "Softmax"
    }

    fn exact_num_bottoms(&self) -> Option<usize> {
        Some(1)
    }

    fn exact_num_tops(&self) -> Option<usize> {
        Some(1)
    }

    fn reshape(&mut self, bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()> {
        let axis = bottom[0].canonical_axis_index(self.axis);
        top[0].reshape_like(bottom[0]);
        self.outer_num = bottom[0].count_range(0, axis);
        self.channels = bottom[0].shape()[axis];
        self.inner_num = bottom[0].count_from(axis + 1);
        Ok(())
    }

    fn forward_cpu(&mut self, bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()> {
        softmax_forward(
            &bottom[0].value(),
            &mut top[0].value_mut(),
            self.outer_num,
            self.channels,
            self.inner_num,
        );
        Ok(())
    }

    fn backward_cpu(
        &mut self,
        top: &[&Tensor],
        propagate_down: &[bool],
        bottom: &[&Tensor],
    ) -> Result<()> {
        if propagate_down[0] {
            softmax_backward(
                &top[0].value(),
                &top[0].gradient(),
                &mut bottom[0].gradient_mut(),
                self.outer_num,
                self.channels,
                self.inner_num,
            );
        }
        Ok(())
    }
}
