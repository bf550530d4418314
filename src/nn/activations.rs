//! Слои-активации.

use crate::nn::config::LayerConfig;
use crate::nn::layer::{DeviceKernels, Layer, Result};
use crate::tensor::Tensor;
use ndarray::{azip, ArrayView1, ArrayViewMut1};

// --- Слой ReLU ---

/// Слой активации ReLU (Rectified Linear Unit), в том числе "leaky"-вариант.
///
/// `y = max(x, 0) + negative_slope * min(x, 0)`.
/// Слой не имеет обучаемых параметров.
pub struct ReLU {
    negative_slope: f32,
}

impl ReLU {
    pub fn new(config: &LayerConfig) -> Self {
        Self {
            negative_slope: config.relu.negative_slope,
        }
    }

    pub fn with_slope(negative_slope: f32) -> Self {
        Self { negative_slope }
    }
}

fn relu_forward(x: &[f32], y: &mut [f32], slope: f32) {
    azip!((y in ArrayViewMut1::from(y), &x in ArrayView1::from(x)) {
        *y = x.max(0.0) + slope * x.min(0.0);
    });
}

fn relu_backward(x: &[f32], dy: &[f32], dx: &mut [f32], slope: f32) {
    azip!((dx in ArrayViewMut1::from(dx), &dy in ArrayView1::from(dy), &x in ArrayView1::from(x)) {
        *dx = if x > 0.0 { dy } else { dy * slope };
    });
}

impl Layer for ReLU {
    fn layer_type(&self) -> &'static str {
        "ReLU"
    }

    fn exact_num_bottoms(&self) -> Option<usize> {
        Some(1)
    }

    fn exact_num_tops(&self) -> Option<usize> {
        Some(1)
    }

    fn reshape(&mut self, bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()> {
        top[0].reshape_like(bottom[0]);
        Ok(())
    }

    fn forward_cpu(&mut self, bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()> {
        relu_forward(&bottom[0].value(), &mut top[0].value_mut(), self.negative_slope);
        Ok(())
    }

    fn backward_cpu(
        &mut self,
        top: &[&Tensor],
        propagate_down: &[bool],
        bottom: &[&Tensor],
    ) -> Result<()> {
        if propagate_down[0] {
            relu_backward(
                &bottom[0].value(),
                &top[0].gradient(),
                &mut bottom[0].gradient_mut(),
                self.negative_slope,
            );
        }
        Ok(())
    }

    fn device_kernels(&mut self) -> Option<&mut dyn DeviceKernels> {
        Some(self)
    }
}

impl DeviceKernels for ReLU {
    fn forward_device(&mut self, bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()> {
        relu_forward(
            &bottom[0].device_value(),
            &mut top[0].device_value_mut(),
            self.negative_slope,
        );
        Ok(())
    }

    fn backward_device(
        &mut self,
        top: &[&Tensor],
        propagate_down: &[bool],
        bottom: &[&Tensor],
    ) -> Result<()> {
        if propagate_down[0] {
            relu_backward(
                &bottom[0].device_value(),
                &top[0].device_gradient(),
                &mut bottom[0].device_gradient_mut(),
                self.negative_slope,
            );
        }
        Ok(())
    }
}
