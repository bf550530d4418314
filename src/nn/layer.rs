//! The `Layer` trait and the runner that drives a layer inside a network.
//!
//! A layer is a polymorphic unit with the lifecycle
//! `layer_setup -> reshape -> (loss-weight registration)` followed by any
//! number of `forward` / `backward` calls. Layers never decide on their own
//! whether to run on the host or on the device: [`LayerInstance`] reads the
//! mode from the explicit [`Context`] and falls back to the CPU kernel when a
//! layer has no device kernels.

use crate::data::DataError;
use crate::nn::config::LayerConfig;
use crate::runtime::{Context, Mode};
use crate::tensor::Tensor;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LayerError {
    #[error("unknown layer type '{0}'")]
    UnknownType(String),

    #[error("unknown filler type '{0}'")]
    UnknownFiller(String),

    #[error("{layer_type} expects {expected} {what} tensor(s), got {actual}")]
    TensorCount {
        layer_type: &'static str,
        what: &'static str,
        expected: String,
        actual: usize,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("{0} cannot backpropagate to label inputs")]
    LabelGradient(&'static str),

    #[error("{0} is not implemented")]
    Unimplemented(String),

    #[error(transparent)]
    Data(#[from] DataError),
}

pub type Result<T> = std::result::Result<T, LayerError>;

/// Optional device implementation of a layer.
pub trait DeviceKernels {
    fn forward_device(&mut self, bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()>;

    fn backward_device(
        &mut self,
        top: &[&Tensor],
        propagate_down: &[bool],
        bottom: &[&Tensor],
    ) -> Result<()>;
}

pub trait Layer: Send {
    fn layer_type(&self) -> &'static str;

    /// One-time setup: validates the configuration against the inputs and
    /// allocates learnable parameters.
    fn layer_setup(&mut self, _bottom: &[&Tensor], _top: &mut [Tensor]) -> Result<()> {
        Ok(())
    }

    /// Adjusts output shapes (and internal buffers) to the current input shapes.
    /// Called on every forward pass.
    fn reshape(&mut self, bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()>;

    fn forward_cpu(&mut self, bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()>;

    /// Computes input gradients for the inputs flagged in `propagate_down`
    /// and accumulates parameter gradients.
    fn backward_cpu(
        &mut self,
        top: &[&Tensor],
        propagate_down: &[bool],
        bottom: &[&Tensor],
    ) -> Result<()>;

    fn device_kernels(&mut self) -> Option<&mut dyn DeviceKernels> {
        None
    }

    /// Learnable parameters owned by the layer.
    fn blobs(&self) -> &[Tensor] {
        &[]
    }

    fn blobs_mut(&mut self) -> &mut [Tensor] {
        &mut []
    }

    /// Whether parameter `index` needs its gradient computed.
    fn set_param_propagate_down(&mut self, _index: usize, _value: bool) {}

    /// Loss layers get a weight of 1 on their first output unless configured.
    fn is_loss(&self) -> bool {
        false
    }

    /// Receives the final per-output loss weights during setup.
    fn set_loss_weights(&mut self, _weights: &[f32]) {}

    /// Whether gradients may be forced into input `bottom_index`.
    fn allow_force_backward(&self, _bottom_index: usize) -> bool {
        true
    }

    /// Whether worker networks should share this instance with the root network.
    fn share_in_parallel(&self) -> bool {
        false
    }

    fn exact_num_bottoms(&self) -> Option<usize> {
        None
    }

    fn min_bottoms(&self) -> Option<usize> {
        None
    }

    fn max_bottoms(&self) -> Option<usize> {
        None
    }

    fn exact_num_tops(&self) -> Option<usize> {
        None
    }

    fn min_tops(&self) -> Option<usize> {
        None
    }

    fn max_tops(&self) -> Option<usize> {
        None
    }
}

/// Holds a layer either exclusively or shared between networks.
///
/// Calls into a shared layer lock its mutex for the whole call.
pub enum LayerSlot {
    Owned(Box<dyn Layer>),
    Shared(Arc<Mutex<Box<dyn Layer>>>),
}

impl LayerSlot {
    pub fn with<R>(&mut self, f: impl FnOnce(&mut dyn Layer) -> R) -> R {
        match self {
            LayerSlot::Owned(layer) => f(layer.as_mut()),
            LayerSlot::Shared(layer) => {
                let mut guard = layer.lock();
                f(guard.as_mut())
            }
        }
    }

    /// Read-only access for callers that only hold `&self`.
    pub fn with_ref<R>(&self, f: impl FnOnce(&dyn Layer) -> R) -> R {
        match self {
            LayerSlot::Owned(layer) => f(layer.as_ref()),
            LayerSlot::Shared(layer) => {
                let guard = layer.lock();
                f(guard.as_ref())
            }
        }
    }

    /// Converts an owned layer into a shared one and returns the handle.
    pub fn share(&mut self) -> Arc<Mutex<Box<dyn Layer>>> {
        if let LayerSlot::Shared(layer) = self {
            return Arc::clone(layer);
        }
        let shared = match std::mem::replace(self, LayerSlot::Owned(Box::new(Placeholder))) {
            LayerSlot::Owned(layer) => Arc::new(Mutex::new(layer)),
            LayerSlot::Shared(layer) => layer,
        };
        *self = LayerSlot::Shared(Arc::clone(&shared));
        shared
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, LayerSlot::Shared(_))
    }

    pub fn same_layer(&self, other: &LayerSlot) -> bool {
        match (self, other) {
            (LayerSlot::Shared(a), LayerSlot::Shared(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

// Fills the slot while the owned layer moves into its shared handle.
struct Placeholder;

impl Layer for Placeholder {
    fn layer_type(&self) -> &'static str {
        "Placeholder"
    }

    fn reshape(&mut self, _bottom: &[&Tensor], _top: &mut [Tensor]) -> Result<()> {
        Ok(())
    }

    fn forward_cpu(&mut self, _bottom: &[&Tensor], _top: &mut [Tensor]) -> Result<()> {
        Ok(())
    }

    fn backward_cpu(&mut self, _top: &[&Tensor], _pd: &[bool], _bottom: &[&Tensor]) -> Result<()> {
        Ok(())
    }
}

/// A configured layer as it lives inside a network.
pub struct LayerInstance {
    config: LayerConfig,
    slot: LayerSlot,
    loss_weights: Vec<f32>,
    ctx: Arc<Context>,
}

impl LayerInstance {
    pub fn new(config: LayerConfig, layer: Box<dyn Layer>, ctx: Arc<Context>) -> Self {
        Self {
            config,
            slot: LayerSlot::Owned(layer),
            loss_weights: Vec::new(),
            ctx,
        }
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn layer_type(&self) -> &'static str {
        self.slot.with_ref(|layer| layer.layer_type())
    }

    pub fn loss_weights(&self) -> &[f32] {
        &self.loss_weights
    }

    pub fn loss_weight(&self, top_index: usize) -> f32 {
        self.loss_weights.get(top_index).copied().unwrap_or(0.0)
    }

    pub fn slot(&self) -> &LayerSlot {
        &self.slot
    }

    pub fn slot_mut(&mut self) -> &mut LayerSlot {
        &mut self.slot
    }

    /// Full setup: count checks, `layer_setup`, `reshape`, loss weights.
    pub fn setup(&mut self, bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()> {
        let configured = self.config.loss_weights.clone();
        let weights = self.slot.with(|layer| -> Result<Vec<f32>> {
            check_tensor_counts(layer, bottom.len(), top.len())?;
            layer.layer_setup(bottom, top)?;
            layer.reshape(bottom, top)?;

            let weights = if !configured.is_empty() {
                if configured.len() != top.len() {
                    return Err(LayerError::InvalidConfig(format!(
                        "loss_weights must be given for every output ({} tops, {} weights)",
                        top.len(),
                        configured.len()
                    )));
                }
                configured
            } else {
                let mut weights = vec![0.0; top.len()];
                if layer.is_loss() && !weights.is_empty() {
                    weights[0] = 1.0;
                }
                weights
            };
            layer.set_loss_weights(&weights);
            Ok(weights)
        })?;
        self.loss_weights = weights;
        Ok(())
    }

    /// Reshape, mode-dispatched forward, and the weighted loss of the outputs.
    pub fn forward(&mut self, bottom: &[&Tensor], top: &mut [Tensor]) -> Result<f32> {
        let mode = self.ctx.mode();
        self.slot.with(|layer| -> Result<()> {
            layer.reshape(bottom, top)?;
            if mode == Mode::Device {
                if let Some(kernels) = layer.device_kernels() {
                    return kernels.forward_device(bottom, top);
                }
            }
            layer.forward_cpu(bottom, top)
        })?;

        let mut loss = 0.0;
        for (tensor, &weight) in top.iter().zip(&self.loss_weights) {
            if weight != 0.0 {
                loss += weight * tensor.value().iter().sum::<f32>();
            }
        }
        Ok(loss)
    }

    pub fn backward(
        &mut self,
        top: &[&Tensor],
        propagate_down: &[bool],
        bottom: &[&Tensor],
    ) -> Result<()> {
        let mode = self.ctx.mode();
        self.slot.with(|layer| {
            if mode == Mode::Device {
                if let Some(kernels) = layer.device_kernels() {
                    return kernels.backward_device(top, propagate_down, bottom);
                }
            }
            layer.backward_cpu(top, propagate_down, bottom)
        })
    }

    pub fn num_blobs(&self) -> usize {
        self.slot.with_ref(|layer| layer.blobs().len())
    }

    /// Aliases of the learnable parameters (shared buffers).
    pub fn blob_aliases(&self) -> Vec<Tensor> {
        self.slot
            .with_ref(|layer| layer.blobs().iter().map(Tensor::alias).collect())
    }

    pub fn with_blobs_mut<R>(&mut self, f: impl FnOnce(&mut [Tensor]) -> R) -> R {
        self.slot.with(|layer| f(layer.blobs_mut()))
    }

    pub fn set_param_propagate_down(&mut self, index: usize, value: bool) {
        self.slot
            .with(|layer| layer.set_param_propagate_down(index, value));
    }

    pub fn allow_force_backward(&self, bottom_index: usize) -> bool {
        self.slot
            .with_ref(|layer| layer.allow_force_backward(bottom_index))
    }

    pub fn share_in_parallel(&self) -> bool {
        self.slot.with_ref(|layer| layer.share_in_parallel())
    }

    pub fn is_loss(&self) -> bool {
        self.slot.with_ref(|layer| layer.is_loss())
    }
}

fn check_tensor_counts(layer: &dyn Layer, bottoms: usize, tops: usize) -> Result<()> {
    let layer_type = layer.layer_type();
    let check = |what: &'static str,
                 actual: usize,
                 exact: Option<usize>,
                 min: Option<usize>,
                 max: Option<usize>|
     -> Result<()> {
        let err = |expected: String| LayerError::TensorCount {
            layer_type,
            what,
            expected,
            actual,
        };
        if let Some(exact) = exact {
            if actual != exact {
                return Err(err(format!("exactly {}", exact)));
            }
        }
        if let Some(min) = min {
            if actual < min {
                return Err(err(format!("at least {}", min)));
            }
        }
        if let Some(max) = max {
            if actual > max {
                return Err(err(format!("at most {}", max)));
            }
        }
        Ok(())
    };
    check(
        "bottom",
        bottoms,
        layer.exact_num_bottoms(),
        layer.min_bottoms(),
        layer.max_bottoms(),
    )?;
    check(
        "top",
        tops,
        layer.exact_num_tops(),
        layer.min_tops(),
        layer.max_tops(),
    )
}
