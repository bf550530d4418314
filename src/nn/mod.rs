//! # Neural Network Layers Module
//!
//! Eager layers with hand-written forward and backward kernels.
//!
//! ## Available Layers
//!
//! ### Core Layers
//! - [`InnerProduct`]: Fully connected layer
//! - [`Split`]: Fans one tensor out to several consumers (inserted by the network)
//! - [`DataLayer`](crate::data::DataLayer): Prefetching input layer
//!
//! ### Activations
//! - [`ReLU`]: Rectified linear unit with optional negative slope
//! - [`Softmax`]: Softmax over a configurable axis
//!
//! ### Regularization
//! - [`Dropout`]: Bernoulli dropout
//!
//! ### Metrics and Losses
//! - [`Accuracy`]: Top-k classification accuracy
//! - [`SoftmaxWithLoss`](crate::losses::SoftmaxWithLoss): Softmax + multinomial logistic loss
//!
//! ## Example
//!
//! ```ignore
//! use rustylayers::nn::{LayerConfig, LayerRegistry, Phase};
//!
//! let registry = LayerRegistry::default();
//! let mut config = LayerConfig::new("fc1", "InnerProduct");
//! config.inner_product.num_output = 128;
//! let layer = registry.create(&config, Phase::Train, &ctx)?;
//! ```

pub mod accuracy;
pub mod activations;
pub mod config;
pub mod dropout;
pub mod filler;
pub mod layer;
pub mod linear;
pub mod registry;
pub mod softmax;
pub mod split;

pub use accuracy::Accuracy;
pub use activations::ReLU;
pub use config::{
    AccuracyParams, DataParams, DropoutParams, InnerProductParams, LayerConfig, LossParams,
    ParamSpec, Phase, ReluParams, SoftmaxParams,
};
pub use dropout::Dropout;
pub use filler::{Filler, FillerConfig};
pub use layer::{DeviceKernels, Layer, LayerError, LayerInstance, LayerSlot};
pub use linear::InnerProduct;
pub use registry::{LayerCtor, LayerRegistry};
pub use softmax::Softmax;
pub use split::Split;
