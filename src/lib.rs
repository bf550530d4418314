//! # RustyLayers: Layer-graph Neural Network Training Engine in Rust
//!
//! **RustyLayers** trains feed-forward networks described as an ordered list of
//! layers over named tensors. Every tensor carries a value and a gradient
//! buffer that lazily synchronise between host and device; layers implement
//! hand-written forward and backward kernels; a background thread prefetches
//! input batches; a solver runs SGD, AdaDelta or RMSProp with learning rate
//! policies, gradient clipping, regularization and snapshot/resume.
//!
//! ## Usage Example
//!
//! ```no_run
//! use rustylayers::net::NetConfig;
//! use rustylayers::nn::{LayerConfig, LayerRegistry};
//! use rustylayers::runtime::{Context, Mode};
//! use rustylayers::solver::{Solver, SolverConfig};
//!
//! let mut fc = LayerConfig::new("fc", "InnerProduct")
//!     .with_bottoms(&["data"])
//!     .with_tops(&["score"]);
//! fc.inner_product.num_output = 10;
//! let net = NetConfig::new("linear")
//!     .with_input("data", &[64, 784])
//!     .with_input("label", &[64])
//!     .with_layer(fc)
//!     .with_layer(
//!         LayerConfig::new("loss", "SoftmaxWithLoss")
//!             .with_bottoms(&["score", "label"])
//!             .with_tops(&["loss"]),
//!     );
//!
//! let config = SolverConfig {
//!     net_config: Some(net),
//!     base_lr: 0.01,
//!     max_iter: 100,
//!     ..SolverConfig::default()
//! };
//! let mut solver = Solver::new(config, Context::shared(Mode::Cpu), &LayerRegistry::with_builtin())?;
//! solver.solve(None)?;
//! # Ok::<(), rustylayers::solver::SolverError>(())
//! ```

// Declare public modules that constitute the core library API.
pub mod data;
pub mod losses;
pub mod net;
pub mod nn;
pub mod optimizers;
pub mod runtime;
pub mod serialization;
pub mod solver;
pub mod tensor;
