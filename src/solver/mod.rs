//! # Solver Module
//!
//! The [`Solver`] drives iterative optimisation of a network's learnable
//! parameters. One iteration:
//!
//! 1. clear parameter gradients;
//! 2. evaluate the test networks on a `test_interval` boundary;
//! 3. run `iter_size` forward/backward passes and average their loss;
//! 4. update the smoothed loss and print progress every `display` iterations;
//! 5. turn gradients into updates (clip, normalise, regularise, update rule)
//!    and apply them;
//! 6. advance the iteration counter and snapshot on a `snapshot` boundary.
//!
//! Only the root solver (see [`Context::is_root`]) tests, snapshots and logs
//! at INFO level.

pub mod config;
pub mod signal;

pub use config::SolverConfig;
pub use signal::SignalHandler;

use crate::net::{NetError, Network};
use crate::nn::config::Phase;
use crate::nn::registry::LayerRegistry;
use crate::optimizers::{
    build_rule, clip_gradients, normalize, LrPolicy, OptimizerError, Regularization, UpdateRule,
};
use crate::runtime::Context;
use crate::serialization::safetensors_io::{self, SafeTensorsError};
use crate::serialization::snapshot::{self, SnapshotError, SolverState, StoredTensor};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("invalid solver configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Optimizer(#[from] OptimizerError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    SafeTensors(#[from] SafeTensorsError),

    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid solver description: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SolverError>;

/// What the solver should do after the current iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolverAction {
    #[default]
    None,
    /// Finish early (snapshotting if `snapshot_after_train` is set).
    Stop,
    /// Write a snapshot now and continue.
    Snapshot,
}

/// Polled once per iteration and once per test batch.
pub type ActionCallback = Box<dyn FnMut() -> SolverAction + Send>;

/// Mean outputs of one test network evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct TestReport {
    /// Mean weighted loss, when `test_compute_loss` is set.
    pub loss: Option<f32>,
    /// `(output name, mean value)` for every element of every output tensor.
    pub outputs: Vec<(String, f32)>,
}

pub struct Solver {
    config: SolverConfig,
    ctx: Arc<Context>,
    net: Network,
    test_nets: Vec<Network>,
    rule: Box<dyn UpdateRule>,
    policy: LrPolicy,
    regularization: Regularization,
    iter: usize,
    current_step: usize,
    losses: Vec<f32>,
    smoothed_loss: f32,
    action: Option<ActionCallback>,
    requested_early_exit: bool,
}

impl Solver {
    pub fn new(config: SolverConfig, ctx: Arc<Context>, registry: &LayerRegistry) -> Result<Self> {
        config.validate()?;
        let root = ctx.is_root();
        if root {
            if let Some(seed) = config.random_seed {
                ctx.set_random_seed(seed);
            }
            if let Some(prefix) = &config.snapshot_prefix {
                snapshot::check_writable(prefix)?;
            }
        }

        let policy = LrPolicy::parse(
            &config.lr_policy,
            config.gamma,
            config.power,
            config.stepsize,
            &config.stepvalue,
            config.max_iter,
        )?;
        let regularization = Regularization::parse(&config.regularization_type)?;

        let net_config = config.train_net_description()?;
        info!("Creating training net");
        let net = Network::new(&net_config, Phase::Train, Arc::clone(&ctx), registry)?;

        let mut test_nets = Vec::new();
        if root {
            for (i, test_config) in config.test_net_descriptions()?.iter().enumerate() {
                info!("Creating test net (#{})", i);
                let mut test_net =
                    Network::new(test_config, Phase::Test, Arc::clone(&ctx), registry)?;
                test_net.share_trained_layers_with(&net)?;
                test_nets.push(test_net);
            }
        }

        let rule = build_rule(config.solver_type, net.learnable_params(), config.rule_params())?;
        info!("Solver scaffolding done.");

        Ok(Self {
            config,
            ctx,
            net,
            test_nets,
            rule,
            policy,
            regularization,
            iter: 0,
            current_step: 0,
            losses: Vec::new(),
            smoothed_loss: 0.0,
            action: None,
            requested_early_exit: false,
        })
    }

    /// Sets the callback polled for early stop / on-demand snapshot requests.
    pub fn with_action_callback(mut self, callback: ActionCallback) -> Self {
        self.action = Some(callback);
        self
    }

    /// Uses the root solver's shareable layers (data layers) in this solver's net.
    pub fn share_layers_with(&mut self, root: &mut Solver) -> Result<()> {
        self.net.share_layers_with(&mut root.net)?;
        Ok(())
    }

    fn poll_action(&mut self) -> SolverAction {
        match self.action.as_mut() {
            Some(callback) => callback(),
            None => SolverAction::None,
        }
    }

    /// Optimises from the current iteration up to `max_iter`.
    ///
    /// With `resume`, the solver first restores the given `.state` file.
    pub fn solve(&mut self, resume: Option<&Path>) -> Result<()> {
        info!("Solving {}", self.net.name());
        info!("Learning Rate Policy: {}", self.config.lr_policy);
        self.requested_early_exit = false;

        if let Some(path) = resume {
            info!("Restoring previous solver status from {}", path.display());
            self.restore(path)?;
        }

        self.step(self.config.max_iter.saturating_sub(self.iter))?;

        let on_boundary = self.config.snapshot > 0 && self.iter % self.config.snapshot == 0;
        if self.config.snapshot_after_train && !on_boundary && self.config.snapshot_prefix.is_some() {
            self.snapshot()?;
        }
        if self.requested_early_exit {
            info!("Optimization stopped early.");
            return Ok(());
        }

        // Итоговая ошибка и итоговый тест после последнего обновления.
        if self.config.display > 0 && self.iter % self.config.display == 0 {
            let loss = self.net.forward()?;
            self.update_smoothed_loss(loss, self.iter.saturating_sub(1));
            if self.ctx.is_root() {
                info!("Iteration {}, loss = {}", self.iter, self.smoothed_loss);
            }
        }
        if self.config.test_interval > 0 && self.iter % self.config.test_interval == 0 {
            self.test_all()?;
        }
        info!("Optimization Done.");
        Ok(())
    }

    /// Runs `iters` iterations.
    pub fn step(&mut self, iters: usize) -> Result<()> {
        let start_iter = self.iter;
        let stop_iter = self.iter + iters;
        let root = self.ctx.is_root();
        self.losses.clear();
        self.smoothed_loss = 0.0;

        while self.iter < stop_iter {
            self.net.clear_param_diffs();

            if self.config.test_interval > 0
                && self.iter % self.config.test_interval == 0
                && (self.iter > 0 || self.config.test_initialization)
                && root
            {
                self.test_all()?;
                if self.requested_early_exit {
                    break;
                }
            }

            let mut loss = 0.0;
            for _ in 0..self.config.iter_size {
                loss += self.net.forward_backward()?;
            }
            loss /= self.config.iter_size as f32;
            self.update_smoothed_loss(loss, start_iter);

            let display = self.config.display > 0 && self.iter % self.config.display == 0;
            if display && root {
                info!("Iteration {}, loss = {}", self.iter, self.smoothed_loss);
                self.log_outputs();
            }
            self.apply_update(display && root)?;

            self.iter += 1;

            let action = self.poll_action();
            let on_boundary = self.config.snapshot > 0 && self.iter % self.config.snapshot == 0;
            if (on_boundary && root) || action == SolverAction::Snapshot {
                self.snapshot()?;
            }
            if action == SolverAction::Stop {
                self.requested_early_exit = true;
                break;
            }
        }
        Ok(())
    }

    fn update_smoothed_loss(&mut self, loss: f32, start_iter: usize) {
        let window = self.config.average_loss;
        if self.losses.len() < window {
            self.losses.push(loss);
            let size = self.losses.len() as f32;
            self.smoothed_loss = (self.smoothed_loss * (size - 1.0) + loss) / size;
        } else {
            let idx = (self.iter - start_iter) % window;
            self.smoothed_loss += (loss - self.losses[idx]) / window as f32;
            self.losses[idx] = loss;
        }
    }

    fn log_outputs(&self) {
        let names = self.net.output_names();
        let weights = self.net.output_loss_weights();
        let mut score_index = 0;
        for ((name, tensor), weight) in names.iter().zip(self.net.output_tensors()).zip(weights) {
            for &value in tensor.value().iter() {
                let loss_msg = if weight != 0.0 {
                    format!(" (* {} = {} loss)", weight, weight * value)
                } else {
                    String::new()
                };
                info!("    Train net output #{}: {} = {}{}", score_index, name, value, loss_msg);
                score_index += 1;
            }
        }
    }

    /// Current learning rate for the current iteration.
    pub fn learning_rate(&mut self) -> f32 {
        self.policy
            .learning_rate(self.config.base_lr, self.iter, &mut self.current_step)
    }

    fn apply_update(&mut self, display: bool) -> Result<()> {
        let rate = self.learning_rate();
        if display {
            info!("Iteration {}, lr = {}", self.iter, rate);
        }

        let params = self.net.learnable_params();
        if let Some(norm) = clip_gradients(params, self.config.clip_gradients) {
            let clip = self.config.clip_gradients;
            info!(
                "Gradient clipping: scaling down gradients (L2 norm {} > {}) by scale factor {}",
                norm,
                clip,
                clip / norm
            );
        }

        let lr_mults = self.net.params_lr();
        let decay_mults = self.net.params_weight_decay();
        for (index, param) in params.iter().enumerate() {
            normalize(param, self.config.iter_size);
            self.regularization
                .apply(param, self.config.weight_decay * decay_mults[index]);
            self.rule
                .compute_update_value(index, param, rate, lr_mults[index]);
        }
        self.net.update();
        Ok(())
    }

    /// Evaluates every test network.
    pub fn test_all(&mut self) -> Result<Vec<TestReport>> {
        let mut reports = Vec::with_capacity(self.test_nets.len());
        for index in 0..self.test_nets.len() {
            if self.requested_early_exit {
                break;
            }
            if let Some(report) = self.test(index)? {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    /// Evaluates test network `index` over `test_iter[index]` batches.
    ///
    /// Returns `None` when a stop request interrupts the evaluation.
    pub fn test(&mut self, index: usize) -> Result<Option<TestReport>> {
        info!("Iteration {}, Testing net (#{})", self.iter, index);
        let batches = self.config.test_iter[index];
        self.test_nets[index].share_trained_layers_with(&self.net)?;

        let mut scores: Vec<f32> = Vec::new();
        let mut loss = 0.0;
        for batch in 0..batches {
            if self.poll_action() == SolverAction::Stop {
                self.requested_early_exit = true;
                break;
            }
            let test_net = &mut self.test_nets[index];
            let batch_loss = test_net.forward()?;
            if self.config.test_compute_loss {
                loss += batch_loss;
            }
            let values: Vec<f32> = test_net
                .output_tensors()
                .iter()
                .flat_map(|tensor| tensor.value().to_vec())
                .collect();
            if batch == 0 {
                scores = values;
            } else {
                for (score, value) in scores.iter_mut().zip(values) {
                    *score += value;
                }
            }
        }
        if self.requested_early_exit {
            info!("Test interrupted.");
            return Ok(None);
        }

        let denominator = batches.max(1) as f32;
        let loss = self.config.test_compute_loss.then(|| loss / denominator);
        if let Some(loss) = loss {
            info!("Test loss: {}", loss);
        }

        let test_net = &self.test_nets[index];
        let mut outputs = Vec::with_capacity(scores.len());
        let mut score_index = 0;
        for ((name, tensor), weight) in test_net
            .output_names()
            .into_iter()
            .zip(test_net.output_tensors())
            .zip(test_net.output_loss_weights())
        {
            for _ in 0..tensor.count() {
                let mean = scores.get(score_index).copied().unwrap_or(0.0) / denominator;
                let loss_msg = if weight != 0.0 {
                    format!(" (* {} = {} loss)", weight, weight * mean)
                } else {
                    String::new()
                };
                info!("    Test net output #{}: {} = {}{}", score_index, name, mean, loss_msg);
                outputs.push((name.to_string(), mean));
                score_index += 1;
            }
        }
        Ok(Some(TestReport { loss, outputs }))
    }

    /// Writes `<prefix>_iter_<N>.model` and `<prefix>_iter_<N>.state`.
    ///
    /// Returns the path of the state file, or `None` on non-root solvers.
    pub fn snapshot(&mut self) -> Result<Option<PathBuf>> {
        if !self.ctx.is_root() {
            return Ok(None);
        }
        let prefix = self.config.snapshot_prefix.clone().ok_or_else(|| {
            SolverError::InvalidConfig("snapshot requested without snapshot_prefix".to_string())
        })?;

        let model = snapshot::model_path(&prefix, self.iter);
        info!("Snapshotting to {}", model.display());
        safetensors_io::save_arrays(&model, &self.net.export_params(self.config.snapshot_diff))?;

        let state = SolverState {
            iter: self.iter,
            current_step: self.current_step,
            learned_net: model,
            history: self.rule.history().iter().map(StoredTensor::from_tensor).collect(),
            update_history: self
                .rule
                .update_history()
                .iter()
                .map(StoredTensor::from_tensor)
                .collect(),
        };
        let state_path = snapshot::state_path(&prefix, self.iter);
        info!("Snapshotting solver state to {}", state_path.display());
        snapshot::save_state(&state_path, &state)?;
        Ok(Some(state_path))
    }

    /// Restores iteration counters, parameters and update history from a `.state` file.
    pub fn restore(&mut self, state_path: &Path) -> Result<()> {
        let state = snapshot::load_state(state_path)?;
        SolverState::check_buffers(&state.history, self.rule.history())?;
        SolverState::check_buffers(&state.update_history, self.rule.update_history())?;
        SolverState::restore_buffers(&state.history, self.rule.history())?;
        SolverState::restore_buffers(&state.update_history, self.rule.update_history())?;
        if !state.learned_net.as_os_str().is_empty() {
            self.net.copy_trained_layers_from_file(&state.learned_net)?;
        }
        self.iter = state.iter;
        self.current_step = state.current_step;
        debug!("Restored solver at iteration {}", self.iter);
        Ok(())
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn net(&self) -> &Network {
        &self.net
    }

    pub fn net_mut(&mut self) -> &mut Network {
        &mut self.net
    }

    pub fn test_nets(&self) -> &[Network] {
        &self.test_nets
    }

    pub fn iter(&self) -> usize {
        self.iter
    }

    pub fn current_step(&self) -> usize {
        self.current_step
    }

    pub fn smoothed_loss(&self) -> f32 {
        self.smoothed_loss
    }

    pub fn rule(&self) -> &dyn UpdateRule {
        self.rule.as_ref()
    }

    pub fn requested_early_exit(&self) -> bool {
        self.requested_early_exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::NetConfig;
    use crate::nn::config::LayerConfig;
    use crate::nn::FillerConfig;

    fn regression_net() -> NetConfig {
        let mut fc = LayerConfig::new("fc", "InnerProduct")
            .with_bottoms(&["x"])
            .with_tops(&["y"])
            .with_loss_weights(&[1.0]);
        fc.inner_product.num_output = 1;
        fc.inner_product.weight_filler = FillerConfig::constant(1.0);
        NetConfig::new("sum").with_input("x", &[1, 2]).with_layer(fc)
    }

    fn solver(config: SolverConfig) -> Solver {
        let ctx = Arc::new(Context::default());
        let solver = Solver::new(config, ctx, &LayerRegistry::with_builtin()).unwrap();
        solver.net().tensor_by_name("x").unwrap().set_value(&[1.0, 2.0]);
        solver
    }

    #[test]
    fn test_sgd_step_decreases_weighted_output() {
        let mut s = solver(SolverConfig {
            net_config: Some(regression_net()),
            base_lr: 0.1,
            max_iter: 1,
            snapshot_after_train: false,
            ..SolverConfig::default()
        });
        s.step(1).unwrap();
        assert_eq!(s.iter(), 1);
        // dL/dW = x, W = 1 - 0.1 * x
        let w = s.net().learnable_params()[0].value().to_vec();
        assert!((w[0] - 0.9).abs() < 1e-6);
        assert!((w[1] - 0.8).abs() < 1e-6);
        assert!((s.smoothed_loss() - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_smoothed_loss_window() {
        let mut s = solver(SolverConfig {
            net_config: Some(regression_net()),
            average_loss: 2,
            snapshot_after_train: false,
            ..SolverConfig::default()
        });
        s.update_smoothed_loss(1.0, 0);
        s.update_smoothed_loss(3.0, 0);
        assert_eq!(s.smoothed_loss(), 2.0);
        // Окно заполнено: заменяется самое старое значение.
        s.update_smoothed_loss(5.0, 0);
        assert_eq!(s.smoothed_loss(), 4.0);
    }

    #[test]
    fn test_stop_action_ends_early() {
        let mut polls = 0;
        let mut s = solver(SolverConfig {
            net_config: Some(regression_net()),
            max_iter: 100,
            snapshot_after_train: false,
            ..SolverConfig::default()
        })
        .with_action_callback(Box::new(move || {
            polls += 1;
            if polls == 3 {
                SolverAction::Stop
            } else {
                SolverAction::None
            }
        }));
        s.solve(None).unwrap();
        assert_eq!(s.iter(), 3);
        assert!(s.requested_early_exit());
    }

    #[test]
    fn test_unknown_policy_and_regularizer() {
        let ctx = Arc::new(Context::default());
        let registry = LayerRegistry::with_builtin();
        let config = SolverConfig {
            net_config: Some(regression_net()),
            lr_policy: "cosine".to_string(),
            ..SolverConfig::default()
        };
        assert!(matches!(
            Solver::new(config, Arc::clone(&ctx), &registry),
            Err(SolverError::Optimizer(OptimizerError::UnknownPolicy(_)))
        ));
        let config = SolverConfig {
            net_config: Some(regression_net()),
            regularization_type: "L0".to_string(),
            ..SolverConfig::default()
        };
        assert!(matches!(
            Solver::new(config, ctx, &registry),
            Err(SolverError::Optimizer(OptimizerError::UnknownRegularizer(_)))
        ));
    }

    #[test]
    fn test_unwritable_prefix_fails_at_construction() {
        let dir = tempfile::tempdir().unwrap();
        let config = SolverConfig {
            net_config: Some(regression_net()),
            snapshot: 1,
            snapshot_prefix: Some(dir.path().join("missing").join("snap")),
            ..SolverConfig::default()
        };
        let result = Solver::new(config, Arc::new(Context::default()), &LayerRegistry::with_builtin());
        assert!(matches!(
            result,
            Err(SolverError::Snapshot(SnapshotError::NotWritable { .. }))
        ));
    }
}
