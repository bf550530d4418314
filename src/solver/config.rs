//! Конфигурация солвера.

use super::{Result, SolverError};
use crate::net::NetConfig;
use crate::optimizers::{RuleKind, RuleParams};
use crate::runtime::Mode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Одна сеть для обучения и тестирования (фазы различаются фильтром слоев).
    pub net: Option<PathBuf>,
    pub net_config: Option<NetConfig>,
    /// Отдельная сеть обучения.
    pub train_net: Option<PathBuf>,
    pub train_net_config: Option<NetConfig>,
    /// Отдельные тестовые сети.
    pub test_nets: Vec<PathBuf>,
    pub test_net_configs: Vec<NetConfig>,

    /// Число батчей на каждую тестовую сеть.
    pub test_iter: Vec<usize>,
    /// `0` - не тестировать.
    pub test_interval: usize,
    pub test_compute_loss: bool,
    pub test_initialization: bool,

    pub base_lr: f32,
    /// `0` - не выводить прогресс.
    pub display: usize,
    /// Окно сглаживания выводимой ошибки.
    pub average_loss: usize,
    pub max_iter: usize,
    /// Число проходов forward/backward на одно обновление.
    pub iter_size: usize,

    pub lr_policy: String,
    pub gamma: f32,
    pub power: f32,
    pub stepsize: usize,
    pub stepvalue: Vec<usize>,

    pub momentum: f32,
    pub weight_decay: f32,
    pub regularization_type: String,
    /// Отрицательное значение отключает обрезку.
    pub clip_gradients: f32,

    /// `0` - без промежуточных снапшотов.
    pub snapshot: usize,
    pub snapshot_prefix: Option<PathBuf>,
    /// Сохранять также градиенты параметров.
    pub snapshot_diff: bool,
    pub snapshot_after_train: bool,

    pub solver_type: RuleKind,
    pub delta: f32,
    pub rms_decay: f32,

    pub solver_mode: Mode,
    pub random_seed: Option<u64>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            net: None,
            net_config: None,
            train_net: None,
            train_net_config: None,
            test_nets: Vec::new(),
            test_net_configs: Vec::new(),
            test_iter: Vec::new(),
            test_interval: 0,
            test_compute_loss: false,
            test_initialization: true,
            base_lr: 0.01,
            display: 0,
            average_loss: 1,
            max_iter: 0,
            iter_size: 1,
            lr_policy: "fixed".to_string(),
            gamma: 0.1,
            power: 1.0,
            stepsize: 0,
            stepvalue: Vec::new(),
            momentum: 0.0,
            weight_decay: 0.0,
            regularization_type: "L2".to_string(),
            clip_gradients: -1.0,
            snapshot: 0,
            snapshot_prefix: None,
            snapshot_diff: false,
            snapshot_after_train: true,
            solver_type: RuleKind::Sgd,
            delta: 1e-8,
            rms_decay: 0.99,
            solver_mode: Mode::Cpu,
            random_seed: None,
        }
    }
}

impl SolverConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SolverError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn rule_params(&self) -> RuleParams {
        RuleParams {
            momentum: self.momentum,
            delta: self.delta,
            rms_decay: self.rms_decay,
        }
    }

    /// Проверяет согласованность полей, не требующую чтения файлов.
    pub fn validate(&self) -> Result<()> {
        let sources = [
            self.net.is_some(),
            self.net_config.is_some(),
            self.train_net.is_some(),
            self.train_net_config.is_some(),
        ]
        .iter()
        .filter(|&&given| given)
        .count();
        if sources != 1 {
            return Err(SolverError::InvalidConfig(format!(
                "exactly one of net, net_config, train_net, train_net_config must be given ({} found)",
                sources
            )));
        }
        if self.iter_size == 0 {
            return Err(SolverError::InvalidConfig("iter_size must be positive".to_string()));
        }
        if self.average_loss == 0 {
            return Err(SolverError::InvalidConfig("average_loss must be positive".to_string()));
        }
        if self.snapshot > 0 && self.snapshot_prefix.is_none() {
            return Err(SolverError::InvalidConfig(
                "snapshot_prefix is required when snapshot > 0".to_string(),
            ));
        }
        let explicit_tests = self.test_nets.len() + self.test_net_configs.len();
        let shared_net = self.net.is_some() || self.net_config.is_some();
        if !shared_net && self.test_iter.len() != explicit_tests {
            return Err(SolverError::InvalidConfig(format!(
                "test_iter has {} entries for {} test nets",
                self.test_iter.len(),
                explicit_tests
            )));
        }
        if shared_net && self.test_iter.len() < explicit_tests {
            return Err(SolverError::InvalidConfig(format!(
                "test_iter has {} entries for at least {} test nets",
                self.test_iter.len(),
                explicit_tests
            )));
        }
        if self.test_interval > 0 && self.test_iter.is_empty() {
            return Err(SolverError::InvalidConfig(
                "test_interval is set but no test nets are configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Описание обучающей сети.
    pub fn train_net_description(&self) -> Result<NetConfig> {
        if let Some(config) = self.net_config.as_ref().or(self.train_net_config.as_ref()) {
            return Ok(config.clone());
        }
        match self.net.as_ref().or(self.train_net.as_ref()) {
            Some(path) => Ok(NetConfig::from_file(path)?),
            None => Err(SolverError::InvalidConfig("no train net given".to_string())),
        }
    }

    /// Описания тестовых сетей: явные, затем общая сеть для оставшихся `test_iter`.
    pub fn test_net_descriptions(&self) -> Result<Vec<NetConfig>> {
        let mut nets = self.test_net_configs.clone();
        for path in &self.test_nets {
            nets.push(NetConfig::from_file(path)?);
        }
        if self.net.is_some() || self.net_config.is_some() {
            let shared = self.train_net_description()?;
            while nets.len() < self.test_iter.len() {
                nets.push(shared.clone());
            }
        }
        Ok(nets)
    }
}
