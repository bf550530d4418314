// --- Файл: src/serialization/snapshot.rs ---

//! Снапшоты обучения.
//!
//! Снапшот итерации `N` - пара файлов с общим префиксом:
//! ```text
//! <prefix>_iter_<N>.model   # параметры сети (SafeTensors)
//! <prefix>_iter_<N>.state   # состояние солвера (JSON)
//! ```
//! Файл состояния ссылается на файл модели, поэтому для продолжения
//! обучения достаточно пути к `.state`.

use super::safetensors_io::SafeTensorsError;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Ошибки при работе со снапшотами
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Ошибка ввода/вывода ({path}): {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Ошибка JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    SafeTensors(#[from] SafeTensorsError),

    #[error("Нет прав на запись снапшотов с префиксом {prefix}: {source}")]
    NotWritable {
        prefix: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Неверное число буферов истории: в снапшоте {stored}, у солвера {expected}")]
    HistoryMismatch { stored: usize, expected: usize },

    #[error("Буфер истории {index}: {stored} значений, ожидалось {expected}")]
    HistoryShape {
        index: usize,
        stored: usize,
        expected: usize,
    },
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> SnapshotError + '_ {
    move |source| SnapshotError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn with_suffix(prefix: &Path, iter: usize, extension: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(format!("_iter_{}.{}", iter, extension));
    PathBuf::from(name)
}

/// `<prefix>_iter_<N>.model`
pub fn model_path(prefix: &Path, iter: usize) -> PathBuf {
    with_suffix(prefix, iter, "model")
}

/// `<prefix>_iter_<N>.state`
pub fn state_path(prefix: &Path, iter: usize) -> PathBuf {
    with_suffix(prefix, iter, "state")
}

/// Проверяет заранее, что по префиксу можно писать: создает и удаляет
/// `<prefix>_iter_0.tmp`.
pub fn check_writable(prefix: &Path) -> Result<()> {
    let probe = with_suffix(prefix, 0, "tmp");
    let not_writable = |source| SnapshotError::NotWritable {
        prefix: prefix.to_path_buf(),
        source,
    };
    fs::write(&probe, b"").map_err(not_writable)?;
    fs::remove_file(&probe).map_err(not_writable)
}

/// Плоская копия буфера значений тензора.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl StoredTensor {
    pub fn from_tensor(tensor: &Tensor) -> Self {
        Self {
            shape: tensor.shape().to_vec(),
            data: tensor.value().to_vec(),
        }
    }

    /// Записывает сохраненные значения обратно в `tensor`.
    pub fn restore_into(&self, index: usize, tensor: &Tensor) -> Result<()> {
        if self.data.len() != tensor.count() {
            return Err(SnapshotError::HistoryShape {
                index,
                stored: self.data.len(),
                expected: tensor.count(),
            });
        }
        tensor.set_value(&self.data);
        Ok(())
    }
}

/// Состояние солвера в файле `.state`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverState {
    pub iter: usize,
    pub current_step: usize,
    /// Путь к файлу `.model` той же итерации.
    pub learned_net: PathBuf,
    pub history: Vec<StoredTensor>,
    /// Второй буфер правила обновления (пуст для SGD и RMSProp).
    #[serde(default)]
    pub update_history: Vec<StoredTensor>,
}

impl SolverState {
    pub fn check_buffers(stored: &[StoredTensor], live: &[Tensor]) -> Result<()> {
        if stored.len() != live.len() {
            return Err(SnapshotError::HistoryMismatch {
                stored: stored.len(),
                expected: live.len(),
            });
        }
        Ok(())
    }

    /// Восстанавливает буферы правила; их число должно совпадать.
    pub fn restore_buffers(stored: &[StoredTensor], live: &[Tensor]) -> Result<()> {
        Self::check_buffers(stored, live)?;
        for (index, (stored, tensor)) in stored.iter().zip(live).enumerate() {
            stored.restore_into(index, tensor)?;
        }
        Ok(())
    }
}

pub fn save_state(path: &Path, state: &SolverState) -> Result<()> {
    let json = serde_json::to_string(state)?;
    fs::write(path, json).map_err(io_error(path))
}

pub fn load_state(path: &Path) -> Result<SolverState> {
    let json = fs::read_to_string(path).map_err(io_error(path))?;
    Ok(serde_json::from_str(&json)?)
}
