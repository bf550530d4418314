// --- Файл: src/serialization/mod.rs ---

//! Модуль для сохранения и загрузки обученных моделей.
//!
//! - **SafeTensors**: параметры сети (файлы `.model`)
//! - **JSON**: состояние солвера (файлы `.state`)
//!
//! # Примеры
//!
//! ```rust,ignore
//! use rustylayers::serialization::{load_arrays, save_arrays};
//!
//! save_arrays("lenet_iter_100.model", &net.export_params(false))?;
//! let params = load_arrays("lenet_iter_100.model")?;
//! net.copy_trained_layers_from(&params)?;
//! ```

pub mod safetensors_io;
pub mod snapshot;

pub use safetensors_io::{load_arrays, save_arrays, SafeTensorsError};
pub use snapshot::{SnapshotError, SolverState, StoredTensor};
