// --- Файл: src/serialization/safetensors_io.rs ---

//! Модуль для работы с форматом SafeTensors.
//!
//! В этом формате хранятся файлы `.model`: параметры сети под именами
//! `<layer>.<index>` и, при необходимости, их градиенты (`<layer>.<index>.grad`).

use ndarray::ArrayD;
use safetensors::serialize_to_file;
use safetensors::tensor::{SafeTensors, TensorView};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Ошибки при работе с SafeTensors
#[derive(Error, Debug)]
pub enum SafeTensorsError {
    #[error("Ошибка ввода/вывода: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Ошибка SafeTensors: {0}")]
    SafeTensorsError(#[from] safetensors::SafeTensorError),

    #[error("Неподдерживаемый тип данных: {0}")]
    UnsupportedDtype(String),

    #[error("Ошибка формы тензора: ожидалось {expected:?}, получено {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

type Result<T> = std::result::Result<T, SafeTensorsError>;

/// Сохраняет именованные массивы в файл SafeTensors.
///
/// ```rust,ignore
/// let params = net.export_params(false);
/// save_arrays("snapshots/lenet_iter_100.model", &params)?;
/// ```
pub fn save_arrays<P: AsRef<Path>>(path: P, arrays: &[(String, ArrayD<f32>)]) -> Result<()> {
    // Сначала все байты, потом представления, которые на них ссылаются.
    let bytes: Vec<Vec<u8>> = arrays
        .iter()
        .map(|(_, array)| array.iter().flat_map(|&x| x.to_le_bytes()).collect())
        .collect();

    let mut views: Vec<(&str, TensorView<'_>)> = Vec::with_capacity(arrays.len());
    for ((name, array), data) in arrays.iter().zip(&bytes) {
        views.push((
            name.as_str(),
            TensorView::new(safetensors::Dtype::F32, array.shape().to_vec(), data)?,
        ));
    }

    serialize_to_file(views, &None, path.as_ref())?;
    Ok(())
}

/// Загружает все тензоры файла SafeTensors. F64 приводится к f32.
pub fn load_arrays<P: AsRef<Path>>(path: P) -> Result<HashMap<String, ArrayD<f32>>> {
    let buffer = fs::read(path)?;
    let tensors = SafeTensors::deserialize(&buffer)?;

    let mut result = HashMap::new();
    for (name, tensor) in tensors.tensors() {
        let shape: Vec<usize> = tensor.shape().to_vec();
        let floats: Vec<f32> = match tensor.dtype() {
            safetensors::Dtype::F32 => tensor
                .data()
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
            safetensors::Dtype::F64 => tensor
                .data()
                .chunks_exact(8)
                .map(|chunk| {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(chunk);
                    f64::from_le_bytes(raw) as f32
                })
                .collect(),
            other => {
                return Err(SafeTensorsError::UnsupportedDtype(format!("{:?}", other)));
            }
        };

        let floats_len = floats.len();
        let array = ArrayD::from_shape_vec(ndarray::IxDyn(&shape), floats).map_err(|_| {
            SafeTensorsError::ShapeMismatch {
                expected: shape.clone(),
                actual: vec![floats_len],
            }
        })?;
        result.insert(name.to_string(), array);
    }
    Ok(result)
}
