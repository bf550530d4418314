//! Сериализованная запись одного примера.

use super::{DataError, Result};
use serde::{Deserialize, Serialize};

/// Пример в формате хранилища: `channels x height x width` значений и метка.
///
/// Значения лежат либо в байтах (`data`), либо во float-векторе (`float_data`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub float_data: Vec<f32>,
    #[serde(default)]
    pub label: i32,
}

impl Datum {
    pub fn from_bytes(channels: usize, height: usize, width: usize, data: Vec<u8>, label: i32) -> Self {
        Self {
            channels,
            height,
            width,
            data,
            float_data: Vec::new(),
            label,
        }
    }

    pub fn from_floats(
        channels: usize,
        height: usize,
        width: usize,
        float_data: Vec<f32>,
        label: i32,
    ) -> Self {
        Self {
            channels,
            height,
            width,
            data: Vec::new(),
            float_data,
            label,
        }
    }

    /// Ожидаемое число значений `channels * height * width`.
    pub fn len(&self) -> usize {
        self.channels * self.height * self.width
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_bytes(&self) -> bool {
        !self.data.is_empty()
    }

    /// Значение с индексом `index` как `f32`. Запись должна пройти [`validate`](Self::validate).
    pub(crate) fn value_at(&self, index: usize) -> f32 {
        debug_assert!(
            index < self.len(),
            "datum index {} out of range for {} values",
            index,
            self.len()
        );
        if self.has_bytes() {
            f32::from(self.data[index])
        } else {
            self.float_data[index]
        }
    }

    /// Проверяет, что размер данных соответствует заявленной форме.
    pub fn validate(&self) -> Result<()> {
        let actual = if self.has_bytes() {
            self.data.len()
        } else {
            self.float_data.len()
        };
        if actual != self.len() {
            return Err(DataError::MalformedDatum(format!(
                "{}x{}x{} datum carries {} values",
                self.channels, self.height, self.width, actual
            )));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let datum: Datum = serde_json::from_slice(bytes)?;
        datum.validate()?;
        Ok(datum)
    }
}
