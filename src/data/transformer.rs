// --- Файл: src/data/transformer.rs ---

//! Преобразования примеров при загрузке: вычитание среднего, масштаб,
//! обрезка (crop) и зеркальное отражение.

use super::datum::Datum;
use super::{DataError, Result};
use crate::nn::config::Phase;
use crate::runtime::Context;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Параметры преобразования.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Множитель, применяемый после вычитания среднего.
    pub scale: f32,
    /// Одно среднее на все каналы или по одному на канал.
    pub mean_values: Vec<f32>,
    /// `0` - без обрезки.
    pub crop_size: usize,
    /// Случайное горизонтальное отражение в фазе TRAIN.
    pub mirror: bool,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            scale: 1.0,
            mean_values: Vec::new(),
            crop_size: 0,
            mirror: false,
        }
    }
}

/// Применяет [`TransformConfig`] к записям [`Datum`].
///
/// В фазе TRAIN обрезка берется из случайной позиции, в фазе TEST - из центра.
pub struct DataTransformer {
    config: TransformConfig,
    phase: Phase,
    rng: StdRng,
}

impl DataTransformer {
    pub fn new(config: TransformConfig, phase: Phase, ctx: &Context) -> Self {
        Self {
            config,
            phase,
            rng: ctx.fork_rng(),
        }
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    /// Форма `[1, C, H, W]` одного преобразованного примера.
    pub fn infer_shape(&self, datum: &Datum) -> Result<Vec<usize>> {
        let crop = self.config.crop_size;
        if crop > 0 {
            if crop > datum.height || crop > datum.width {
                return Err(DataError::CropTooLarge {
                    crop,
                    height: datum.height,
                    width: datum.width,
                });
            }
            Ok(vec![1, datum.channels, crop, crop])
        } else {
            Ok(vec![1, datum.channels, datum.height, datum.width])
        }
    }

    fn mean_for_channels(&self, channels: usize) -> Result<Vec<f32>> {
        match self.config.mean_values.len() {
            0 => Ok(vec![0.0; channels]),
            1 => Ok(vec![self.config.mean_values[0]; channels]),
            n if n == channels => Ok(self.config.mean_values.clone()),
            n => Err(DataError::MeanValueCount {
                given: n,
                channels,
            }),
        }
    }

    /// Записывает преобразованный пример в `out` (длины `C * H' * W'`).
    pub fn transform(&mut self, datum: &Datum, out: &mut [f32]) -> Result<()> {
        datum.validate()?;
        let shape = self.infer_shape(datum)?;
        let (channels, out_h, out_w) = (shape[1], shape[2], shape[3]);
        if out.len() != channels * out_h * out_w {
            return Err(DataError::MalformedDatum(format!(
                "output buffer of {} values for a {}x{}x{} example",
                out.len(),
                channels,
                out_h,
                out_w
            )));
        }
        let mean = self.mean_for_channels(channels)?;

        let (h_off, w_off) = if self.config.crop_size > 0 {
            match self.phase {
                Phase::Train => (
                    self.rng.gen_range(0..=datum.height - out_h),
                    self.rng.gen_range(0..=datum.width - out_w),
                ),
                Phase::Test => ((datum.height - out_h) / 2, (datum.width - out_w) / 2),
            }
        } else {
            (0, 0)
        };
        let mirror = self.config.mirror && self.phase == Phase::Train && self.rng.gen::<bool>();

        for c in 0..channels {
            for h in 0..out_h {
                for w in 0..out_w {
                    let src = (c * datum.height + h_off + h) * datum.width + w_off + w;
                    let dst_w = if mirror { out_w - 1 - w } else { w };
                    let dst = (c * out_h + h) * out_w + dst_w;
                    out[dst] = (datum.value_at(src) - mean[c]) * self.config.scale;
                }
            }
        }
        Ok(())
    }
}
