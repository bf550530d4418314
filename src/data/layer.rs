//! Слой данных: читает записи [`Datum`] из хранилища через поток предвыборки.

use super::datum::Datum;
use super::db::{Cursor, Database, JsonDb, OpenMode};
use super::prefetch::{Batch, Prefetcher};
use super::transformer::{DataTransformer, TransformConfig};
use super::{DataError, Result as DataResult};
use crate::nn::config::{LayerConfig, Phase};
use crate::nn::layer::{DeviceKernels, Layer, LayerError, Result};
use crate::runtime::Context;
use crate::tensor::Tensor;
use std::path::PathBuf;
use std::sync::Arc;

/// Слой без входов с одним (данные) или двумя (данные, метки) выходами.
pub struct DataLayer {
    source: PathBuf,
    batch_size: usize,
    transform: TransformConfig,
    phase: Phase,
    ctx: Arc<Context>,
    database: Option<Box<dyn Database>>,
    prefetcher: Option<Prefetcher>,
}

impl DataLayer {
    pub fn new(config: &LayerConfig, phase: Phase, ctx: &Arc<Context>) -> Result<Self> {
        if config.data.batch_size == 0 {
            return Err(LayerError::InvalidConfig(
                "Data layer needs batch_size > 0".to_string(),
            ));
        }
        Ok(Self {
            source: config.data.source.clone(),
            batch_size: config.data.batch_size,
            transform: config.transform.clone(),
            phase,
            ctx: Arc::clone(ctx),
            database: None,
            prefetcher: None,
        })
    }

    /// Использует уже открытое хранилище вместо `data.source`.
    pub fn with_database(mut self, database: Box<dyn Database>) -> Self {
        self.database = Some(database);
        self
    }

    fn open_cursor(&mut self) -> DataResult<Box<dyn Cursor>> {
        let database: Box<dyn Database> = match self.database.take() {
            Some(database) => database,
            None => Box::new(JsonDb::open(&self.source, OpenMode::Read)?),
        };
        let cursor = database.new_cursor()?;
        if !cursor.valid() {
            return Err(DataError::EmptySource(self.source.clone()));
        }
        Ok(cursor)
    }

    fn take_batch(&self) -> Result<(&Prefetcher, Batch)> {
        let prefetcher = self.prefetcher.as_ref().ok_or_else(|| {
            LayerError::InvalidConfig("Data layer used before setup".to_string())
        })?;
        Ok((prefetcher, prefetcher.next_batch()?))
    }
}

/// Заполняет батч из курсора; в конце хранилища курсор перематывается.
fn load_batch(
    cursor: &mut dyn Cursor,
    transformer: &mut DataTransformer,
    batch_size: usize,
    batch: &mut Batch,
) -> DataResult<()> {
    let mut item_shape: Option<Vec<usize>> = None;
    for item in 0..batch_size {
        let datum = Datum::decode(cursor.value())?;
        let shape = transformer.infer_shape(&datum)?;
        if item_shape.is_none() {
            let mut batch_shape = shape.clone();
            batch_shape[0] = batch_size;
            batch.data.reshape(&batch_shape);
            item_shape = Some(shape);
        } else if item_shape.as_ref() != Some(&shape) {
            return Err(DataError::MalformedDatum(format!(
                "record '{}' has shape {:?}, expected {:?}",
                cursor.key(),
                shape,
                item_shape
            )));
        }
        let item_len = batch.data.count() / batch_size;
        {
            let mut data = batch.data.value_mut();
            transformer.transform(&datum, &mut data[item * item_len..(item + 1) * item_len])?;
        }
        if let Some(label) = &batch.label {
            label.value_mut()[item] = datum.label as f32;
        }

        cursor.next();
        if !cursor.valid() {
            tracing::debug!("Restarting data prefetching from start.");
            cursor.seek_to_first();
        }
    }
    Ok(())
}

impl Layer for DataLayer {
    fn layer_type(&self) -> &'static str {
        "Data"
    }

    fn exact_num_bottoms(&self) -> Option<usize> {
        Some(0)
    }

    fn min_tops(&self) -> Option<usize> {
        Some(1)
    }

    fn max_tops(&self) -> Option<usize> {
        Some(2)
    }

    fn share_in_parallel(&self) -> bool {
        true
    }

    fn layer_setup(&mut self, _bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()> {
        let mut cursor = self.open_cursor()?;
        let mut transformer =
            DataTransformer::new(self.transform.clone(), self.phase, &self.ctx);

        let first = Datum::decode(cursor.value())?;
        let mut data_shape = transformer.infer_shape(&first)?;
        data_shape[0] = self.batch_size;
        top[0].reshape(&data_shape);
        if self.ctx.is_root() {
            tracing::info!("output data size: {}", top[0].shape_string());
        }

        let label_shape = [self.batch_size];
        let with_labels = top.len() > 1;
        if with_labels {
            top[1].reshape(&label_shape);
        }

        let batch_size = self.batch_size;
        let prefetcher = Prefetcher::spawn(
            &data_shape,
            with_labels.then_some(&label_shape[..]),
            &self.ctx,
            move |batch| load_batch(cursor.as_mut(), &mut transformer, batch_size, batch),
        )?;
        self.prefetcher = Some(prefetcher);
        Ok(())
    }

    fn reshape(&mut self, _bottom: &[&Tensor], _top: &mut [Tensor]) -> Result<()> {
        // Формы выходов задаются батчем в forward.
        Ok(())
    }

    fn forward_cpu(&mut self, _bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()> {
        let (prefetcher, batch) = self.take_batch()?;
        top[0].copy_from(&batch.data, false, true);
        if let (Some(label), Some(out)) = (&batch.label, top.get_mut(1)) {
            out.copy_from(label, false, true);
        }
        prefetcher.recycle(batch);
        Ok(())
    }

    fn backward_cpu(&mut self, _top: &[&Tensor], _pd: &[bool], _bottom: &[&Tensor]) -> Result<()> {
        Ok(())
    }

    fn device_kernels(&mut self) -> Option<&mut dyn DeviceKernels> {
        Some(self)
    }
}

impl DeviceKernels for DataLayer {
    fn forward_device(&mut self, _bottom: &[&Tensor], top: &mut [Tensor]) -> Result<()> {
        let (prefetcher, batch) = self.take_batch()?;
        top[0].reshape_like(&batch.data);
        top[0]
            .device_value_mut()
            .copy_from_slice(&batch.data.device_value());
        if let (Some(label), Some(out)) = (&batch.label, top.get_mut(1)) {
            out.reshape_like(label);
            out.device_value_mut().copy_from_slice(&label.device_value());
        }
        prefetcher.recycle(batch);
        Ok(())
    }

    fn backward_device(&mut self, _top: &[&Tensor], _pd: &[bool], _bottom: &[&Tensor]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::db::MemoryDb;
    use crate::runtime::Mode;

    fn memory_db(n: usize) -> Box<dyn Database> {
        let mut db = MemoryDb::new();
        {
            let mut txn = db.new_transaction().unwrap();
            for i in 0..n {
                let datum = Datum::from_floats(1, 1, 2, vec![i as f32, -(i as f32)], i as i32);
                txn.put(&format!("{:08}", i), datum.encode().unwrap());
            }
            txn.commit().unwrap();
        }
        Box::new(db)
    }

    fn data_layer(ctx: Arc<Context>, records: usize, batch_size: usize) -> DataLayer {
        let mut config = LayerConfig::new("data", "Data");
        config.data.batch_size = batch_size;
        DataLayer::new(&config, Phase::Train, &ctx)
            .unwrap()
            .with_database(memory_db(records))
    }

    #[test]
    fn test_batches_wrap_around_the_source() {
        let mut layer = data_layer(Arc::new(Context::default()), 3, 2);
        let mut top = vec![Tensor::default(), Tensor::default()];
        layer.layer_setup(&[], &mut top).unwrap();
        assert_eq!(top[0].shape(), &[2, 1, 1, 2]);
        assert_eq!(top[1].shape(), &[2]);

        let mut labels = Vec::new();
        for _ in 0..3 {
            layer.forward_cpu(&[], &mut top).unwrap();
            labels.extend(top[1].value().iter().map(|&l| l as i32));
        }
        assert_eq!(labels, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(&*top[0].value(), &[1.0, -1.0, 2.0, -2.0]);
    }

    #[test]
    fn test_device_forward() {
        let mut layer = data_layer(Arc::new(Context::new(Mode::Device)), 2, 2);
        let mut top = vec![Tensor::default()];
        layer.layer_setup(&[], &mut top).unwrap();
        layer.forward_device(&[], &mut top).unwrap();
        assert_eq!(&*top[0].value(), &[0.0, 0.0, 1.0, -1.0]);
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let config = LayerConfig::new("data", "Data");
        assert!(DataLayer::new(&config, Phase::Train, &Arc::new(Context::default())).is_err());
    }

    #[test]
    fn test_empty_source() {
        let mut config = LayerConfig::new("data", "Data");
        config.data.batch_size = 1;
        let mut layer = DataLayer::new(&config, Phase::Train, &Arc::new(Context::default()))
            .unwrap()
            .with_database(Box::new(MemoryDb::new()));
        let mut top = vec![Tensor::default()];
        assert!(matches!(
            layer.layer_setup(&[], &mut top),
            Err(LayerError::Data(DataError::EmptySource(_)))
        ));
    }
}
