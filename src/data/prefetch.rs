//! Предвыборка батчей в фоновом потоке.
//!
//! Две очереди: `free` (пустые контейнеры) и `full` (готовые батчи).
//! Поток-производитель берет контейнер из `free`, заполняет его, в режиме
//! устройства копирует данные на устройство и дожидается копирования,
//! затем кладет контейнер в `full`. Потребитель забирает батч из `full`
//! и после использования возвращает контейнер в `free`. Контейнеры
//! передаются между потоками только по владению.

use super::blocking_queue::{BlockingQueue, StopToken};
use super::{DataError, Result};
use crate::runtime::{async_to_device, Context, Mode, Stream};
use crate::tensor::Tensor;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Число контейнеров, циркулирующих между потоками.
pub const PREFETCH_COUNT: usize = 4;

/// Контейнер одного батча: примеры и (опционально) метки.
#[derive(Debug)]
pub struct Batch {
    pub data: Tensor,
    pub label: Option<Tensor>,
    id: usize,
}

impl Batch {
    /// Номер контейнера (`0..PREFETCH_COUNT`), неизменный на всю его жизнь.
    pub fn id(&self) -> usize {
        self.id
    }
}

type Full = BlockingQueue<Result<Batch>>;

pub struct Prefetcher {
    free: Arc<BlockingQueue<Batch>>,
    full: Arc<Full>,
    stop: StopToken,
    /// Выставляется производителем при завершении.
    finished: StopToken,
    worker: Option<JoinHandle<()>>,
    root: bool,
}

impl Prefetcher {
    /// Создает контейнеры и запускает поток предвыборки.
    ///
    /// `load` заполняет контейнер очередным батчем (и может менять формы его
    /// тензоров). Ошибка `load` передается потребителю, после чего поток
    /// завершается.
    pub fn spawn<F>(
        data_shape: &[usize],
        label_shape: Option<&[usize]>,
        ctx: &Context,
        mut load: F,
    ) -> Result<Self>
    where
        F: FnMut(&mut Batch) -> Result<()> + Send + 'static,
    {
        let free = Arc::new(BlockingQueue::new());
        for id in 0..PREFETCH_COUNT {
            let batch = Batch {
                data: Tensor::new(data_shape),
                label: label_shape.map(Tensor::new),
                id,
            };
            // Выделяем память на хосте заранее, до старта потока.
            drop(batch.data.value_mut());
            if let Some(label) = &batch.label {
                drop(label.value_mut());
            }
            free.push(batch);
        }
        let full: Arc<Full> = Arc::new(BlockingQueue::new());
        let stop = StopToken::new();
        let finished = StopToken::new();
        let mode = ctx.mode();

        let worker = {
            let free = Arc::clone(&free);
            let full = Arc::clone(&full);
            let stop = stop.clone();
            let finished = finished.clone();
            std::thread::Builder::new()
                .name("prefetch".to_string())
                .spawn(move || {
                    produce(&free, &full, &stop, mode, &mut load);
                    finished.request_stop();
                    full.notify_all();
                })?
        };

        Ok(Self {
            free,
            full,
            stop,
            finished,
            worker: Some(worker),
            root: ctx.is_root(),
        })
    }

    /// Следующий готовый батч. Ждет, если производитель отстает.
    pub fn next_batch(&self) -> Result<Batch> {
        if self.full.is_empty() && !self.finished.is_stopped() {
            if self.root {
                tracing::info!("Data layer prefetch queue empty");
            } else {
                tracing::debug!("Data layer prefetch queue empty");
            }
        }
        match self.full.pop_until_stopped(&self.finished) {
            Some(batch) => batch,
            None => Err(DataError::Stopped),
        }
    }

    /// Возвращает контейнер производителю.
    pub fn recycle(&self, batch: Batch) {
        self.free.push(batch);
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn full_len(&self) -> usize {
        self.full.len()
    }
}

fn produce<F>(
    free: &BlockingQueue<Batch>,
    full: &Full,
    stop: &StopToken,
    mode: Mode,
    load: &mut F,
) where
    F: FnMut(&mut Batch) -> Result<()>,
{
    let stream = match mode {
        Mode::Device => match Stream::new() {
            Ok(stream) => Some(stream),
            Err(e) => {
                full.push(Err(DataError::from(e)));
                return;
            }
        },
        Mode::Cpu => None,
    };

    while let Some(mut batch) = free.pop_until_stopped(stop) {
        if stop.is_stopped() {
            break;
        }
        if let Err(e) = load(&mut batch) {
            tracing::error!("prefetch thread failed: {}", e);
            full.push(Err(e));
            return;
        }
        if let Some(stream) = &stream {
            async_to_device(batch.data.value_memory(), stream);
            if let Some(label) = &batch.label {
                async_to_device(label.value_memory(), stream);
            }
            stream.synchronize();
        }
        full.push(Ok(batch));
    }
    tracing::debug!("prefetch thread stopped");
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.stop.request_stop();
        self.free.notify_all();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("prefetch thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SyncHead;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tracing_subscriber::layer::{self, SubscriberExt};

    fn counting_prefetcher(ctx: &Context) -> Prefetcher {
        let mut next = 0.0f32;
        Prefetcher::spawn(&[2], Some(&[2]), ctx, move |batch| {
            batch.data.fill_value(next);
            if let Some(label) = &batch.label {
                label.fill_value(next);
            }
            next += 1.0;
            Ok(())
        })
        .unwrap()
    }

    #[test]
    fn test_batches_arrive_in_order() {
        let prefetcher = counting_prefetcher(&Context::default());
        for expected in 0..6 {
            let batch = prefetcher.next_batch().unwrap();
            assert_eq!(batch.data.value()[0], expected as f32);
            prefetcher.recycle(batch);
        }
    }

    #[test]
    fn test_device_mode_hands_off_synced_batches() {
        let prefetcher = counting_prefetcher(&Context::new(Mode::Device));
        let batch = prefetcher.next_batch().unwrap();
        assert_eq!(batch.data.value_head(), SyncHead::Synced);
        assert_eq!(&*batch.data.device_value(), &[0.0, 0.0]);
        prefetcher.recycle(batch);
    }

    #[test]
    fn test_loader_error_reaches_consumer() {
        let mut calls = 0;
        let prefetcher = Prefetcher::spawn(&[1], None, &Context::default(), move |_| {
            calls += 1;
            if calls == 2 {
                Err(DataError::MalformedDatum("broken record".to_string()))
            } else {
                Ok(())
            }
        })
        .unwrap();
        assert!(prefetcher.next_batch().is_ok());
        assert!(matches!(
            prefetcher.next_batch(),
            Err(DataError::MalformedDatum(_))
        ));
        assert!(matches!(prefetcher.next_batch(), Err(DataError::Stopped)));
    }

    /// Считает события по уровням в потоке теста.
    #[derive(Clone, Default)]
    struct LevelCounter {
        info: Arc<AtomicUsize>,
        debug: Arc<AtomicUsize>,
    }

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for LevelCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: layer::Context<'_, S>) {
            match *event.metadata().level() {
                tracing::Level::INFO => self.info.fetch_add(1, Ordering::SeqCst),
                tracing::Level::DEBUG => self.debug.fetch_add(1, Ordering::SeqCst),
                _ => 0,
            };
        }
    }

    fn wait_for_slow_batch(ctx: &Context) -> LevelCounter {
        let counter = LevelCounter::default();
        let subscriber = tracing_subscriber::registry().with(counter.clone());
        tracing::subscriber::with_default(subscriber, || {
            let prefetcher = Prefetcher::spawn(&[1], None, ctx, |_| {
                std::thread::sleep(Duration::from_millis(100));
                Ok(())
            })
            .unwrap();
            prefetcher.next_batch().unwrap();
        });
        counter
    }

    #[test]
    fn test_empty_queue_reported_at_info_only_on_root() {
        let root = wait_for_slow_batch(&Context::default());
        assert_eq!(root.info.load(Ordering::SeqCst), 1);

        let worker = wait_for_slow_batch(&Context::default().with_solver_count(2).as_worker());
        assert_eq!(worker.info.load(Ordering::SeqCst), 0);
        assert!(worker.debug.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_drop_stops_blocked_producer() {
        let prefetcher = counting_prefetcher(&Context::default());
        // Все контейнеры заполнены, производитель ждет свободного.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(prefetcher.full_len(), PREFETCH_COUNT);
        drop(prefetcher);
    }
}
