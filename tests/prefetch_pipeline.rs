//! Интеграционный тест конвейера предвыборки: медленный потребитель,
//! контейнеры циркулируют без потерь и дублирования.

use rustylayers::data::{Prefetcher, PREFETCH_COUNT};
use rustylayers::runtime::{Context, Mode};
use std::collections::HashSet;
use std::time::{Duration, Instant};

const BATCHES: usize = 10;

fn sequenced_prefetcher(ctx: &Context) -> Prefetcher {
    let mut sequence = 0.0f32;
    Prefetcher::spawn(&[2, 3], Some(&[2]), ctx, move |batch| {
        batch.data.fill_value(sequence);
        if let Some(label) = &batch.label {
            label.fill_value(-sequence);
        }
        sequence += 1.0;
        Ok(())
    })
    .unwrap()
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

fn run_slow_consumer(mode: Mode) {
    let prefetcher = sequenced_prefetcher(&Context::new(mode));
    let mut ids = Vec::new();
    let mut first_round = HashSet::new();

    for expected in 0..BATCHES {
        let batch = prefetcher.next_batch().unwrap();
        // Батчи приходят строго по порядку, без пропусков и повторов.
        assert_eq!(batch.data.value()[0], expected as f32);
        assert!(batch.data.value().iter().all(|&v| v == expected as f32));
        assert_eq!(batch.label.as_ref().unwrap().value()[1], -(expected as f32));
        if expected < PREFETCH_COUNT {
            assert!(first_round.insert(batch.id()), "container {} handed out twice", batch.id());
        }
        ids.push(batch.id());

        std::thread::sleep(Duration::from_millis(10));
        prefetcher.recycle(batch);
    }

    assert_eq!(first_round.len(), PREFETCH_COUNT);
    // Очередь FIFO: контейнеры возвращаются в том же порядке.
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(*id, ids[i % PREFETCH_COUNT]);
    }

    // Производитель заполняет все контейнеры и ждет свободного.
    assert!(wait_until(|| prefetcher.full_len() == PREFETCH_COUNT));
    assert_eq!(prefetcher.free_len(), 0);
}

#[test]
fn test_slow_consumer_on_host() {
    run_slow_consumer(Mode::Cpu);
}

#[test]
fn test_slow_consumer_on_device() {
    run_slow_consumer(Mode::Device);
}

#[test]
fn test_drop_while_consumer_holds_batch() {
    let prefetcher = sequenced_prefetcher(&Context::default());
    let batch = prefetcher.next_batch().unwrap();
    assert!(wait_until(|| prefetcher.full_len() == PREFETCH_COUNT - 1));
    drop(prefetcher);
    // Контейнер, взятый до остановки, остается пригодным.
    assert_eq!(batch.data.value()[0], 0.0);
}
