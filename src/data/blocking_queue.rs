//! Неограниченная потокобезопасная FIFO-очередь.
//!
//! Связывает поток предвыборки и вычислительный поток: один мьютекс и одна
//! условная переменная. Блокируется только `pop`, и только пока очередь пуста.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Как часто ожидающий `pop_until_stopped` перепроверяет флаг остановки.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Флаг отмены, разделяемый владельцем потока и самим потоком.
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
pub struct BlockingQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> BlockingQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    /// Добавляет элемент в хвост и будит одного ожидающего.
    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.available.notify_one();
    }

    /// Неблокирующее извлечение.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Извлекает элемент, ожидая, пока он появится.
    ///
    /// Если ждать приходится, один раз пишет `wait_message` в лог.
    pub fn pop(&self, wait_message: &str) -> T {
        let mut items = self.items.lock();
        let mut reported = false;
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            if !reported && !wait_message.is_empty() {
                tracing::info!("{}", wait_message);
                reported = true;
            }
            self.available.wait(&mut items);
        }
    }

    /// Как [`pop`](Self::pop), но возвращает `None`, если запрошена остановка.
    pub fn pop_until_stopped(&self, stop: &StopToken) -> Option<T> {
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            if stop.is_stopped() {
                return None;
            }
            self.available.wait_for(&mut items, STOP_POLL_INTERVAL);
        }
    }

    /// Будит всех ожидающих (используется при остановке).
    pub fn notify_all(&self) {
        let _guard = self.items.lock();
        self.available.notify_all();
    }

    /// Неблокирующий просмотр головы очереди.
    pub fn try_peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.items.lock().front().cloned()
    }

    /// Просмотр головы очереди с ожиданием.
    pub fn peek(&self) -> T
    where
        T: Clone,
    {
        let mut items = self.items.lock();
        loop {
            if let Some(item) = items.front() {
                return item.clone();
            }
            self.available.wait(&mut items);
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
