//! Абстрактные операции устройства.
//!
//! Устройство моделируется отдельной областью памяти (см. [`SyncedMemory`])
//! и потоком команд [`Stream`]. Команды, поставленные в поток, выполняются
//! строго по порядку в отдельном рабочем потоке ОС; вызывающий поток не
//! блокируется до явного вызова [`Stream::synchronize`].
//!
//! [`SyncedMemory`]: super::SyncedMemory

use std::io;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Job),
    Fence(flume::Sender<()>),
}

/// Упорядоченная очередь асинхронных операций устройства.
pub struct Stream {
    sender: Option<flume::Sender<Command>>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    /// Создает поток команд и запускает его рабочий поток.
    pub fn new() -> io::Result<Self> {
        let (sender, receiver) = flume::unbounded::<Command>();
        let worker = std::thread::Builder::new()
            .name("device-stream".to_string())
            .spawn(move || {
                for command in receiver.iter() {
                    match command {
                        Command::Run(job) => job(),
                        Command::Fence(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Ставит операцию в очередь без ожидания ее выполнения.
    pub(crate) fn enqueue<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(sender) = &self.sender {
            if sender.send(Command::Run(Box::new(job))).is_err() {
                tracing::error!("device stream worker is gone, dropping operation");
            }
        }
    }

    /// Блокирует вызывающий поток, пока не выполнятся все ранее поставленные операции.
    pub fn synchronize(&self) {
        let Some(sender) = &self.sender else {
            return;
        };
        let (done_tx, done_rx) = flume::bounded(1);
        if sender.send(Command::Fence(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Закрываем канал: рабочий поток доработает очередь и завершится.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("open", &self.sender.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_jobs_run_in_order_before_fence() {
        let stream = Stream::new().unwrap();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        for i in 0..8 {
            let log = Arc::clone(&log);
            stream.enqueue(move || log.lock().push(i));
        }
        stream.synchronize();
        assert_eq!(*log.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_drop_drains_pending_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let stream = Stream::new().unwrap();
            for _ in 0..5 {
                let counter = Arc::clone(&counter);
                stream.enqueue(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
