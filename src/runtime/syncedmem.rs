//! Память, синхронизируемая между хостом и устройством.
//!
//! Один логический буфер может существовать на хосте и/или на устройстве.
//! Чтение стороны, которая не актуальна, лениво копирует данные с актуальной
//! стороны; изменяемый доступ делает другую сторону неактуальной.

use super::device::Stream;
use parking_lot::Mutex;
use std::sync::Arc;

/// Какая сторона буфера содержит актуальные данные.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncHead {
    /// Память еще не выделялась ни на одной стороне.
    Uninitialized,
    HeadAtHost,
    HeadAtDevice,
    /// Обе стороны содержат одинаковые данные.
    Synced,
}

/// Счетчики копирований между сторонами.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub to_device: usize,
    pub to_host: usize,
}

/// Буфер `f32` с ленивой синхронизацией хост/устройство.
#[derive(Debug)]
pub struct SyncedMemory {
    len: usize,
    host: Vec<f32>,
    device: Vec<f32>,
    head: SyncHead,
    stats: TransferStats,
}

/// Буфер с разделяемым владением; так тензоры делят данные друг с другом.
pub type SharedMemory = Arc<Mutex<SyncedMemory>>;

impl SyncedMemory {
    /// Создает буфер на `len` элементов. Память выделяется при первом доступе.
    pub fn new(len: usize) -> Self {
        Self {
            len,
            host: Vec::new(),
            device: Vec::new(),
            head: SyncHead::Uninitialized,
            stats: TransferStats::default(),
        }
    }

    /// То же, что [`SyncedMemory::new`], сразу завернутое в [`SharedMemory`].
    pub fn shared(len: usize) -> SharedMemory {
        Arc::new(Mutex::new(Self::new(len)))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn head(&self) -> SyncHead {
        self.head
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    fn to_host(&mut self) {
        match self.head {
            SyncHead::Uninitialized => {
                self.host = vec![0.0; self.len];
                self.head = SyncHead::HeadAtHost;
            }
            SyncHead::HeadAtDevice => {
                if self.host.len() != self.len {
                    self.host = vec![0.0; self.len];
                }
                self.host.copy_from_slice(&self.device);
                self.stats.to_host += 1;
                self.head = SyncHead::Synced;
            }
            SyncHead::HeadAtHost | SyncHead::Synced => {}
        }
    }

    fn to_device(&mut self) {
        match self.head {
            SyncHead::Uninitialized => {
                self.device = vec![0.0; self.len];
                self.head = SyncHead::HeadAtDevice;
            }
            SyncHead::HeadAtHost => {
                if self.device.len() != self.len {
                    self.device = vec![0.0; self.len];
                }
                self.device.copy_from_slice(&self.host);
                self.stats.to_device += 1;
                self.head = SyncHead::Synced;
            }
            SyncHead::HeadAtDevice | SyncHead::Synced => {}
        }
    }

    pub fn host_data(&mut self) -> &[f32] {
        self.to_host();
        &self.host
    }

    pub fn mutable_host_data(&mut self) -> &mut [f32] {
        self.to_host();
        self.head = SyncHead::HeadAtHost;
        &mut self.host
    }

    pub fn device_data(&mut self) -> &[f32] {
        self.to_device();
        &self.device
    }

    pub fn mutable_device_data(&mut self) -> &mut [f32] {
        self.to_device();
        self.head = SyncHead::HeadAtDevice;
        &mut self.device
    }

    /// Синхронизированный хостовый буфер без смены головы.
    ///
    /// Нужен для отображения в неизменяемый guard: `MutexGuard::map`
    /// требует `&mut`, но запись через результат не допускается.
    pub(crate) fn host_view(&mut self) -> &mut [f32] {
        self.to_host();
        &mut self.host
    }

    pub(crate) fn device_view(&mut self) -> &mut [f32] {
        self.to_device();
        &mut self.device
    }
}

/// Асинхронно копирует буфер с хоста на устройство.
///
/// Возвращается сразу; после выполнения операции в потоке буфер
/// находится в состоянии [`SyncHead::Synced`]. Перед использованием
/// данных на устройстве нужно вызвать [`Stream::synchronize`].
pub fn async_to_device(memory: &SharedMemory, stream: &Stream) {
    let memory = Arc::clone(memory);
    stream.enqueue(move || {
        memory.lock().to_device();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_allocation() {
        let mut mem = SyncedMemory::new(4);
        assert_eq!(mem.head(), SyncHead::Uninitialized);
        assert_eq!(mem.host_data(), &[0.0; 4]);
        assert_eq!(mem.head(), SyncHead::HeadAtHost);
        assert_eq!(mem.stats(), TransferStats::default());
    }

    #[test]
    fn test_device_write_then_host_read_copies_once() {
        let mut mem = SyncedMemory::new(3);
        mem.mutable_device_data().copy_from_slice(&[1.0, 2.0, 3.0]);
        assert_eq!(mem.head(), SyncHead::HeadAtDevice);

        assert_eq!(mem.host_data(), &[1.0, 2.0, 3.0]);
        assert_eq!(mem.host_data(), &[1.0, 2.0, 3.0]);
        assert_eq!(mem.head(), SyncHead::Synced);
        assert_eq!(mem.stats().to_host, 1);
        assert_eq!(mem.stats().to_device, 0);
    }

    #[test]
    fn test_mutable_access_invalidates_other_side() {
        let mut mem = SyncedMemory::new(2);
        mem.mutable_host_data()[0] = 5.0;
        let _ = mem.device_data();
        assert_eq!(mem.head(), SyncHead::Synced);

        mem.mutable_host_data()[1] = 7.0;
        assert_eq!(mem.head(), SyncHead::HeadAtHost);
        assert_eq!(mem.device_data(), &[5.0, 7.0]);
        assert_eq!(mem.stats().to_device, 2);
    }

    #[test]
    fn test_async_push_ends_synced() {
        let stream = Stream::new().unwrap();
        let mem = SyncedMemory::shared(3);
        mem.lock().mutable_host_data().copy_from_slice(&[1.0, 2.0, 3.0]);

        async_to_device(&mem, &stream);
        stream.synchronize();

        let mut guard = mem.lock();
        assert_eq!(guard.head(), SyncHead::Synced);
        assert_eq!(guard.device_data(), &[1.0, 2.0, 3.0]);
        assert_eq!(guard.stats().to_device, 1);
    }
}
