//! Модуль исполнительной среды.
//!
//! Здесь живет все, что относится к "где и как считать":
//! - [`Context`] - явный контекст исполнения (режим CPU/устройство, ГСЧ,
//!   число солверов и флаг корневого солвера);
//! - [`SyncedMemory`] - буфер, синхронизируемый между хостом и устройством;
//! - [`Stream`] - очередь асинхронных операций устройства.

pub mod context;
pub mod device;
pub mod syncedmem;

pub use context::{Context, Mode};
pub use device::Stream;
pub use syncedmem::{async_to_device, SharedMemory, SyncHead, SyncedMemory, TransferStats};
