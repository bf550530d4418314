//! # Data Loading Module
//!
//! Asynchronous input pipeline feeding the network.
//!
//! ## Key Components
//!
//! - [`BlockingQueue`]: unbounded FIFO between the prefetch thread and the compute thread
//! - [`Prefetcher`]: background thread filling [`PREFETCH_COUNT`] recycled batch containers
//! - [`Datum`]: serialized example record
//! - [`Database`] / [`Cursor`] / [`Transaction`]: ordered key-value storage interface
//! - [`DataTransformer`]: mean subtraction, scaling, cropping and mirroring
//! - [`DataLayer`]: the network layer that hands prefetched batches to the graph
//!
//! ## Example
//!
//! ```ignore
//! use rustylayers::data::Prefetcher;
//!
//! let prefetcher = Prefetcher::spawn(&[32, 784], Some(&[32]), &ctx, |batch| {
//!     // fill batch.data and batch.label
//!     Ok(())
//! })?;
//! let batch = prefetcher.next_batch()?;
//! // use the batch, then give the container back
//! prefetcher.recycle(batch);
//! ```

pub mod blocking_queue;
pub mod datum;
pub mod db;
pub mod layer;
pub mod prefetch;
pub mod transformer;

pub use blocking_queue::{BlockingQueue, StopToken};
pub use datum::Datum;
pub use db::{Cursor, Database, DbError, JsonDb, MemoryDb, OpenMode, Transaction};
pub use layer::DataLayer;
pub use prefetch::{Batch, Prefetcher, PREFETCH_COUNT};
pub use transformer::{DataTransformer, TransformConfig};

use std::path::PathBuf;
use thiserror::Error;

/// Errors of the input pipeline.
#[derive(Error, Debug)]
pub enum DataError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed datum: {0}")]
    MalformedDatum(String),

    #[error("crop size {crop} exceeds the {height}x{width} input")]
    CropTooLarge {
        crop: usize,
        height: usize,
        width: usize,
    },

    #[error("{given} mean values given for {channels} channels (expected 1 or {channels})")]
    MeanValueCount { given: usize, channels: usize },

    #[error("data source {0} has no records")]
    EmptySource(PathBuf),

    #[error("prefetch thread has stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, DataError>;
