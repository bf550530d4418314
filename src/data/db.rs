//! Интерфейс упорядоченного key-value хранилища примеров.
//!
//! Хранилище открывается в одном из режимов [`OpenMode`]; чтение идет через
//! [`Cursor`] в порядке ключей, запись - пакетами через [`Transaction`].
//!
//! Реализации:
//! - [`JsonDb`] - файловое хранилище (JSON-объект "ключ -> байты");
//! - [`MemoryDb`] - хранилище в памяти (для тестов и синтетических данных).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Ошибка ввода/вывода: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Ошибка JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Хранилище не найдено: {0}")]
    NotFound(PathBuf),

    #[error("Хранилище уже существует: {0}")]
    AlreadyExists(PathBuf),

    #[error("Хранилище открыто только для чтения")]
    ReadOnly,
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Режим открытия хранилища.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Создать новое хранилище; ошибка, если оно уже есть.
    New,
    Read,
    /// Открыть существующее или создать пустое.
    Write,
}

/// Последовательный обход записей в порядке ключей.
pub trait Cursor: Send {
    fn seek_to_first(&mut self);
    fn next(&mut self);
    fn key(&self) -> &str;
    fn value(&self) -> &[u8];
    fn valid(&self) -> bool;
}

/// Пакет записей, применяемый атомарно при `commit`.
pub trait Transaction {
    fn put(&mut self, key: &str, value: Vec<u8>);
    fn commit(self: Box<Self>) -> Result<()>;
}

pub trait Database: Send {
    fn new_cursor(&self) -> Result<Box<dyn Cursor>>;
    fn new_transaction(&mut self) -> Result<Box<dyn Transaction + '_>>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type Records = Arc<Vec<(String, Vec<u8>)>>;

/// Курсор по снимку записей на момент создания.
struct SnapshotCursor {
    records: Records,
    position: usize,
}

impl Cursor for SnapshotCursor {
    fn seek_to_first(&mut self) {
        self.position = 0;
    }

    fn next(&mut self) {
        self.position += 1;
    }

    fn key(&self) -> &str {
        &self.records[self.position].0
    }

    fn value(&self) -> &[u8] {
        &self.records[self.position].1
    }

    fn valid(&self) -> bool {
        self.position < self.records.len()
    }
}

fn snapshot(map: &BTreeMap<String, Vec<u8>>) -> Records {
    Arc::new(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

// --- Файловое хранилище ---

#[derive(Debug, Default, Serialize, Deserialize)]
struct JsonDbFile {
    records: BTreeMap<String, Vec<u8>>,
}

/// Файловое хранилище: весь набор записей в одном JSON-файле.
#[derive(Debug)]
pub struct JsonDb {
    path: PathBuf,
    mode: OpenMode,
    records: BTreeMap<String, Vec<u8>>,
}

impl JsonDb {
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let exists = path.exists();
        let records = match mode {
            OpenMode::New if exists => return Err(DbError::AlreadyExists(path)),
            OpenMode::Read if !exists => return Err(DbError::NotFound(path)),
            OpenMode::New => {
                fs::write(&path, serde_json::to_vec(&JsonDbFile::default())?)?;
                BTreeMap::new()
            }
            OpenMode::Write if !exists => BTreeMap::new(),
            OpenMode::Read | OpenMode::Write => {
                let file: JsonDbFile = serde_json::from_slice(&fs::read(&path)?)?;
                file.records
            }
        };
        tracing::debug!(path = %path.display(), records = records.len(), "opened database");
        Ok(Self {
            path,
            mode,
            records,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<()> {
        let file = JsonDbFile {
            records: self.records.clone(),
        };
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(&file)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

struct JsonTransaction<'a> {
    db: &'a mut JsonDb,
    pending: Vec<(String, Vec<u8>)>,
}

impl Transaction for JsonTransaction<'_> {
    fn put(&mut self, key: &str, value: Vec<u8>) {
        self.pending.push((key.to_string(), value));
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let JsonTransaction { db, pending } = *self;
        db.records.extend(pending);
        db.flush()
    }
}

impl Database for JsonDb {
    fn new_cursor(&self) -> Result<Box<dyn Cursor>> {
        Ok(Box::new(SnapshotCursor {
            records: snapshot(&self.records),
            position: 0,
        }))
    }

    fn new_transaction(&mut self) -> Result<Box<dyn Transaction + '_>> {
        if self.mode == OpenMode::Read {
            return Err(DbError::ReadOnly);
        }
        Ok(Box::new(JsonTransaction {
            db: self,
            pending: Vec::new(),
        }))
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

// --- Хранилище в памяти ---

#[derive(Debug, Default)]
pub struct MemoryDb {
    records: BTreeMap<String, Vec<u8>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemoryTransaction<'a> {
    db: &'a mut MemoryDb,
    pending: Vec<(String, Vec<u8>)>,
}

impl Transaction for MemoryTransaction<'_> {
    fn put(&mut self, key: &str, value: Vec<u8>) {
        self.pending.push((key.to_string(), value));
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { db, pending } = *self;
        db.records.extend(pending);
        Ok(())
    }
}

impl Database for MemoryDb {
    fn new_cursor(&self) -> Result<Box<dyn Cursor>> {
        Ok(Box::new(SnapshotCursor {
            records: snapshot(&self.records),
            position: 0,
        }))
    }

    fn new_transaction(&mut self) -> Result<Box<dyn Transaction + '_>> {
        Ok(Box::new(MemoryTransaction {
            db: self,
            pending: Vec::new(),
        }))
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}
