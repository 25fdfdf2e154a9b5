use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::common::DEFAULT_PAGE_SIZE;
use crate::transaction::TransactionManager;

pub type StoreResult<T> = Result<T, PageStoreError>;

/// Receives failures raised by background work inside a page store.
pub type BackgroundErrorSink = Sender<PageStoreError>;

/// Failure category embedded in every page store error.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StoreErrorCode {
    FileCorrupt,
    FileLocked,
    ReadingFailed,
    WritingFailed,
    Closed,
    UnknownMap,
    Internal,
}

impl fmt::Display for StoreErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreErrorCode::FileCorrupt => "FILE_CORRUPT",
            StoreErrorCode::FileLocked => "FILE_LOCKED",
            StoreErrorCode::ReadingFailed => "READING_FAILED",
            StoreErrorCode::WritingFailed => "WRITING_FAILED",
            StoreErrorCode::Closed => "CLOSED",
            StoreErrorCode::UnknownMap => "UNKNOWN_MAP",
            StoreErrorCode::Internal => "INTERNAL",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("{message} [{code}]")]
pub struct PageStoreError {
    code: StoreErrorCode,
    message: String,
    #[source]
    source: Option<io::Error>,
}

impl PageStoreError {
    pub fn new(code: StoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(code: StoreErrorCode, message: impl Into<String>, source: io::Error) -> Self {
        Self {
            code,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::new(StoreErrorCode::FileCorrupt, message)
    }

    pub fn closed() -> Self {
        Self::new(StoreErrorCode::Closed, "This store is closed")
    }

    pub fn code(&self) -> StoreErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Options used to open a page store.
#[derive(Clone)]
pub struct PageStoreConfig {
    /// None keeps everything in memory.
    pub file_name: Option<PathBuf>,
    pub read_only: bool,
    pub encryption_key: Option<Vec<u16>>,
    pub compress: bool,
    pub page_split_size: usize,
    pub cache_size_mb: usize,
    pub auto_commit_delay: Option<Duration>,
    pub background_errors: Option<BackgroundErrorSink>,
}

impl Default for PageStoreConfig {
    fn default() -> Self {
        Self {
            file_name: None,
            read_only: false,
            encryption_key: None,
            compress: false,
            page_split_size: DEFAULT_PAGE_SIZE,
            cache_size_mb: 16,
            auto_commit_delay: None,
            background_errors: None,
        }
    }
}

impl PageStoreConfig {
    pub fn file_name(mut self, file_name: impl Into<PathBuf>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn encryption_key(mut self, password: Vec<u16>) -> Self {
        self.encryption_key = Some(password);
        self
    }

    pub fn compress(mut self) -> Self {
        self.compress = true;
        self
    }

    pub fn page_split_size(mut self, size: usize) -> Self {
        self.page_split_size = size;
        self
    }

    pub fn auto_commit_delay(mut self, delay: Duration) -> Self {
        self.auto_commit_delay = Some(delay);
        self
    }

    pub fn background_error_sink(mut self, sink: BackgroundErrorSink) -> Self {
        self.background_errors = Some(sink);
        self
    }
}

impl fmt::Debug for PageStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageStoreConfig")
            .field("file_name", &self.file_name)
            .field("read_only", &self.read_only)
            .field("encrypted", &self.encryption_key.is_some())
            .field("compress", &self.compress)
            .field("page_split_size", &self.page_split_size)
            .field("cache_size_mb", &self.cache_size_mb)
            .field("auto_commit_delay", &self.auto_commit_delay)
            .finish()
    }
}

/// A named map inside a page store.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MapHandle {
    id: u32,
    name: String,
}

impl MapHandle {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Multi-version key/value store addressed by named maps.
///
/// Writes become durable with [`PageStore::commit`] and reach stable storage with
/// [`PageStore::sync`]. Implementations must be safe for concurrent readers and writers.
pub trait PageStore: Send + Sync {
    /// Opens a map, creating it if it does not exist yet.
    fn open_map(&self, name: &str) -> StoreResult<MapHandle>;
    fn remove_map(&self, map: &MapHandle) -> StoreResult<()>;
    fn has_map(&self, name: &str) -> bool;
    fn map_names(&self) -> Vec<String>;

    fn get(&self, map: &MapHandle, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;
    fn put(&self, map: &MapHandle, key: &[u8], value: &[u8]) -> StoreResult<()>;
    fn delete(&self, map: &MapHandle, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;
    fn entries(&self, map: &MapHandle) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Rewrites data of chunks whose fill rate is below `target_fill_rate` percent,
    /// writing at most `write_limit` bytes. Returns whether any work was done.
    fn compact(&self, target_fill_rate: u32, write_limit: usize) -> StoreResult<bool>;
    /// Moves chunks next to each other so free space ends up at the end of the file.
    fn compact_move_chunks(&self, target_fill_rate: u32, write_limit: usize) -> StoreResult<()>;
    /// Persists pending changes as a new version. Returns the version.
    fn commit(&self) -> StoreResult<u64>;
    fn sync(&self) -> StoreResult<()>;

    fn set_retention_time(&self, retention: Duration);
    fn set_cache_size(&self, mb: usize);
    fn cache_size(&self) -> usize;

    fn is_closed(&self) -> bool;
    fn is_read_only(&self) -> bool;
    /// None when the store has no backing file.
    fn file_name(&self) -> Option<PathBuf>;
    /// Cumulative number of read operations served.
    fn read_count(&self) -> u64;
    /// Raw store file contents, as stored (encrypted if the store is encrypted).
    fn input_stream(&self) -> StoreResult<Box<dyn Read + Send>>;

    fn close(&self) -> StoreResult<()>;
    /// Closes the store without persisting pending changes.
    fn close_immediately(&self);
}

/// Opens page stores and the transaction managers layered on top of them.
pub trait StorageBackend: Send + Sync {
    fn open(&self, config: PageStoreConfig) -> StoreResult<Arc<dyn PageStore>>;
    fn open_transactions(&self, store: Arc<dyn PageStore>) -> StoreResult<Arc<dyn TransactionManager>>;
    /// Removes markers left behind by a compaction interrupted by a crash.
    fn compact_clean_up(&self, file_name: &Path) -> StoreResult<()>;
    /// Compacts the closed store file named by `config` completely.
    fn compact_offline(&self, config: &PageStoreConfig) -> StoreResult<()>;
}
