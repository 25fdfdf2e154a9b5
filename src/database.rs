use std::fmt;
use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::error;

use crate::common::{DEFAULT_PAGE_SIZE, SUFFIX_MV_FILE};
use crate::error::{DbError, Result};
use crate::storage::{with_suffix, BackgroundErrorSink, PageStoreError};

/// Settings of one logical database.
#[derive(Clone)]
pub struct DatabaseConfig {
    pub name: String,
    /// Database path without the store file suffix. None keeps the database in memory.
    pub path: Option<PathBuf>,
    pub file_encryption_key: Option<Vec<u8>>,
    pub compress: bool,
    pub page_size: usize,
    pub read_only: bool,
    pub cache_size_kb: usize,
    pub auto_commit_delay: Option<Duration>,
}

impl DatabaseConfig {
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            file_encryption_key: None,
            compress: false,
            page_size: DEFAULT_PAGE_SIZE,
            read_only: false,
            cache_size_kb: 16 * 1024,
            auto_commit_delay: None,
        }
    }

    pub fn with_path(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::in_memory(name)
        }
    }

    pub fn encryption_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.file_encryption_key = Some(key.into());
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn cache_size_kb(mut self, kb: usize) -> Self {
        self.cache_size_kb = kb;
        self
    }

    pub fn auto_commit_delay(mut self, delay: Duration) -> Self {
        self.auto_commit_delay = Some(delay);
        self
    }

    /// Path of the store file, `<path>.mv.db`.
    pub fn store_file(&self) -> Option<PathBuf> {
        self.path
            .as_ref()
            .map(|path| with_suffix(path, SUFFIX_MV_FILE))
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("encrypted", &self.file_encryption_key.is_some())
            .field("compress", &self.compress)
            .field("page_size", &self.page_size)
            .field("read_only", &self.read_only)
            .field("cache_size_kb", &self.cache_size_kb)
            .finish()
    }
}

/// A logical database as seen by the storage engine.
///
/// Failures of background work inside the page store arrive on a channel and are
/// recorded here; the first one is kept and reported by [`Database::check_background_error`].
pub struct Database {
    config: DatabaseConfig,
    background_sink: BackgroundErrorSink,
    background_errors: Mutex<Receiver<PageStoreError>>,
    background_error: Mutex<Option<String>>,
}

impl Database {
    pub fn new(config: DatabaseConfig) -> Arc<Self> {
        let (background_sink, background_errors) = channel();
        Arc::new(Self {
            config,
            background_sink,
            background_errors: Mutex::new(background_errors),
            background_error: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub(crate) fn background_error_sink(&self) -> BackgroundErrorSink {
        self.background_sink.clone()
    }

    /// Collects pending background failures and fails if any was ever recorded.
    pub fn check_background_error(&self) -> Result<()> {
        let mut recorded = self.background_error.lock();
        for e in self.background_errors.lock().try_iter() {
            error!(database = %self.config.name, "Background failure: {}", e);
            if recorded.is_none() {
                *recorded = Some(e.to_string());
            }
        }
        match recorded.as_ref() {
            Some(message) => Err(DbError::Background {
                database: self.config.name.clone(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{Database, DatabaseConfig};
    use crate::error::DbError;
    use crate::storage::{PageStoreError, StoreErrorCode};

    #[test]
    fn store_file_carries_suffix() {
        let config = DatabaseConfig::with_path("test", "/data/test");
        assert_eq!(config.store_file().as_deref(), Some(Path::new("/data/test.mv.db")));
        assert_eq!(DatabaseConfig::in_memory("mem").store_file(), None);
    }

    #[test]
    fn first_background_error_is_kept() {
        let database = Database::new(DatabaseConfig::in_memory("bg"));
        assert!(database.check_background_error().is_ok());

        let sink = database.background_error_sink();
        sink.send(PageStoreError::new(StoreErrorCode::WritingFailed, "disk full"))
            .unwrap();
        sink.send(PageStoreError::new(StoreErrorCode::Internal, "later"))
            .unwrap();

        for _ in 0..2 {
            match database.check_background_error() {
                Err(DbError::Background { message, .. }) => assert!(message.contains("disk full")),
                other => panic!("unexpected {other:?}"),
            }
        }
    }
}
