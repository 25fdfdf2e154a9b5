// Errors surfaced to the table layer.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::storage::{PageStoreError, StoreErrorCode};

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    /// The store file looks corrupt and a key was given, so the key is most likely wrong.
    #[error("Error decrypting file {file}, wrong encryption key?")]
    EncryptionKeyMismatch {
        file: PathBuf,
        #[source]
        source: PageStoreError,
    },

    /// Another process or connection holds the store file.
    #[error("Database may be already in use: {file}. Close all other connections and retry")]
    DatabaseAlreadyOpen {
        file: PathBuf,
        #[source]
        source: PageStoreError,
    },

    #[error("File corrupted while reading {file}")]
    FileCorrupted {
        file: PathBuf,
        #[source]
        source: PageStoreError,
    },

    /// I/O failure of the page store, tagged with the operation that failed.
    #[error("IO Exception: {context}")]
    Io {
        context: String,
        #[source]
        source: PageStoreError,
    },

    #[error("Could not access {path}")]
    FileSystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Encryption key must have an even number of bytes, got {0}")]
    InvalidEncryptionKey(usize),

    #[error("Invalid map name {name}: {reason}")]
    InvalidMapName { name: String, reason: String },

    #[error("Session of database {0} has no open transaction")]
    NoTransaction(String),

    #[error("Background failure in database {database}: {message}")]
    Background { database: String, message: String },

    /// Broken internal invariant. Indicates a bug.
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Store(#[from] PageStoreError),
}

impl DbError {
    /// Maps a failure to open a store file to the error callers can act on.
    pub fn on_open(source: PageStoreError, file: &Path, has_key: bool) -> Self {
        let file = file.to_owned();
        match source.code() {
            StoreErrorCode::FileCorrupt if has_key => {
                DbError::EncryptionKeyMismatch { file, source }
            }
            StoreErrorCode::FileLocked => DbError::DatabaseAlreadyOpen { file, source },
            StoreErrorCode::ReadingFailed => DbError::Io {
                context: file.display().to_string(),
                source,
            },
            _ => DbError::FileCorrupted { file, source },
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        DbError::Internal(message.into())
    }
}
