use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub(crate) mod codec;
pub mod file_store;
pub mod page_store;

pub use file_store::{FileBackend, FilePageStore};
pub use page_store::{
    BackgroundErrorSink, MapHandle, PageStore, PageStoreConfig, PageStoreError, StorageBackend,
    StoreErrorCode, StoreResult,
};

/// Appends `suffix` to the file name of `path`.
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
