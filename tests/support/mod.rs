#![allow(dead_code)]

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mvengine::storage::{
    FileBackend, MapHandle, PageStore, PageStoreConfig, PageStoreError, StorageBackend,
    StoreErrorCode, StoreResult,
};
use mvengine::transaction::{
    TransactionId, TransactionInfo, TransactionManager, TransactionMap, TransactionStatus,
};

fn unsupported() -> PageStoreError {
    PageStoreError::new(StoreErrorCode::Internal, "not scripted")
}

/// Transaction manager preloaded with the transactions a crash left open.
#[derive(Default)]
pub struct ScriptedTransactions {
    open: Mutex<BTreeMap<TransactionId, TransactionInfo>>,
    pub committed: Mutex<Vec<TransactionId>>,
    pub rolled_back: Mutex<Vec<TransactionId>>,
}

impl ScriptedTransactions {
    pub fn with_open(statuses: &[TransactionStatus]) -> Self {
        let open = statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                let id = i as TransactionId + 1;
                let info = TransactionInfo {
                    id,
                    status: *status,
                    name: Some(format!("tx-{id}")),
                };
                (id, info)
            })
            .collect();
        Self {
            open: Mutex::new(open),
            ..Self::default()
        }
    }

    fn finish(&self, tid: TransactionId, to: TransactionStatus) -> StoreResult<()> {
        let mut open = self.open.lock().unwrap();
        let info = open.get(&tid).ok_or_else(unsupported)?;
        let mut status = info.status;
        if to == TransactionStatus::Committed && status != TransactionStatus::Committing {
            status = status.transition(TransactionStatus::Committing)?;
        }
        status.transition(to)?;
        open.remove(&tid);
        Ok(())
    }
}

impl TransactionManager for ScriptedTransactions {
    fn begin(&self) -> StoreResult<TransactionId> {
        Err(unsupported())
    }

    fn open_transactions(&self) -> Vec<TransactionInfo> {
        self.open.lock().unwrap().values().cloned().collect()
    }

    fn info(&self, tid: TransactionId) -> StoreResult<TransactionInfo> {
        self.open
            .lock()
            .unwrap()
            .get(&tid)
            .cloned()
            .ok_or_else(unsupported)
    }

    fn set_name(&self, tid: TransactionId, name: Option<&str>) -> StoreResult<()> {
        let mut open = self.open.lock().unwrap();
        let info = open.get_mut(&tid).ok_or_else(unsupported)?;
        info.name = name.map(str::to_owned);
        Ok(())
    }

    fn prepare(&self, tid: TransactionId) -> StoreResult<()> {
        let mut open = self.open.lock().unwrap();
        let info = open.get_mut(&tid).ok_or_else(unsupported)?;
        info.status = info.status.transition(TransactionStatus::Prepared)?;
        Ok(())
    }

    fn commit(&self, tid: TransactionId) -> StoreResult<()> {
        self.finish(tid, TransactionStatus::Committed)?;
        self.committed.lock().unwrap().push(tid);
        Ok(())
    }

    fn rollback(&self, tid: TransactionId) -> StoreResult<()> {
        self.finish(tid, TransactionStatus::RolledBack)?;
        self.rolled_back.lock().unwrap().push(tid);
        Ok(())
    }

    fn open_map(&self, _tid: TransactionId, _map: &str) -> StoreResult<()> {
        Err(unsupported())
    }

    fn read(&self, _tid: TransactionId, _map: &str, _key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Err(unsupported())
    }

    fn write(
        &self,
        _tid: TransactionId,
        _map: &str,
        _key: &[u8],
        _value: Option<&[u8]>,
    ) -> StoreResult<()> {
        Err(unsupported())
    }

    fn remove_map(&self, _map: &TransactionMap) -> StoreResult<()> {
        Err(unsupported())
    }

    fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// In-memory page store with a scripted transaction manager on top.
pub struct ScriptedBackend {
    pub transactions: Arc<ScriptedTransactions>,
}

impl StorageBackend for ScriptedBackend {
    fn open(&self, config: PageStoreConfig) -> StoreResult<Arc<dyn PageStore>> {
        FileBackend.open(config)
    }

    fn open_transactions(&self, _store: Arc<dyn PageStore>) -> StoreResult<Arc<dyn TransactionManager>> {
        let transactions: Arc<dyn TransactionManager> = self.transactions.clone();
        Ok(transactions)
    }

    fn compact_clean_up(&self, _file_name: &Path) -> StoreResult<()> {
        Ok(())
    }

    fn compact_offline(&self, _config: &PageStoreConfig) -> StoreResult<()> {
        Ok(())
    }
}

/// File backend that counts what it is asked to do and can be told to misbehave.
#[derive(Default)]
pub struct ObservedBackend {
    pub opens: AtomicUsize,
    pub offline_compactions: AtomicUsize,
    pub open_failure: Option<StoreErrorCode>,
    pub close_failure: Option<StoreErrorCode>,
    pub delete_file_on_close: bool,
}

impl StorageBackend for ObservedBackend {
    fn open(&self, config: PageStoreConfig) -> StoreResult<Arc<dyn PageStore>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = self.open_failure {
            return Err(PageStoreError::new(code, "scripted open failure"));
        }
        let inner = FileBackend.open(config)?;
        Ok(Arc::new(ObservedStore {
            inner,
            close_failure: self.close_failure,
            delete_file_on_close: self.delete_file_on_close,
        }))
    }

    fn open_transactions(&self, store: Arc<dyn PageStore>) -> StoreResult<Arc<dyn TransactionManager>> {
        FileBackend.open_transactions(store)
    }

    fn compact_clean_up(&self, file_name: &Path) -> StoreResult<()> {
        FileBackend.compact_clean_up(file_name)
    }

    fn compact_offline(&self, config: &PageStoreConfig) -> StoreResult<()> {
        self.offline_compactions.fetch_add(1, Ordering::SeqCst);
        FileBackend.compact_offline(config)
    }
}

struct ObservedStore {
    inner: Arc<dyn PageStore>,
    close_failure: Option<StoreErrorCode>,
    delete_file_on_close: bool,
}

impl PageStore for ObservedStore {
    fn open_map(&self, name: &str) -> StoreResult<MapHandle> {
        self.inner.open_map(name)
    }

    fn remove_map(&self, map: &MapHandle) -> StoreResult<()> {
        self.inner.remove_map(map)
    }

    fn has_map(&self, name: &str) -> bool {
        self.inner.has_map(name)
    }

    fn map_names(&self) -> Vec<String> {
        self.inner.map_names()
    }

    fn get(&self, map: &MapHandle, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.inner.get(map, key)
    }

    fn put(&self, map: &MapHandle, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.inner.put(map, key, value)
    }

    fn delete(&self, map: &MapHandle, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.inner.delete(map, key)
    }

    fn entries(&self, map: &MapHandle) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.entries(map)
    }

    fn compact(&self, target_fill_rate: u32, write_limit: usize) -> StoreResult<bool> {
        self.inner.compact(target_fill_rate, write_limit)
    }

    fn compact_move_chunks(&self, target_fill_rate: u32, write_limit: usize) -> StoreResult<()> {
        self.inner.compact_move_chunks(target_fill_rate, write_limit)
    }

    fn commit(&self) -> StoreResult<u64> {
        self.inner.commit()
    }

    fn sync(&self) -> StoreResult<()> {
        self.inner.sync()
    }

    fn set_retention_time(&self, retention: Duration) {
        self.inner.set_retention_time(retention)
    }

    fn set_cache_size(&self, mb: usize) {
        self.inner.set_cache_size(mb)
    }

    fn cache_size(&self) -> usize {
        self.inner.cache_size()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    fn file_name(&self) -> Option<PathBuf> {
        self.inner.file_name()
    }

    fn read_count(&self) -> u64 {
        self.inner.read_count()
    }

    fn input_stream(&self) -> StoreResult<Box<dyn Read + Send>> {
        self.inner.input_stream()
    }

    fn close(&self) -> StoreResult<()> {
        if let Some(code) = self.close_failure {
            return Err(PageStoreError::new(code, "scripted close failure"));
        }
        self.inner.close()?;
        if self.delete_file_on_close {
            if let Some(file) = self.inner.file_name() {
                fs::remove_file(file).map_err(|e| {
                    PageStoreError::with_source(StoreErrorCode::WritingFailed, "delete", e)
                })?;
            }
        }
        Ok(())
    }

    fn close_immediately(&self) {
        self.inner.close_immediately()
    }
}
