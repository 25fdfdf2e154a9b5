use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::in_doubt::InDoubtTransaction;
use super::map_name::MapName;
use super::session::Session;
use super::table::{Table, TableSpec};
use crate::common::{
    ObjectIds, COMPACT_FILL_RATE, COMPACT_FULLY, COMPACT_WRITE_LIMIT, COMPRESSED_PAGE_SPLIT_SIZE,
    FLUSH_FILL_RATE, FLUSH_WRITE_LIMIT,
};
use crate::database::Database;
use crate::error::{DbError, Result};
use crate::storage::{
    PageStore, PageStoreConfig, StorageBackend, StoreErrorCode, StoreResult,
};
use crate::transaction::{
    RecoveryAction, Transaction, TransactionManager, TransactionStatus,
};
use crate::tuple::ValueDataType;

/// Outcome of startup recovery.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub committed: usize,
    pub rolled_back: usize,
    pub in_doubt: usize,
}

/// Maps dropped by [`Store::remove_temporary_maps`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectionReport {
    pub temporary: usize,
    pub orphaned: usize,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Statistics {
    pub reads: u64,
}

/// Turns a raw file encryption key into the password of the page store.
/// Each pair of consecutive bytes becomes one 16-bit unit, high byte first.
pub fn derive_password(key: &[u8]) -> Vec<u16> {
    key.chunks_exact(2)
        .map(|pair| (u16::from(pair[0]) << 8) | u16::from(pair[1]))
        .collect()
}

/// The storage of one database: its page store, the transactions on top of it and the
/// tables whose rows it holds.
pub struct Store {
    database: Arc<Database>,
    backend: Arc<dyn StorageBackend>,
    config: PageStoreConfig,
    page_store: Arc<dyn PageStore>,
    transactions: Arc<dyn TransactionManager>,
    tables: DashMap<String, Arc<Table>>,
    next_temporary_map_id: Mutex<u64>,
    statistics_start: AtomicU64,
    lifecycle: Mutex<()>,
}

impl Store {
    pub(crate) fn open(database: Arc<Database>, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        let config = page_store_config(&database)?;
        let file = config.file_name.clone();
        let has_key = config.encryption_key.is_some();

        if let Some(file) = &file {
            backend.compact_clean_up(file).map_err(|source| DbError::Io {
                context: format!("Cleaning up {}", file.display()),
                source,
            })?;
            if !config.read_only {
                create_directory(file)?;
            }
        }

        let page_store = backend.open(config.clone()).map_err(|e| match &file {
            Some(file) => DbError::on_open(e, file, has_key),
            None => DbError::Store(e),
        })?;
        let transactions = match backend.open_transactions(Arc::clone(&page_store)) {
            Ok(transactions) => transactions,
            Err(e) => {
                page_store.close_immediately();
                return Err(match &file {
                    Some(file) => DbError::on_open(e, file, has_key),
                    None => DbError::Store(e),
                });
            }
        };

        let next_temporary_map_id = page_store
            .map_names()
            .iter()
            .filter_map(|name| MapName::parse(name).ok()?.sequence())
            .map(|n| n + 1)
            .max()
            .unwrap_or(0);

        let store = Self {
            database,
            backend,
            config,
            page_store,
            transactions,
            tables: DashMap::new(),
            next_temporary_map_id: Mutex::new(next_temporary_map_id),
            statistics_start: AtomicU64::new(0),
            lifecycle: Mutex::new(()),
        };
        if let Err(e) = store.init_transactions() {
            store.page_store.close_immediately();
            return Err(e);
        }
        info!(
            database = store.name(),
            file = ?store.config.file_name,
            read_only = store.config.read_only,
            "Opened store"
        );
        Ok(store)
    }

    pub fn name(&self) -> &str {
        self.database.name()
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn file_name(&self) -> Option<PathBuf> {
        self.page_store.file_name()
    }

    pub fn is_read_only(&self) -> bool {
        self.page_store.is_read_only()
    }

    pub fn is_closed(&self) -> bool {
        self.page_store.is_closed()
    }

    pub fn map_names(&self) -> Result<Vec<MapName>> {
        self.page_store
            .map_names()
            .iter()
            .map(|name| MapName::parse(name))
            .collect()
    }

    pub fn begin(&self) -> Result<Transaction> {
        Ok(Transaction::begin(&self.transactions)?)
    }

    /// Finishes what a crash left behind: commits transactions whose commit was
    /// already decided, rolls back undecided ones and leaves prepared ones alone.
    pub fn init_transactions(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let read_only = self.page_store.is_read_only();
        for info in self.transactions.open_transactions() {
            let Some(action) = RecoveryAction::for_status(info.status) else {
                continue;
            };
            let transaction = Transaction::new(info.id, Arc::clone(&self.transactions));
            match action {
                RecoveryAction::AwaitDecision => report.in_doubt += 1,
                _ if read_only => {
                    debug!(transaction = info.id, status = %info.status, "Recovery skipped on read-only store");
                }
                RecoveryAction::FinishCommit => {
                    transaction.commit()?;
                    report.committed += 1;
                }
                RecoveryAction::Rollback => {
                    transaction.rollback()?;
                    report.rolled_back += 1;
                }
            }
        }
        if report.committed + report.rolled_back > 0 {
            self.page_store.commit()?;
        }
        if report != RecoveryReport::default() {
            info!(
                database = self.name(),
                committed = report.committed,
                rolled_back = report.rolled_back,
                in_doubt = report.in_doubt,
                "Recovered transactions"
            );
        }
        Ok(report)
    }

    pub(crate) fn create_table(&self, spec: TableSpec) -> Result<Arc<Table>> {
        let map_name = if spec.temporary {
            self.next_temporary_map_name()
        } else {
            MapName::Table(spec.id).to_string()
        };
        let table = Arc::new(Table::new(spec, map_name.clone()));
        debug!(database = self.name(), table = table.name(), map = %map_name, "Created table");
        self.tables.insert(map_name, Arc::clone(&table));
        Ok(table)
    }

    /// Tables by the name of the map holding their rows.
    pub fn tables(&self) -> HashMap<String, Arc<Table>> {
        self.tables
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect()
    }

    /// Forgets the table and drops its map.
    pub fn remove_table(&self, table: &Table) -> Result<()> {
        self.tables.remove(table.map_name());
        if self.page_store.is_read_only() || !self.page_store.has_map(table.map_name()) {
            return Ok(());
        }
        self.drop_map(table.map_name())
    }

    pub fn next_temporary_map_name(&self) -> String {
        let mut next = self.next_temporary_map_id.lock();
        let name = MapName::temporary(*next);
        *next += 1;
        name.to_string()
    }

    /// Drops every temporary map and every table or index map whose owner is not in `live`.
    pub fn remove_temporary_maps(&self, live: &ObjectIds) -> Result<CollectionReport> {
        let _guard = self.lifecycle.lock();
        let mut report = CollectionReport::default();
        if self.page_store.is_read_only() {
            return Ok(report);
        }
        for name in self.page_store.map_names() {
            match MapName::parse(&name)? {
                MapName::Temporary(_) => {
                    let map = self.page_store.open_map(&name)?;
                    self.page_store.remove_map(&map)?;
                    self.tables.remove(&name);
                    report.temporary += 1;
                    debug!(database = self.name(), map = %name, "Dropped temporary map");
                }
                MapName::Table(id) | MapName::Index(id) if !live.contains(id) => {
                    self.drop_map(&name)?;
                    self.tables.remove(&name);
                    report.orphaned += 1;
                    debug!(database = self.name(), map = %name, "Dropped orphaned map");
                }
                MapName::Table(_) | MapName::Index(_) | MapName::Other(_) => {}
            }
        }
        if report != CollectionReport::default() {
            info!(
                database = self.name(),
                temporary = report.temporary,
                orphaned = report.orphaned,
                "Collected unused maps"
            );
        }
        Ok(report)
    }

    fn drop_map(&self, name: &str) -> Result<()> {
        let transaction = self.begin()?;
        let removed = transaction
            .open_map(name, Arc::new(ValueDataType), Arc::new(ValueDataType))
            .and_then(|map| transaction.remove_map(&map))
            .and_then(|_| transaction.commit());
        if let Err(e) = removed {
            if let Err(rollback) = transaction.rollback() {
                warn!(map = name, "Rollback after failed map removal failed: {}", rollback);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Phase one of two-phase commit for the transaction of `session`.
    pub fn prepare_commit(&self, session: &Session, name: Option<&str>) -> Result<()> {
        let transaction = session
            .current_transaction()
            .ok_or_else(|| DbError::NoTransaction(self.name().to_owned()))?;
        transaction.set_name(name)?;
        transaction.prepare()?;
        self.page_store.commit()?;
        Ok(())
    }

    pub fn in_doubt_transactions(&self) -> Vec<InDoubtTransaction> {
        self.transactions
            .open_transactions()
            .into_iter()
            .filter(|info| info.status == TransactionStatus::Prepared)
            .map(|info| {
                InDoubtTransaction::new(
                    Arc::clone(&self.page_store),
                    Transaction::new(info.id, Arc::clone(&self.transactions)),
                    info.name,
                )
            })
            .collect()
    }

    /// Checkpoints pending writes, compacting lightly if there is something to reclaim.
    pub fn flush(&self) -> Result<()> {
        if self.page_store.file_name().is_none() || self.page_store.is_read_only() {
            return Ok(());
        }
        if !self
            .page_store
            .compact(FLUSH_FILL_RATE, FLUSH_WRITE_LIMIT)?
        {
            self.page_store.commit()?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.flush()?;
        self.page_store.sync()?;
        Ok(())
    }

    /// Compacts the store file until nothing is left to do or `max_compact_time` elapsed.
    pub fn compact_file(&self, max_compact_time: Duration) -> Result<()> {
        let _guard = self.lifecycle.lock();
        self.page_store.set_retention_time(Duration::ZERO);
        let start = Instant::now();
        let mut passes = 0;
        while self
            .page_store
            .compact(COMPACT_FILL_RATE, COMPACT_WRITE_LIMIT)?
        {
            self.page_store.sync()?;
            self.page_store
                .compact_move_chunks(COMPACT_FILL_RATE, COMPACT_WRITE_LIMIT)?;
            passes += 1;
            if start.elapsed() > max_compact_time {
                break;
            }
        }
        debug!(database = self.name(), passes, elapsed = ?start.elapsed(), "Compacted store");
        Ok(())
    }

    /// Closes the store. [`COMPACT_FULLY`] additionally compacts the closed file offline.
    ///
    /// Whatever fails, the store ends up closed.
    pub fn close(&self, max_compact_time: Duration) -> Result<()> {
        let _guard = self.lifecycle.lock();
        match self.close_store(max_compact_time) {
            Ok(()) => Ok(()),
            Err(e) => {
                match e.code() {
                    StoreErrorCode::WritingFailed => {
                        warn!(database = self.name(), "Disk full while closing: {}", e)
                    }
                    StoreErrorCode::FileCorrupt => {
                        warn!(database = self.name(), "Wrong encryption key while closing: {}", e)
                    }
                    _ => warn!(database = self.name(), "Closing failed: {}", e),
                }
                self.page_store.close_immediately();
                Err(DbError::Io {
                    context: "Closing".to_owned(),
                    source: e,
                })
            }
        }
    }

    fn close_store(&self, max_compact_time: Duration) -> StoreResult<()> {
        if self.page_store.is_closed() {
            return Ok(());
        }
        let Some(file) = self.page_store.file_name() else {
            self.page_store.close_immediately();
            return Ok(());
        };

        let mut compact_fully = false;
        if !self.page_store.is_read_only() {
            self.transactions.close()?;
            compact_fully = max_compact_time == COMPACT_FULLY;
        }
        self.page_store.close()?;
        if compact_fully && file.exists() {
            self.backend.compact_offline(&self.config)?;
        }
        info!(database = self.name(), file = %file.display(), "Closed store");
        Ok(())
    }

    /// Closes without persisting anything.
    pub fn close_immediately(&self) {
        self.page_store.close_immediately();
    }

    pub fn set_cache_size(&self, kb: usize) {
        self.page_store.set_cache_size((kb / 1024).max(1));
    }

    /// Store file contents for backups.
    pub fn input_stream(&self) -> Result<Box<dyn Read + Send>> {
        Ok(self.page_store.input_stream()?)
    }

    pub fn statistics_start(&self) {
        self.statistics_start
            .store(self.read_count(), Ordering::Relaxed);
    }

    pub fn statistics_end(&self) -> Statistics {
        let start = self.statistics_start.load(Ordering::Relaxed);
        Statistics {
            reads: self.read_count().saturating_sub(start),
        }
    }

    fn read_count(&self) -> u64 {
        if self.page_store.file_name().is_some() {
            self.page_store.read_count()
        } else {
            0
        }
    }
}

fn page_store_config(database: &Database) -> Result<PageStoreConfig> {
    let settings = database.config();
    let mut config = PageStoreConfig::default();
    if let Some(file) = settings.store_file() {
        config = config.file_name(file);
    }
    if settings.read_only {
        config = config.read_only();
    }
    if let Some(key) = &settings.file_encryption_key {
        if key.len() % 2 != 0 {
            return Err(DbError::InvalidEncryptionKey(key.len()));
        }
        config = config.encryption_key(derive_password(key));
    }
    config = if settings.compress {
        config.compress().page_split_size(COMPRESSED_PAGE_SPLIT_SIZE)
    } else {
        config.page_split_size(settings.page_size)
    };
    if let Some(delay) = settings.auto_commit_delay {
        config = config.auto_commit_delay(delay);
    }
    config.cache_size_mb = (settings.cache_size_kb / 1024).max(1);
    Ok(config.background_error_sink(database.background_error_sink()))
}

/// Creates the parent directory unless the store file exists and is not writable.
fn create_directory(file: &Path) -> Result<()> {
    if let Ok(metadata) = fs::metadata(file) {
        if metadata.permissions().readonly() {
            return Ok(());
        }
    }
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|source| DbError::FileSystem {
            path: parent.to_owned(),
            source,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    use anyhow::Result;
    use rand::Rng;
    use tempfile::tempdir;

    use super::{create_directory, derive_password, page_store_config, Store};
    use crate::common::{ObjectIds, COMPRESSED_PAGE_SPLIT_SIZE, SUFFIX_MV_FILE, SUFFIX_TEMP_FILE};
    use crate::database::{Database, DatabaseConfig};
    use crate::engine::session::Session;
    use crate::engine::table::TableSpec;
    use crate::error::DbError;
    use crate::storage::FileBackend;
    use crate::tuple::value::Value;

    fn open(config: DatabaseConfig) -> Result<Store> {
        Ok(Store::open(Database::new(config), Arc::new(FileBackend))?)
    }

    #[test]
    fn password_pairs_bytes() {
        assert_eq!(derive_password(&[0x12, 0x34, 0xff, 0x01]), vec![0x1234, 0xff01]);
        assert!(derive_password(&[]).is_empty());

        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let len = rng.gen_range(0..32) * 2;
            let key: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let password = derive_password(&key);
            assert_eq!(password.len(), key.len() / 2);
            assert_eq!(password, derive_password(&key));
        }
    }

    #[test]
    fn compression_forces_large_page_split() -> Result<()> {
        let database = Database::new(
            DatabaseConfig::with_path("c", "/tmp/c")
                .page_size(8192)
                .compress(true),
        );
        assert_eq!(page_store_config(&database)?.page_split_size, COMPRESSED_PAGE_SPLIT_SIZE);

        let database = Database::new(DatabaseConfig::with_path("c", "/tmp/c").page_size(8192));
        let config = page_store_config(&database)?;
        assert_eq!(config.page_split_size, 8192);
        assert!(!config.compress);
        Ok(())
    }

    #[test]
    fn odd_key_is_rejected() {
        let database = Database::new(DatabaseConfig::in_memory("k").encryption_key(vec![1, 2, 3]));
        assert!(matches!(
            page_store_config(&database),
            Err(DbError::InvalidEncryptionKey(3))
        ));
    }

    #[test]
    fn temporary_names_are_unique_across_threads() -> Result<()> {
        let store = open(DatabaseConfig::in_memory("tmp"))?;
        let names: Vec<String> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        (0..100)
                            .map(|_| store.next_temporary_map_name())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });
        let unique: HashSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), 800);
        assert!(names.iter().all(|name| name.starts_with("temp.")));
        Ok(())
    }

    #[test]
    fn temporary_names_skip_existing_maps() -> Result<()> {
        let data_dir = tempdir()?;
        let config = DatabaseConfig::with_path("skip", data_dir.path().join("skip"));

        let store = open(config.clone())?;
        let table = store.create_table(TableSpec::new(1, "scratch").temporary())?;
        assert_eq!(table.map_name(), "temp.0");
        let session = Session::new(Arc::clone(store.database()));
        table.put(&session.transaction(&store)?, &[Value::from(1)], &[Value::from(2)])?;
        session.commit()?;
        store.close(std::time::Duration::ZERO)?;

        let store = open(config)?;
        assert_eq!(store.next_temporary_map_name(), "temp.1");
        Ok(())
    }

    #[test]
    fn table_rows_go_through_transactions() -> Result<()> {
        let store = open(DatabaseConfig::in_memory("rows"))?;
        let table = store.create_table(TableSpec::new(7, "users"))?;
        assert_eq!(table.map_name(), "table.7");
        assert!(store.tables().contains_key("table.7"));

        let session = Session::new(Arc::clone(store.database()));
        let transaction = session.transaction(&store)?;
        table.put(&transaction, &[Value::from(1)], &[Value::from("ann")])?;
        table.put(&transaction, &[Value::from(2)], &[Value::from("bob")])?;
        table.remove(&transaction, &[Value::from(2)])?;
        session.commit()?;

        let transaction = session.transaction(&store)?;
        assert_eq!(table.get(&transaction, &[Value::from(1)])?, Some(vec![Value::from("ann")]));
        assert_eq!(table.get(&transaction, &[Value::from(2)])?, None);
        session.rollback()?;

        store.remove_table(&table)?;
        assert!(store.tables().is_empty());
        assert!(!store.page_store.has_map("table.7"));
        Ok(())
    }

    #[test]
    fn statistics_count_reads_of_file_stores() -> Result<()> {
        let data_dir = tempdir()?;
        let store = open(DatabaseConfig::with_path("stats", data_dir.path().join("stats")))?;
        let table = store.create_table(TableSpec::new(1, "t"))?;
        let session = Session::new(Arc::clone(store.database()));

        let transaction = session.transaction(&store)?;
        table.put(&transaction, &[Value::from(1)], &[Value::from(1)])?;
        session.commit()?;

        store.statistics_start();
        let transaction = session.transaction(&store)?;
        for i in 0..3 {
            table.get(&transaction, &[Value::from(i)])?;
        }
        session.rollback()?;
        assert_eq!(store.statistics_end().reads, 3);

        let memory = open(DatabaseConfig::in_memory("mem"))?;
        memory.statistics_start();
        assert_eq!(memory.statistics_end().reads, 0);
        Ok(())
    }

    #[test]
    fn cache_size_is_converted_to_megabytes() -> Result<()> {
        let store = open(DatabaseConfig::in_memory("cache"))?;
        store.set_cache_size(10);
        assert_eq!(store.page_store.cache_size(), 1);
        store.set_cache_size(64 * 1024);
        assert_eq!(store.page_store.cache_size(), 64);
        Ok(())
    }

    #[test]
    fn collection_on_read_only_store_does_nothing() -> Result<()> {
        let data_dir = tempdir()?;
        let config = DatabaseConfig::with_path("ro", data_dir.path().join("ro"));
        let store = open(config.clone())?;
        let name = store.next_temporary_map_name();
        store.page_store.open_map(&name)?;
        store.close(std::time::Duration::ZERO)?;

        let store = open(config.read_only(true))?;
        assert_eq!(store.remove_temporary_maps(&ObjectIds::new())?, Default::default());
        assert!(store.page_store.has_map(&name));
        Ok(())
    }

    #[test]
    fn open_creates_missing_directories() -> Result<()> {
        let data_dir = tempdir()?;
        let store = open(DatabaseConfig::with_path("nested", data_dir.path().join("a/b/db")))?;
        assert!(data_dir.path().join("a/b").is_dir());
        assert!(store.file_name().is_some_and(|file| file.exists()));
        store.close(std::time::Duration::ZERO)?;
        Ok(())
    }

    #[test]
    fn read_only_open_creates_no_directories() -> Result<()> {
        let data_dir = tempdir()?;
        let config = DatabaseConfig::with_path("nested", data_dir.path().join("a/b/db"));
        assert!(matches!(
            open(config.read_only(true)).map_err(|e| e.downcast::<DbError>()),
            Err(Ok(DbError::Io { .. }))
        ));
        assert!(!data_dir.path().join("a").exists());
        Ok(())
    }

    #[test]
    fn existing_read_only_file_is_left_alone() -> Result<()> {
        let data_dir = tempdir()?;
        let file = data_dir.path().join("locked.mv.db");
        std::fs::write(&file, b"")?;
        let mut permissions = std::fs::metadata(&file)?.permissions();
        permissions.set_readonly(true);
        std::fs::set_permissions(&file, permissions)?;

        create_directory(&file)?;
        assert!(std::fs::metadata(&file)?.permissions().readonly());
        Ok(())
    }

    #[test]
    fn open_removes_interrupted_compaction() -> Result<()> {
        let data_dir = tempdir()?;
        let config = DatabaseConfig::with_path("partial", data_dir.path().join("partial"));
        let store = open(config.clone())?;
        store.create_table(TableSpec::new(1, "t"))?;
        store.close(std::time::Duration::ZERO)?;

        let leftover = data_dir
            .path()
            .join(format!("partial{SUFFIX_MV_FILE}{SUFFIX_TEMP_FILE}"));
        std::fs::write(&leftover, b"partial")?;
        let store = open(config)?;
        assert!(!leftover.exists());
        store.close(std::time::Duration::ZERO)?;
        Ok(())
    }
}
