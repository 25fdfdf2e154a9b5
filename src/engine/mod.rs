use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::database::Database;
use crate::error::Result;
use crate::storage::{FileBackend, StorageBackend};

mod in_doubt;
mod map_name;
mod session;
mod store;
mod table;

pub use in_doubt::{InDoubtDescription, InDoubtState, InDoubtTransaction, Resolution};
pub use map_name::MapName;
pub use session::Session;
pub use store::{derive_password, CollectionReport, RecoveryReport, Statistics, Store};
pub use table::{Table, TableSpec};

pub const ENGINE_NAME: &str = "MVStore";

lazy_static! {
    static ref GLOBAL: StorageEngine = StorageEngine::new(Arc::new(FileBackend));
}

/// Registry of the open stores, one per database name.
pub struct StorageEngine {
    backend: Arc<dyn StorageBackend>,
    stores: DashMap<String, Arc<Store>>,
    opening: DashMap<String, Arc<Mutex<()>>>,
}

impl StorageEngine {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            stores: DashMap::new(),
            opening: DashMap::new(),
        }
    }

    /// The process wide engine backed by store files.
    pub fn global() -> &'static StorageEngine {
        &GLOBAL
    }

    pub fn name(&self) -> &'static str {
        ENGINE_NAME
    }

    /// Creates a table of the session's database, opening its store first if needed.
    pub fn create_table(&self, session: &Session, spec: TableSpec) -> Result<Arc<Table>> {
        let store = self.open_store(session.database())?;
        store.create_table(spec)
    }

    pub fn get_store(&self, database_name: &str) -> Option<Arc<Store>> {
        self.stores
            .get(database_name)
            .map(|store| Arc::clone(store.value()))
    }

    /// Returns the store of `database`, opening it if this is the first access.
    ///
    /// Concurrent first accesses to the same database open it once. Different
    /// databases never wait for each other.
    pub fn open_store(&self, database: &Arc<Database>) -> Result<Arc<Store>> {
        let name = database.name();
        if let Some(store) = self.get_store(name) {
            return Ok(store);
        }
        let lock = Arc::clone(self.opening.entry(name.to_owned()).or_default().value());
        let _guard = lock.lock();
        if let Some(store) = self.get_store(name) {
            return Ok(store);
        }
        let store = Arc::new(Store::open(Arc::clone(database), Arc::clone(&self.backend))?);
        self.stores.insert(name.to_owned(), Arc::clone(&store));
        Ok(store)
    }

    /// Unregisters and closes the store of `database_name`. A later open starts afresh.
    pub fn close_store(&self, database_name: &str, max_compact_time: Duration) -> Result<()> {
        let lock = match self.opening.get(database_name) {
            Some(lock) => Arc::clone(lock.value()),
            None => return Ok(()),
        };
        let guard = lock.lock();
        let closed = match self.stores.remove(database_name) {
            Some((_, store)) => store.close(max_compact_time),
            None => Ok(()),
        };
        drop(guard);
        // Kept while another caller holds the lock, so opens of this name stay serialized.
        self.opening
            .remove_if(database_name, |_, entry| Arc::strong_count(entry) == 2);
        closed
    }

    #[cfg(test)]
    fn open_locks(&self) -> usize {
        self.opening.len()
    }
}
