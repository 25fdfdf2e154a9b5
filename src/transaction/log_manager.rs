use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::{
    TransactionId, TransactionInfo, TransactionManager, TransactionMap, TransactionStatus,
};
use crate::storage::codec::{Deserializer, Serializer};
use crate::storage::{MapHandle, PageStore, PageStoreError, StoreErrorCode, StoreResult};

/// Name of the system map holding one record per open transaction.
pub const TRANSACTION_LOG_MAP: &str = "transaction.log";

const WRITE_PUT: u8 = 0;
const WRITE_DELETE: u8 = 1;
const WRITE_DROP_MAP: u8 = 2;

#[derive(Clone, Debug, PartialEq)]
enum Write {
    Put {
        map: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        map: String,
        key: Vec<u8>,
    },
    DropMap {
        map: String,
    },
}

#[derive(Debug)]
struct TransactionRecord {
    status: TransactionStatus,
    name: Option<String>,
    writes: Vec<Write>,
}

impl TransactionRecord {
    fn new() -> Self {
        Self {
            status: TransactionStatus::Active,
            name: None,
            writes: Vec::new(),
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut serializer = Serializer::new();
        serializer.serialize_u8(self.status as u8);
        serializer.serialize_option_str(self.name.as_deref());
        serializer.serialize_u32(self.writes.len() as u32);
        for write in &self.writes {
            match write {
                Write::Put { map, key, value } => {
                    serializer.serialize_u8(WRITE_PUT);
                    serializer.serialize_str(map);
                    serializer.serialize_bytes(key);
                    serializer.serialize_bytes(value);
                }
                Write::Delete { map, key } => {
                    serializer.serialize_u8(WRITE_DELETE);
                    serializer.serialize_str(map);
                    serializer.serialize_bytes(key);
                }
                Write::DropMap { map } => {
                    serializer.serialize_u8(WRITE_DROP_MAP);
                    serializer.serialize_str(map);
                }
            }
        }
        serializer.end()
    }

    fn decode(bytes: &[u8]) -> StoreResult<Self> {
        let mut deserializer = Deserializer::new(bytes);
        let status = TransactionStatus::try_from(deserializer.deserialize_u8()?)?;
        let name = deserializer.deserialize_option_string()?;
        let count = deserializer.deserialize_u32()?;
        let mut writes = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let write = match deserializer.deserialize_u8()? {
                WRITE_PUT => Write::Put {
                    map: deserializer.deserialize_string()?,
                    key: deserializer.deserialize_bytes()?.to_vec(),
                    value: deserializer.deserialize_bytes()?.to_vec(),
                },
                WRITE_DELETE => Write::Delete {
                    map: deserializer.deserialize_string()?,
                    key: deserializer.deserialize_bytes()?.to_vec(),
                },
                WRITE_DROP_MAP => Write::DropMap {
                    map: deserializer.deserialize_string()?,
                },
                other => {
                    return Err(PageStoreError::corrupt(format!(
                        "Unknown write kind {other} in transaction log"
                    )))
                }
            };
            writes.push(write);
        }
        Ok(Self {
            status,
            name,
            writes,
        })
    }

    /// Looks up the latest write of this transaction for a key.
    /// Returns None if the transaction did not touch it.
    fn lookup(&self, map: &str, key: &[u8]) -> Option<Option<Vec<u8>>> {
        self.writes.iter().rev().find_map(|write| match write {
            Write::Put { map: m, key: k, value } if m == map && k == key => {
                Some(Some(value.clone()))
            }
            Write::Delete { map: m, key: k } if m == map && k == key => Some(None),
            Write::DropMap { map: m } if m == map => Some(None),
            _ => None,
        })
    }
}

/// Transaction manager that keeps the write set of every open transaction in a
/// system map of the page store. Writes reach their target maps only when the
/// transaction commits, so a rollback just forgets the record and a crash in the
/// middle of a commit is finished by replaying the record.
pub struct LogTransactionManager {
    store: Arc<dyn PageStore>,
    log: Option<MapHandle>,
    next_tid: AtomicU64,
    open: DashMap<TransactionId, TransactionRecord>,
    closed: AtomicBool,
}

impl LogTransactionManager {
    /// Opens the manager and loads the transactions that were open when the store was
    /// last written.
    pub fn open(store: Arc<dyn PageStore>) -> StoreResult<Self> {
        let log = if store.is_read_only() && !store.has_map(TRANSACTION_LOG_MAP) {
            None
        } else {
            Some(store.open_map(TRANSACTION_LOG_MAP)?)
        };

        let open = DashMap::new();
        let mut max_tid = 0;
        if let Some(log) = &log {
            for (key, value) in store.entries(log)? {
                let tid = decode_tid(&key)?;
                max_tid = max_tid.max(tid);
                open.insert(tid, TransactionRecord::decode(&value)?);
            }
        }
        debug!(open = open.len(), "Loaded transaction log");

        Ok(Self {
            store,
            log,
            next_tid: AtomicU64::new(max_tid + 1),
            open,
            closed: AtomicBool::new(false),
        })
    }

    fn log(&self) -> StoreResult<&MapHandle> {
        self.log.as_ref().ok_or_else(|| {
            PageStoreError::new(
                StoreErrorCode::WritingFailed,
                "Transactions cannot be started on a read-only store",
            )
        })
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(PageStoreError::new(
                StoreErrorCode::Closed,
                "Transaction manager is closed",
            ))
        } else {
            Ok(())
        }
    }

    fn persist(&self, tid: TransactionId, record: &TransactionRecord) -> StoreResult<()> {
        self.store
            .put(self.log()?, &tid.to_be_bytes(), &record.encode())
    }

    fn forget(&self, tid: TransactionId) -> StoreResult<()> {
        self.open.remove(&tid);
        self.store.delete(self.log()?, &tid.to_be_bytes()).map(|_| ())
    }

    fn apply(&self, write: &Write) -> StoreResult<()> {
        match write {
            Write::Put { map, key, value } => {
                let map = self.store.open_map(map)?;
                self.store.put(&map, key, value)
            }
            Write::Delete { map, key } => {
                if self.store.has_map(map) {
                    let map = self.store.open_map(map)?;
                    self.store.delete(&map, key)?;
                }
                Ok(())
            }
            Write::DropMap { map } => {
                if self.store.has_map(map) {
                    let map = self.store.open_map(map)?;
                    self.store.remove_map(&map)?;
                }
                Ok(())
            }
        }
    }

    fn record_write(&self, tid: TransactionId, write: Write) -> StoreResult<()> {
        self.check_open()?;
        let mut record = self.open.get_mut(&tid).ok_or_else(|| unknown(tid))?;
        if !record.status.is_active() {
            return Err(PageStoreError::new(
                StoreErrorCode::Internal,
                format!(
                    "Transaction {} is {} and cannot be written to",
                    tid, record.status
                ),
            ));
        }
        record.writes.push(write);
        self.persist(tid, &record)
    }
}

impl TransactionManager for LogTransactionManager {
    fn begin(&self) -> StoreResult<TransactionId> {
        self.check_open()?;
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        let record = TransactionRecord::new();
        self.persist(tid, &record)?;
        self.open.insert(tid, record);
        Ok(tid)
    }

    fn open_transactions(&self) -> Vec<TransactionInfo> {
        let mut list: Vec<TransactionInfo> = self
            .open
            .iter()
            .map(|entry| TransactionInfo {
                id: *entry.key(),
                status: entry.status,
                name: entry.name.clone(),
            })
            .collect();
        list.sort_by_key(|info| info.id);
        list
    }

    fn info(&self, tid: TransactionId) -> StoreResult<TransactionInfo> {
        let record = self.open.get(&tid).ok_or_else(|| unknown(tid))?;
        Ok(TransactionInfo {
            id: tid,
            status: record.status,
            name: record.name.clone(),
        })
    }

    fn set_name(&self, tid: TransactionId, name: Option<&str>) -> StoreResult<()> {
        self.check_open()?;
        let mut record = self.open.get_mut(&tid).ok_or_else(|| unknown(tid))?;
        record.name = name.map(str::to_owned);
        self.persist(tid, &record)
    }

    fn prepare(&self, tid: TransactionId) -> StoreResult<()> {
        self.check_open()?;
        let mut record = self.open.get_mut(&tid).ok_or_else(|| unknown(tid))?;
        record.status = record.status.transition(TransactionStatus::Prepared)?;
        self.persist(tid, &record)
    }

    fn commit(&self, tid: TransactionId) -> StoreResult<()> {
        self.check_open()?;
        let mut record = self.open.get_mut(&tid).ok_or_else(|| unknown(tid))?;
        if record.status != TransactionStatus::Committing {
            record.status = record.status.transition(TransactionStatus::Committing)?;
            self.persist(tid, &record)?;
        }
        for write in &record.writes {
            self.apply(write)?;
        }
        record.status = record.status.transition(TransactionStatus::Committed)?;
        drop(record);
        self.forget(tid)
    }

    fn rollback(&self, tid: TransactionId) -> StoreResult<()> {
        self.check_open()?;
        let mut record = self.open.get_mut(&tid).ok_or_else(|| unknown(tid))?;
        record.status = record.status.transition(TransactionStatus::RolledBack)?;
        drop(record);
        self.forget(tid)
    }

    fn open_map(&self, tid: TransactionId, map: &str) -> StoreResult<()> {
        self.check_open()?;
        if !self.open.contains_key(&tid) {
            return Err(unknown(tid));
        }
        if !self.store.has_map(map) {
            self.store.open_map(map)?;
        }
        Ok(())
    }

    fn read(&self, tid: TransactionId, map: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.check_open()?;
        {
            let record = self.open.get(&tid).ok_or_else(|| unknown(tid))?;
            if let Some(own) = record.lookup(map, key) {
                return Ok(own);
            }
        }
        if !self.store.has_map(map) {
            return Ok(None);
        }
        let map = self.store.open_map(map)?;
        self.store.get(&map, key)
    }

    fn write(
        &self,
        tid: TransactionId,
        map: &str,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> StoreResult<()> {
        let write = match value {
            Some(value) => Write::Put {
                map: map.to_owned(),
                key: key.to_vec(),
                value: value.to_vec(),
            },
            None => Write::Delete {
                map: map.to_owned(),
                key: key.to_vec(),
            },
        };
        self.record_write(tid, write)
    }

    fn remove_map(&self, map: &TransactionMap) -> StoreResult<()> {
        self.record_write(
            map.transaction_id(),
            Write::DropMap {
                map: map.name().to_owned(),
            },
        )
    }

    fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.store.is_read_only() {
            self.store.commit()?;
        }
        Ok(())
    }
}

fn unknown(tid: TransactionId) -> PageStoreError {
    PageStoreError::new(
        StoreErrorCode::Internal,
        format!("Transaction {tid} is not open"),
    )
}

fn decode_tid(key: &[u8]) -> StoreResult<TransactionId> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| PageStoreError::corrupt("Invalid key in transaction log"))?;
    Ok(TransactionId::from_be_bytes(bytes))
}
