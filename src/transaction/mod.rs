use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::storage::{PageStoreError, StoreErrorCode, StoreResult};
use crate::tuple::value::Value;
use crate::tuple::{DataType, Row};

mod log_manager;

pub use log_manager::LogTransactionManager;

pub type TransactionId = u64;

/// Lifecycle of a transaction.
///
/// ```text
/// Active ──prepare──> Prepared ──┐
///   │  └──────commit───────────> Committing ──> Committed
///   │                 Prepared ──┘
///   └──rollback──> RolledBack <──rollback── Prepared
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    Active = 0,
    Committing = 1,
    Prepared = 2,
    Committed = 3,
    RolledBack = 4,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Illegal transaction state change from {from} to {to}")]
pub struct InvalidTransition {
    pub from: TransactionStatus,
    pub to: TransactionStatus,
}

impl From<InvalidTransition> for PageStoreError {
    fn from(value: InvalidTransition) -> Self {
        PageStoreError::new(StoreErrorCode::Internal, value.to_string())
    }
}

impl TransactionStatus {
    /// The only place deciding which state changes are legal. Both the regular commit
    /// path, crash recovery and in-doubt resolution go through it.
    pub fn transition(self, to: TransactionStatus) -> Result<TransactionStatus, InvalidTransition> {
        use TransactionStatus::*;
        let allowed = matches!(
            (self, to),
            (Active, Prepared)
                | (Active, Committing)
                | (Active, RolledBack)
                | (Prepared, Committing)
                | (Prepared, RolledBack)
                | (Committing, Committed)
        );
        if allowed {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }

    /// Whether the transaction still accepts reads and writes.
    pub fn is_active(self) -> bool {
        self == TransactionStatus::Active
    }
}

impl TryFrom<u8> for TransactionStatus {
    type Error = PageStoreError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Active),
            1 => Ok(Self::Committing),
            2 => Ok(Self::Prepared),
            3 => Ok(Self::Committed),
            4 => Ok(Self::RolledBack),
            other => Err(PageStoreError::corrupt(format!(
                "Unknown transaction status {other}"
            ))),
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionStatus::Active => "ACTIVE",
            TransactionStatus::Committing => "COMMITTING",
            TransactionStatus::Prepared => "PREPARED",
            TransactionStatus::Committed => "COMMITTED",
            TransactionStatus::RolledBack => "ROLLED_BACK",
        };
        f.write_str(name)
    }
}

/// What startup recovery does with a transaction found open after a restart.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecoveryAction {
    /// The commit decision was made, only its durability step was missing.
    FinishCommit,
    /// Never decided, abort.
    Rollback,
    /// Prepared two-phase-commit participant, waits for its coordinator.
    AwaitDecision,
}

impl RecoveryAction {
    pub fn for_status(status: TransactionStatus) -> Option<Self> {
        match status {
            TransactionStatus::Committing => Some(Self::FinishCommit),
            TransactionStatus::Prepared => Some(Self::AwaitDecision),
            TransactionStatus::Active => Some(Self::Rollback),
            // already decided and applied
            TransactionStatus::Committed | TransactionStatus::RolledBack => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionInfo {
    pub id: TransactionId,
    pub status: TransactionStatus,
    pub name: Option<String>,
}

/// Transactions over maps hosted in a page store.
pub trait TransactionManager: Send + Sync {
    fn begin(&self) -> StoreResult<TransactionId>;
    /// Every transaction that is neither committed nor rolled back.
    fn open_transactions(&self) -> Vec<TransactionInfo>;
    fn info(&self, tid: TransactionId) -> StoreResult<TransactionInfo>;
    fn set_name(&self, tid: TransactionId, name: Option<&str>) -> StoreResult<()>;

    fn prepare(&self, tid: TransactionId) -> StoreResult<()>;
    fn commit(&self, tid: TransactionId) -> StoreResult<()>;
    fn rollback(&self, tid: TransactionId) -> StoreResult<()>;

    fn open_map(&self, tid: TransactionId, map: &str) -> StoreResult<()>;
    fn read(&self, tid: TransactionId, map: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;
    /// `None` deletes the key.
    fn write(
        &self,
        tid: TransactionId,
        map: &str,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> StoreResult<()>;
    /// Marks the map for removal when the owning transaction commits.
    fn remove_map(&self, map: &TransactionMap) -> StoreResult<()>;

    fn close(&self) -> StoreResult<()>;
}

/// Handle to one transaction of a [`TransactionManager`].
#[derive(Clone)]
pub struct Transaction {
    id: TransactionId,
    manager: Arc<dyn TransactionManager>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction").field("id", &self.id).finish()
    }
}

impl Transaction {
    pub fn new(id: TransactionId, manager: Arc<dyn TransactionManager>) -> Self {
        Self { id, manager }
    }

    pub fn begin(manager: &Arc<dyn TransactionManager>) -> StoreResult<Self> {
        let id = manager.begin()?;
        Ok(Self::new(id, Arc::clone(manager)))
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn status(&self) -> StoreResult<TransactionStatus> {
        Ok(self.manager.info(self.id)?.status)
    }

    pub fn name(&self) -> StoreResult<Option<String>> {
        Ok(self.manager.info(self.id)?.name)
    }

    pub fn set_name(&self, name: Option<&str>) -> StoreResult<()> {
        self.manager.set_name(self.id, name)
    }

    pub fn prepare(&self) -> StoreResult<()> {
        self.manager.prepare(self.id)
    }

    pub fn commit(&self) -> StoreResult<()> {
        self.manager.commit(self.id)
    }

    pub fn rollback(&self) -> StoreResult<()> {
        self.manager.rollback(self.id)
    }

    pub fn open_map(
        &self,
        name: &str,
        key_type: Arc<dyn DataType>,
        value_type: Arc<dyn DataType>,
    ) -> StoreResult<TransactionMap> {
        self.manager.open_map(self.id, name)?;
        Ok(TransactionMap {
            transaction: self.clone(),
            name: name.to_owned(),
            key_type,
            value_type,
        })
    }

    pub fn remove_map(&self, map: &TransactionMap) -> StoreResult<()> {
        self.manager.remove_map(map)
    }
}

/// A map as seen from inside one transaction.
pub struct TransactionMap {
    transaction: Transaction,
    name: String,
    key_type: Arc<dyn DataType>,
    value_type: Arc<dyn DataType>,
}

impl TransactionMap {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction.id
    }

    fn encode_key(&self, key: &[Value]) -> Vec<u8> {
        let mut buffer = Vec::new();
        self.key_type.encode(key, &mut buffer);
        buffer
    }

    pub fn get(&self, key: &[Value]) -> StoreResult<Option<Row>> {
        let key = self.encode_key(key);
        self.transaction
            .manager
            .read(self.transaction.id, &self.name, &key)?
            .map(|bytes| self.value_type.decode(&bytes))
            .transpose()
    }

    pub fn put(&self, key: &[Value], value: &[Value]) -> StoreResult<()> {
        let key = self.encode_key(key);
        let mut buffer = Vec::new();
        self.value_type.encode(value, &mut buffer);
        self.transaction
            .manager
            .write(self.transaction.id, &self.name, &key, Some(&buffer))
    }

    pub fn remove(&self, key: &[Value]) -> StoreResult<()> {
        let key = self.encode_key(key);
        self.transaction
            .manager
            .write(self.transaction.id, &self.name, &key, None)
    }
}
