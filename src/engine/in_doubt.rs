use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::error::{DbError, Result};
use crate::storage::PageStore;
use crate::transaction::{Transaction, TransactionId};

const IN_DOUBT: u8 = 0;
const COMMIT: u8 = 1;
const ROLLBACK: u8 = 2;

/// Administrative outcome recorded for an in-doubt transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InDoubtState {
    InDoubt,
    Commit,
    Rollback,
}

impl TryFrom<u8> for InDoubtState {
    type Error = DbError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            IN_DOUBT => Ok(Self::InDoubt),
            COMMIT => Ok(Self::Commit),
            ROLLBACK => Ok(Self::Rollback),
            other => Err(DbError::internal(format!("in-doubt state={other}"))),
        }
    }
}

impl fmt::Display for InDoubtState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InDoubtState::InDoubt => "IN_DOUBT",
            InDoubtState::Commit => "COMMIT",
            InDoubtState::Rollback => "ROLLBACK",
        };
        f.write_str(name)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    Commit,
    Rollback,
}

impl Resolution {
    fn outcome(self) -> InDoubtState {
        match self {
            Resolution::Commit => InDoubtState::Commit,
            Resolution::Rollback => InDoubtState::Rollback,
        }
    }
}

impl InDoubtState {
    fn code(self) -> u8 {
        match self {
            InDoubtState::InDoubt => IN_DOUBT,
            InDoubtState::Commit => COMMIT,
            InDoubtState::Rollback => ROLLBACK,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InDoubtDescription {
    pub state: InDoubtState,
    pub name: Option<String>,
}

/// A prepared transaction waiting for an operator or coordinator decision.
pub struct InDoubtTransaction {
    page_store: Arc<dyn PageStore>,
    transaction: Transaction,
    name: Option<String>,
    state: AtomicU8,
    deciding: Mutex<()>,
}

impl InDoubtTransaction {
    pub(crate) fn new(
        page_store: Arc<dyn PageStore>,
        transaction: Transaction,
        name: Option<String>,
    ) -> Self {
        Self {
            page_store,
            transaction,
            name,
            state: AtomicU8::new(IN_DOUBT),
            deciding: Mutex::new(()),
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction.id()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Applies the decision, makes it durable, then records it.
    ///
    /// Resolving again with the same decision is a no-op; a conflicting decision fails.
    pub fn resolve(&self, resolution: Resolution) -> Result<()> {
        let _deciding = self.deciding.lock();
        let current = self.state()?;
        if current != InDoubtState::InDoubt {
            if current == resolution.outcome() {
                return Ok(());
            }
            return Err(DbError::internal(format!(
                "Transaction {} was already resolved as {}",
                self.transaction.id(),
                current
            )));
        }

        match resolution {
            Resolution::Commit => self.transaction.commit()?,
            Resolution::Rollback => self.transaction.rollback()?,
        }
        self.page_store.commit()?;
        self.state.store(resolution.outcome().code(), Ordering::Release);
        info!(
            transaction = self.transaction.id(),
            name = ?self.name,
            "Resolved in-doubt transaction as {}",
            resolution.outcome()
        );
        Ok(())
    }

    pub fn state(&self) -> Result<InDoubtState> {
        InDoubtState::try_from(self.state.load(Ordering::Acquire))
    }

    pub fn describe(&self) -> Result<InDoubtDescription> {
        Ok(InDoubtDescription {
            state: self.state()?,
            name: self.name.clone(),
        })
    }

    #[cfg(test)]
    fn force_state(&self, state: u8) {
        self.state.store(state, Ordering::Release);
    }
}
