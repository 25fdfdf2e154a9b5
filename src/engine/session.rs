use std::sync::Arc;

use parking_lot::Mutex;

use crate::database::Database;
use crate::engine::Store;
use crate::error::{DbError, Result};
use crate::transaction::Transaction;

/// One client connection. Holds at most one open transaction.
pub struct Session {
    database: Arc<Database>,
    transaction: Mutex<Option<Transaction>>,
}

impl Session {
    pub fn new(database: Arc<Database>) -> Self {
        Self {
            database,
            transaction: Mutex::new(None),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    /// The open transaction, beginning one on `store` if there is none.
    pub fn transaction(&self, store: &Store) -> Result<Transaction> {
        let mut current = self.transaction.lock();
        if let Some(transaction) = current.as_ref() {
            return Ok(transaction.clone());
        }
        let transaction = store.begin()?;
        *current = Some(transaction.clone());
        Ok(transaction)
    }

    pub fn current_transaction(&self) -> Option<Transaction> {
        self.transaction.lock().clone()
    }

    /// Forgets the open transaction without deciding it.
    pub fn detach_transaction(&self) -> Option<Transaction> {
        self.transaction.lock().take()
    }

    pub fn commit(&self) -> Result<()> {
        let transaction = self.take()?;
        transaction.commit()?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        let transaction = self.take()?;
        transaction.rollback()?;
        Ok(())
    }

    fn take(&self) -> Result<Transaction> {
        self.detach_transaction()
            .ok_or_else(|| DbError::NoTransaction(self.database.name().to_owned()))
    }
}
