use std::sync::Arc;

use crate::common::ObjectId;
use crate::error::Result;
use crate::transaction::{Transaction, TransactionMap};
use crate::tuple::value::Value;
use crate::tuple::{Row, ValueDataType};

/// What the table layer asks the engine to create.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableSpec {
    pub id: ObjectId,
    pub name: String,
    /// Temporary tables live in a `temp.<n>` map that is dropped on the next start.
    pub temporary: bool,
}

impl TableSpec {
    pub fn new(id: ObjectId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            temporary: false,
        }
    }

    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }
}

/// A table whose rows are stored in one persisted map, keyed by the primary key columns.
#[derive(Debug)]
pub struct Table {
    id: ObjectId,
    name: String,
    map_name: String,
    temporary: bool,
}

impl Table {
    pub(crate) fn new(spec: TableSpec, map_name: String) -> Self {
        Self {
            id: spec.id,
            name: spec.name,
            map_name,
            temporary: spec.temporary,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn map_name(&self) -> &str {
        &self.map_name
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn open_map(&self, transaction: &Transaction) -> Result<TransactionMap> {
        Ok(transaction.open_map(
            &self.map_name,
            Arc::new(ValueDataType),
            Arc::new(ValueDataType),
        )?)
    }

    pub fn put(&self, transaction: &Transaction, key: &[Value], row: &[Value]) -> Result<()> {
        Ok(self.open_map(transaction)?.put(key, row)?)
    }

    pub fn get(&self, transaction: &Transaction, key: &[Value]) -> Result<Option<Row>> {
        Ok(self.open_map(transaction)?.get(key)?)
    }

    pub fn remove(&self, transaction: &Transaction, key: &[Value]) -> Result<()> {
        Ok(self.open_map(transaction)?.remove(key)?)
    }
}
