pub mod common;
pub mod database;
pub mod engine;
pub mod error;
pub mod storage;
pub mod transaction;
pub mod tuple;

pub use database::{Database, DatabaseConfig};
pub use engine::{StorageEngine, Store};
pub use error::{DbError, Result};
