//! Durable state for the conductor execution core.
//!
//! Embedded SQLite in WAL mode: a read pool for queries and a
//! single-connection write pool that serializes every write and
//! transaction. Schema lives in `migrations/` and is applied at runtime
//! with a `sqlx` migrator.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;

pub use config::DbConfig;
pub use pool::{Db, default_migrations_path};
