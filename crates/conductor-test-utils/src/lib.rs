//! Shared test utilities for conductor integration tests.
//!
//! Each test gets its own SQLite database in a fresh temp directory with
//! migrations applied; dropping the returned `TempDir` removes it. No
//! external services are required.

use tempfile::TempDir;

use conductor_db::{Db, DbConfig, default_migrations_path};

/// Create a temporary database with migrations applied.
///
/// Returns `(db, dir)`. Keep `dir` alive for the duration of the test;
/// the database file lives inside it.
pub async fn create_test_db() -> (Db, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let config = DbConfig::new(dir.path().join("conductor-test.db"));

    let db = Db::connect(&config)
        .await
        .expect("failed to open test database");

    db.run_migrations(default_migrations_path())
        .await
        .expect("migrations should succeed");

    (db, dir)
}
