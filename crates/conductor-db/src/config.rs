use std::env;
use std::path::{Path, PathBuf};

/// Database configuration.
///
/// Reads from the `CONDUCTOR_DATABASE_PATH` environment variable, falling
/// back to `conductor.db` in the working directory when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
    /// Maximum connections in the read pool. The write pool is always one
    /// connection so writes serialize.
    pub max_readers: u32,
}

impl DbConfig {
    /// The default database file used when no environment variable is set.
    pub const DEFAULT_PATH: &str = "conductor.db";

    /// Build a config from the environment.
    ///
    /// Priority: `CONDUCTOR_DATABASE_PATH` env var, then the compile-time
    /// default.
    pub fn from_env() -> Self {
        let path = env::var("CONDUCTOR_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(Self::DEFAULT_PATH));
        Self {
            path,
            max_readers: 8,
        }
    }

    /// Build a config from an explicit path (useful for tests).
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_readers: 8,
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
