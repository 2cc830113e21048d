//! Nimbus Common Library
//!
//! Shared types, persistence, crypto and retry utilities for the Nimbus
//! control plane.

pub mod crypto;
pub mod db;
pub mod error;
pub mod lock;
pub mod retry;
pub mod types;

// Re-export commonly used types
pub use crypto::{Sealed, SshKeyMaterial};
pub use db::{KvStore, KvStoreExt, MemoryStore, SqliteStore};
pub use error::{Error, ErrorBody, ErrorKind, ProviderErrorKind, Result};
pub use lock::KeyedLocks;
pub use retry::{Backoff, Poll};
pub use types::*;

/// Nimbus version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".nimbus")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}

/// Default config path
pub fn default_config_path() -> std::path::PathBuf {
    default_store_path().join("config.toml")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
