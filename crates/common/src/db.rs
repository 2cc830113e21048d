//! Namespaced key-value state store
//!
//! The store is opaque, untyped storage: values are JSON documents and callers
//! seal anything secret before it gets here.

use crate::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Well-known namespaces
pub mod ns {
    pub const INSTANCES: &str = "instances";
    pub const SSH_KEYS: &str = "ssh_keys";
    pub const CERTIFICATES: &str = "certificates";
    pub const ORPHANS: &str = "orphans";
    pub const EDGE_LEFTOVERS: &str = "edge_leftovers";
    pub const TERMINAL_SESSIONS: &str = "terminal_sessions";
}

/// Key-value persistence
pub trait KvStore: Send + Sync {
    fn put(&self, namespace: &str, key: &str, value: &serde_json::Value) -> Result<()>;

    fn get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>>;

    /// Returns whether the key existed
    fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    /// All entries in a namespace, ordered by key
    fn list(&self, namespace: &str) -> Result<Vec<(String, serde_json::Value)>>;
}

/// Typed helpers over any [`KvStore`]
pub trait KvStoreExt: KvStore {
    fn put_json<T: Serialize>(&self, namespace: &str, key: &str, value: &T) -> Result<()> {
        self.put(namespace, key, &serde_json::to_value(value)?)
    }

    fn get_json<T: DeserializeOwned>(&self, namespace: &str, key: &str) -> Result<Option<T>> {
        match self.get(namespace, key)? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, namespace: &str) -> Result<Vec<T>> {
        self.list(namespace)?
            .into_iter()
            .map(|(_, v)| Ok(serde_json::from_value(v)?))
            .collect()
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

/// SQLite-backed store
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened state store at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, key)
            );
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }
}

impl KvStore for SqliteStore {
    fn put(&self, namespace: &str, key: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock();
        let now = chrono::Utc::now().timestamp();

        conn.execute(
            "INSERT OR REPLACE INTO kv (namespace, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![namespace, key, serde_json::to_string(value)?, now],
        )?;

        debug!("Stored {}/{}", namespace, key);
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock();

        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        )?;

        if rows > 0 {
            debug!("Deleted {}/{}", namespace, key);
        }

        Ok(rows > 0)
    }

    fn list(&self, namespace: &str) -> Result<Vec<(String, serde_json::Value)>> {
        let conn = self.conn.lock();

        let mut stmt =
            conn.prepare("SELECT key, value FROM kv WHERE namespace = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![namespace], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (key, raw) = row?;
            results.push((key, serde_json::from_str(&raw)?));
        }

        Ok(results)
    }
}

/// In-process store
#[derive(Default, Clone)]
pub struct MemoryStore {
    namespaces: Arc<DashMap<String, BTreeMap<String, serde_json::Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn put(&self, namespace: &str, key: &str, value: &serde_json::Value) -> Result<()> {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn get(&self, namespace: &str, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.get(key).cloned()))
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        Ok(self
            .namespaces
            .get_mut(namespace)
            .map_or(false, |mut ns| ns.remove(key).is_some()))
    }

    fn list(&self, namespace: &str) -> Result<Vec<(String, serde_json::Value)>> {
        Ok(self
            .namespaces
            .get(namespace)
            .map(|ns| ns.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }
}
