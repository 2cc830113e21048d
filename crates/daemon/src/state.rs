//! State management for the daemon
//!
//! Typed access to the key-value store. Every secret-bearing record goes
//! through [`Sealed`] before it reaches the store.

use crate::terminal::SessionRecord;
use nimbus_common::db::{ns, KvStore, KvStoreExt, MemoryStore, SqliteStore};
use nimbus_common::{
    DomainCertificate, EdgeLeftover, Error, InstanceRecord, OrphanMarker, Result, Sealed,
    SshKeyMaterial,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the key pair shared by every instance
pub const DEFAULT_SSH_KEY: &str = "default";

/// State manager for all daemon resources
#[derive(Clone)]
pub struct StateManager {
    store: Arc<dyn KvStore>,
    sealing_key: Arc<str>,
    /// Makes the name check and the insert of a new record one step
    create_gate: Arc<Mutex<()>>,
}

impl StateManager {
    pub fn new(store: Arc<dyn KvStore>, sealing_key: &str) -> Result<Self> {
        if sealing_key.is_empty() {
            return Err(Error::Encryption("sealing key is empty".to_string()));
        }
        Ok(Self {
            store,
            sealing_key: Arc::from(sealing_key),
            create_gate: Arc::new(Mutex::new(())),
        })
    }

    /// SQLite-backed state at `path`
    pub fn open(path: &Path, sealing_key: &str) -> Result<Self> {
        let store = SqliteStore::open(path)?;
        info!("State manager using {:?}", path);
        Self::new(Arc::new(store), sealing_key)
    }

    /// Volatile state (tests, throwaway runs)
    pub fn in_memory(sealing_key: &str) -> Result<Self> {
        Self::new(Arc::new(MemoryStore::new()), sealing_key)
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    // ========================================================================
    // Instances
    // ========================================================================

    /// Insert a new record, rejecting duplicate names
    pub fn insert_instance(&self, record: &InstanceRecord) -> Result<()> {
        let _gate = self.create_gate.lock();
        if self.find_instance_by_name(&record.name)?.is_some() {
            return Err(Error::Conflict(format!(
                "an instance named '{}' already exists",
                record.name
            )));
        }
        self.store.put_json(ns::INSTANCES, &record.id, record)?;
        debug!("Created instance record {} ({})", record.name, record.id);
        Ok(())
    }

    pub fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>> {
        self.store.get_json(ns::INSTANCES, id)
    }

    pub fn require_instance(&self, id: &str) -> Result<InstanceRecord> {
        self.get_instance(id)?
            .ok_or_else(|| Error::not_found("instance", id))
    }

    pub fn find_instance_by_name(&self, name: &str) -> Result<Option<InstanceRecord>> {
        Ok(self
            .list_instances()?
            .into_iter()
            .find(|r| r.name == name))
    }

    pub fn list_instances(&self) -> Result<Vec<InstanceRecord>> {
        self.store.list_json(ns::INSTANCES)
    }

    pub fn save_instance(&self, record: &InstanceRecord) -> Result<()> {
        self.store.put_json(ns::INSTANCES, &record.id, record)
    }

    pub fn remove_instance(&self, id: &str) -> Result<bool> {
        self.store.delete(ns::INSTANCES, id)
    }

    // ========================================================================
    // SSH keys (sealed)
    // ========================================================================

    pub fn load_ssh_key(&self, name: &str) -> Result<Option<SshKeyMaterial>> {
        match self.store.get_json::<Sealed>(ns::SSH_KEYS, name)? {
            Some(sealed) => Ok(Some(sealed.unwrap_with(&self.sealing_key)?)),
            None => Ok(None),
        }
    }

    pub fn store_ssh_key(&self, name: &str, key: &SshKeyMaterial) -> Result<()> {
        let sealed = Sealed::wrap(key, &self.sealing_key)?;
        self.store.put_json(ns::SSH_KEYS, name, &sealed)?;
        debug!("Stored SSH key {} ({})", name, key.fingerprint);
        Ok(())
    }

    // ========================================================================
    // Domain certificates (sealed)
    // ========================================================================

    pub fn load_certificate(&self, domain: &str) -> Result<Option<DomainCertificate>> {
        match self.store.get_json::<Sealed>(ns::CERTIFICATES, domain)? {
            Some(sealed) => Ok(Some(sealed.unwrap_with(&self.sealing_key)?)),
            None => Ok(None),
        }
    }

    /// Replace the record for the certificate's domain
    pub fn store_certificate(&self, cert: &DomainCertificate) -> Result<()> {
        let sealed = Sealed::wrap(cert, &self.sealing_key)?;
        self.store.put_json(ns::CERTIFICATES, &cert.domain, &sealed)
    }

    pub fn remove_certificate(&self, domain: &str) -> Result<bool> {
        self.store.delete(ns::CERTIFICATES, domain)
    }

    pub fn certificate_domains(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .list(ns::CERTIFICATES)?
            .into_iter()
            .map(|(k, _)| k)
            .collect())
    }

    // ========================================================================
    // Orphans
    // ========================================================================

    fn orphan_key(provider: &str, provider_id: &str) -> String {
        format!("{}/{}", provider, provider_id)
    }

    pub fn record_orphan(&self, marker: &OrphanMarker) -> Result<()> {
        let key = Self::orphan_key(&marker.provider, &marker.provider_id);
        self.store.put_json(ns::ORPHANS, &key, marker)
    }

    pub fn list_orphans(&self) -> Result<Vec<OrphanMarker>> {
        self.store.list_json(ns::ORPHANS)
    }

    pub fn clear_orphan(&self, provider: &str, provider_id: &str) -> Result<bool> {
        self.store
            .delete(ns::ORPHANS, &Self::orphan_key(provider, provider_id))
    }

    pub fn record_edge_leftover(&self, leftover: &EdgeLeftover) -> Result<()> {
        self.store
            .put_json(ns::EDGE_LEFTOVERS, &leftover.domain, leftover)
    }

    pub fn load_edge_leftover(&self, domain: &str) -> Result<Option<EdgeLeftover>> {
        self.store.get_json(ns::EDGE_LEFTOVERS, domain)
    }

    pub fn list_edge_leftovers(&self) -> Result<Vec<EdgeLeftover>> {
        self.store.list_json(ns::EDGE_LEFTOVERS)
    }

    pub fn clear_edge_leftover(&self, domain: &str) -> Result<bool> {
        self.store.delete(ns::EDGE_LEFTOVERS, domain)
    }

    // ========================================================================
    // Terminal session bookkeeping
    // ========================================================================

    pub fn record_session(&self, session: &SessionRecord) -> Result<()> {
        self.store
            .put_json(ns::TERMINAL_SESSIONS, &session.id, session)
    }

    pub fn remove_session(&self, id: &str) -> Result<bool> {
        self.store.delete(ns::TERMINAL_SESSIONS, id)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        self.store.list_json(ns::TERMINAL_SESSIONS)
    }
}
