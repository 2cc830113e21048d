//! Compute provider abstraction
//!
//! Normalizes instance create/delete/power/list and SSH key registration
//! across heterogeneous compute backends.

use async_trait::async_trait;
use nimbus_common::retry::{self, Backoff};
use nimbus_common::{Error, InstanceRecord, PowerAction, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Provider-side instance status, normalized across backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Initializing,
    Starting,
    Running,
    Stopping,
    Off,
    Deleting,
    Unknown,
}

/// Request to allocate one instance
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: String,
    pub size: String,
    pub region: String,
    pub image: String,
    /// Provider-side SSH key id (from [`ComputeProvider::ensure_ssh_key`])
    pub ssh_key_id: String,
    pub labels: HashMap<String, String>,
    pub user_data: Option<String>,
}

/// An instance as the provider reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInstance {
    pub provider_id: String,
    pub name: String,
    pub status: ProviderStatus,
    pub ipv4: Option<String>,
    pub size: String,
    pub region: String,
}

impl ProviderInstance {
    /// Network is up once the instance runs and has a public address.
    pub fn is_network_ready(&self) -> bool {
        self.status == ProviderStatus::Running && self.ipv4.is_some()
    }

    /// Copy provider-owned fields onto a local record.
    pub fn apply_to(&self, record: &mut InstanceRecord) {
        record.provider_id = Some(self.provider_id.clone());
        if self.ipv4.is_some() {
            record.ipv4 = self.ipv4.clone();
        }
    }
}

/// Result of a delete call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyGone,
}

/// One purchasable instance size
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeInfo {
    pub name: String,
    pub cores: u32,
    pub memory_gb: f64,
    pub disk_gb: u64,
    pub hourly_price: f64,
    pub currency: String,
    /// Regions where the size can be ordered; empty means everywhere
    #[serde(default)]
    pub regions: Vec<String>,
}

/// Sizes and regions a provider supports
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub sizes: Vec<SizeInfo>,
    pub regions: Vec<String>,
}

impl Catalog {
    /// Resolve a size/region pair, rejecting anything the provider does not sell.
    pub fn validate(&self, size: &str, region: &str) -> Result<&SizeInfo> {
        if !self.regions.iter().any(|r| r == region) {
            return Err(Error::provider(
                nimbus_common::ProviderErrorKind::InvalidSpec,
                format!("unsupported region '{}'", region),
            ));
        }
        let info = self.sizes.iter().find(|s| s.name == size).ok_or_else(|| {
            Error::provider(
                nimbus_common::ProviderErrorKind::InvalidSpec,
                format!("unsupported size '{}'", size),
            )
        })?;
        if !info.regions.is_empty() && !info.regions.iter().any(|r| r == region) {
            return Err(Error::provider(
                nimbus_common::ProviderErrorKind::InvalidSpec,
                format!("size '{}' is not offered in '{}'", size, region),
            ));
        }
        Ok(info)
    }
}

/// Compute backend contract
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Registry name ("hetzner", "simulated", ...)
    fn name(&self) -> &str;

    /// Allocate an instance. Billable from the moment this returns `Ok`.
    async fn create_instance(&self, req: &CreateRequest) -> Result<ProviderInstance>;

    /// Current provider view; `Error::NotFound` when absent.
    async fn get_instance(&self, provider_id: &str) -> Result<ProviderInstance>;

    /// Delete an instance. Deleting an absent instance succeeds.
    async fn delete_instance(&self, provider_id: &str) -> Result<DeleteOutcome>;

    async fn power_action(&self, provider_id: &str, action: PowerAction) -> Result<()>;

    async fn list_instances(&self) -> Result<Vec<ProviderInstance>>;

    /// Return the provider key id for `public_key`, registering it only if no
    /// existing key has the same content.
    async fn ensure_ssh_key(&self, name: &str, public_key: &str) -> Result<String>;

    async fn catalog(&self) -> Result<Catalog>;
}

/// Decorator retrying transient failures with bounded backoff.
///
/// `create_instance` is passed through untouched: a timed-out create may still
/// have allocated an instance, so it is never replayed blindly.
pub struct Retrying<P> {
    inner: P,
    policy: Backoff,
}

impl<P: ComputeProvider> Retrying<P> {
    pub fn new(inner: P, policy: Backoff) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

#[async_trait]
impl<P: ComputeProvider> ComputeProvider for Retrying<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn create_instance(&self, req: &CreateRequest) -> Result<ProviderInstance> {
        self.inner.create_instance(req).await
    }

    async fn get_instance(&self, provider_id: &str) -> Result<ProviderInstance> {
        retry::retry(&self.policy, "get instance", || self.inner.get_instance(provider_id)).await
    }

    async fn delete_instance(&self, provider_id: &str) -> Result<DeleteOutcome> {
        retry::retry(&self.policy, "delete instance", || {
            self.inner.delete_instance(provider_id)
        })
        .await
    }

    async fn power_action(&self, provider_id: &str, action: PowerAction) -> Result<()> {
        retry::retry(&self.policy, "power action", || {
            self.inner.power_action(provider_id, action)
        })
        .await
    }

    async fn list_instances(&self) -> Result<Vec<ProviderInstance>> {
        retry::retry(&self.policy, "list instances", || self.inner.list_instances()).await
    }

    async fn ensure_ssh_key(&self, name: &str, public_key: &str) -> Result<String> {
        retry::retry(&self.policy, "ensure ssh key", || {
            self.inner.ensure_ssh_key(name, public_key)
        })
        .await
    }

    async fn catalog(&self) -> Result<Catalog> {
        retry::retry(&self.policy, "catalog", || self.inner.catalog()).await
    }
}

/// Providers by name, with a default
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ComputeProvider>>,
    default: Option<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider. The first one registered becomes the default.
    pub fn register(&mut self, provider: Arc<dyn ComputeProvider>) {
        let name = provider.name().to_string();
        info!("Registered compute provider: {}", name);
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.providers.insert(name, provider);
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.providers.contains_key(name) {
            return Err(Error::Validation(format!("unknown provider '{}'", name)));
        }
        self.default = Some(name.to_string());
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default.as_deref()
    }

    /// Look up by name, or the default when `name` is `None`.
    pub fn get(&self, name: Option<&str>) -> Result<Arc<dyn ComputeProvider>> {
        let name = match name {
            Some(n) => n,
            None => self
                .default
                .as_deref()
                .ok_or_else(|| Error::Validation("no compute provider configured".to_string()))?,
        };
        debug!("Resolving provider {}", name);
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("unknown provider '{}'", name)))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}
