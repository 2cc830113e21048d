//! In-process compute backend
//!
//! Behaves like a real provider (asynchronous readiness, content-addressed
//! SSH keys, idempotent deletes) without allocating anything. Faults can be
//! injected per operation to exercise retry and compensation paths.

use crate::provider::{
    Catalog, ComputeProvider, CreateRequest, DeleteOutcome, ProviderInstance, ProviderStatus,
    SizeInfo,
};
use async_trait::async_trait;
use nimbus_common::crypto::same_public_key;
use nimbus_common::{Error, PowerAction, ProviderErrorKind, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Failure to inject into the next call(s) of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    Permanent,
    Quota,
    InvalidSpec,
    Auth,
}

impl Fault {
    fn to_error(self, op: &str) -> Error {
        let message = format!("injected fault in {}", op);
        match self {
            Fault::Transient => Error::transient(message),
            Fault::Permanent => Error::provider(ProviderErrorKind::Permanent, message),
            Fault::Quota => Error::provider(ProviderErrorKind::QuotaExceeded, message),
            Fault::InvalidSpec => Error::provider(ProviderErrorKind::InvalidSpec, message),
            Fault::Auth => Error::Authentication {
                message,
                detail: None,
            },
        }
    }
}

struct SimServer {
    instance: ProviderInstance,
    ready_at: Option<Instant>,
    powered_off: bool,
}

#[derive(Default)]
struct SimState {
    servers: HashMap<String, SimServer>,
    keys: Vec<(String, String)>,
    next_id: u64,
    faults: HashMap<String, (Fault, u32)>,
    calls: HashMap<String, u32>,
}

impl SimState {
    /// Count the call and pop an injected fault, if any.
    fn enter(&mut self, op: &str) -> Result<()> {
        *self.calls.entry(op.to_string()).or_default() += 1;
        if let Some((fault, remaining)) = self.faults.get_mut(op) {
            *remaining -= 1;
            let fault = *fault;
            if *remaining == 0 {
                self.faults.remove(op);
            }
            return Err(fault.to_error(op));
        }
        Ok(())
    }
}

/// Simulated compute provider
pub struct SimulatedProvider {
    state: Mutex<SimState>,
    /// `None` means instances never become ready
    readiness_delay: Option<Duration>,
    latency: Duration,
    catalog: Catalog,
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            readiness_delay: Some(Duration::from_secs(5)),
            latency: Duration::ZERO,
            catalog: default_catalog(),
        }
    }

    pub fn with_readiness_delay(mut self, delay: Duration) -> Self {
        self.readiness_delay = Some(delay);
        self
    }

    /// Instances stay initializing forever.
    pub fn never_ready(mut self) -> Self {
        self.readiness_delay = None;
        self
    }

    /// Artificial latency added to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Fail the next `times` calls of `op` ("create", "get", "delete",
    /// "power", "list", "ensure_ssh_key", "catalog").
    pub fn inject_fault(&self, op: &str, fault: Fault, times: u32) {
        if times > 0 {
            self.state.lock().faults.insert(op.to_string(), (fault, times));
        }
    }

    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    pub fn calls(&self, op: &str) -> u32 {
        self.state.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn server_count(&self) -> usize {
        self.state.lock().servers.len()
    }

    pub fn ssh_key_count(&self) -> usize {
        self.state.lock().keys.len()
    }

    /// Drop a server behind the control plane's back.
    pub fn forget_server(&self, provider_id: &str) -> bool {
        self.state.lock().servers.remove(provider_id).is_some()
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn view(server: &SimServer) -> ProviderInstance {
        let mut instance = server.instance.clone();
        let ready = server.ready_at.map_or(false, |at| Instant::now() >= at);
        if server.powered_off {
            instance.status = ProviderStatus::Off;
        } else if ready {
            instance.status = ProviderStatus::Running;
        } else {
            instance.status = ProviderStatus::Initializing;
            instance.ipv4 = None;
        }
        instance
    }
}

fn default_catalog() -> Catalog {
    let size = |name: &str, cores, memory_gb, disk_gb, hourly_price| SizeInfo {
        name: name.to_string(),
        cores,
        memory_gb,
        disk_gb,
        hourly_price,
        currency: "EUR".to_string(),
        regions: Vec::new(),
    };
    Catalog {
        sizes: vec![
            size("small", 1, 2.0, 20, 0.006),
            size("medium", 2, 4.0, 40, 0.012),
            size("large", 4, 16.0, 160, 0.048),
        ],
        regions: vec!["r1".to_string(), "r2".to_string()],
    }
}

#[async_trait]
impl ComputeProvider for SimulatedProvider {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn create_instance(&self, req: &CreateRequest) -> Result<ProviderInstance> {
        self.pause().await;
        self.catalog.validate(&req.size, &req.region)?;

        let mut state = self.state.lock();
        state.enter("create")?;

        if !state.keys.iter().any(|(id, _)| *id == req.ssh_key_id) {
            return Err(Error::provider(
                ProviderErrorKind::InvalidSpec,
                format!("unknown ssh key {}", req.ssh_key_id),
            ));
        }
        if state.servers.values().any(|s| s.instance.name == req.name) {
            return Err(Error::Conflict(format!("server name {} is taken", req.name)));
        }

        state.next_id += 1;
        let n = state.next_id;
        let instance = ProviderInstance {
            provider_id: format!("sim-{}", n),
            name: req.name.clone(),
            status: ProviderStatus::Initializing,
            ipv4: Some(format!("198.51.100.{}", n % 250 + 1)),
            size: req.size.clone(),
            region: req.region.clone(),
        };
        let server = SimServer {
            instance: instance.clone(),
            ready_at: self.readiness_delay.map(|d| Instant::now() + d),
            powered_off: false,
        };
        let view = Self::view(&server);
        state.servers.insert(instance.provider_id.clone(), server);

        info!("Simulated server {} created ({})", req.name, instance.provider_id);
        Ok(view)
    }

    async fn get_instance(&self, provider_id: &str) -> Result<ProviderInstance> {
        self.pause().await;
        let mut state = self.state.lock();
        state.enter("get")?;
        state
            .servers
            .get(provider_id)
            .map(Self::view)
            .ok_or_else(|| Error::not_found("server", provider_id))
    }

    async fn delete_instance(&self, provider_id: &str) -> Result<DeleteOutcome> {
        self.pause().await;
        let mut state = self.state.lock();
        state.enter("delete")?;
        match state.servers.remove(provider_id) {
            Some(_) => {
                info!("Simulated server {} deleted", provider_id);
                Ok(DeleteOutcome::Deleted)
            }
            None => {
                debug!("Simulated server {} already gone", provider_id);
                Ok(DeleteOutcome::AlreadyGone)
            }
        }
    }

    async fn power_action(&self, provider_id: &str, action: PowerAction) -> Result<()> {
        self.pause().await;
        let mut state = self.state.lock();
        state.enter("power")?;
        let server = state
            .servers
            .get_mut(provider_id)
            .ok_or_else(|| Error::not_found("server", provider_id))?;
        server.powered_off = matches!(action, PowerAction::Off);
        debug!("Simulated server {} power {}", provider_id, action);
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<ProviderInstance>> {
        self.pause().await;
        let mut state = self.state.lock();
        state.enter("list")?;
        let mut out: Vec<_> = state.servers.values().map(Self::view).collect();
        out.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        Ok(out)
    }

    async fn ensure_ssh_key(&self, name: &str, public_key: &str) -> Result<String> {
        self.pause().await;
        let mut state = self.state.lock();
        state.enter("ensure_ssh_key")?;

        let existing = state
            .keys
            .iter()
            .find(|(_, k)| same_public_key(k, public_key) || k.trim() == public_key.trim());
        if let Some((id, _)) = existing {
            return Ok(id.clone());
        }

        let id = format!("key-{}", state.keys.len() + 1);
        state.keys.push((id.clone(), public_key.to_string()));
        debug!("Simulated SSH key {} registered as {}", name, id);
        Ok(id)
    }

    async fn catalog(&self) -> Result<Catalog> {
        self.pause().await;
        self.state.lock().enter("catalog")?;
        Ok(self.catalog.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQC7 nimbus";

    fn request(sim_key: &str) -> CreateRequest {
        CreateRequest {
            name: "test1".into(),
            size: "small".into(),
            region: "r1".into(),
            image: String::new(),
            ssh_key_id: sim_key.into(),
            labels: HashMap::new(),
            user_data: None,
        }
    }

    #[tokio::test]
    async fn test_ensure_ssh_key_is_content_addressed() {
        let key = nimbus_common::SshKeyMaterial::generate(2048, "nimbus").unwrap();
        let body = key.public_key.split_whitespace().nth(1).unwrap();
        let sim = SimulatedProvider::new();
        let a = sim.ensure_ssh_key("nimbus", &key.public_key).await.unwrap();
        // Same key, different comment and name
        let b = sim
            .ensure_ssh_key("other", &format!("ssh-rsa {} laptop", body))
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(sim.ssh_key_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_becomes_ready() {
        let sim = SimulatedProvider::new().with_readiness_delay(Duration::from_secs(10));
        let key = sim.ensure_ssh_key("nimbus", KEY).await.unwrap();
        let created = sim.create_instance(&request(&key)).await.unwrap();
        assert!(!created.is_network_ready());
        assert!(created.ipv4.is_none());

        tokio::time::advance(Duration::from_secs(11)).await;
        let now = sim.get_instance(&created.provider_id).await.unwrap();
        assert!(now.is_network_ready());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let sim = SimulatedProvider::new();
        let key = sim.ensure_ssh_key("nimbus", KEY).await.unwrap();
        let created = sim.create_instance(&request(&key)).await.unwrap();

        assert_eq!(
            sim.delete_instance(&created.provider_id).await.unwrap(),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            sim.delete_instance(&created.provider_id).await.unwrap(),
            DeleteOutcome::AlreadyGone
        );
        assert!(sim.get_instance(&created.provider_id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_create_validates_spec() {
        let sim = SimulatedProvider::new();
        let key = sim.ensure_ssh_key("nimbus", KEY).await.unwrap();
        let mut req = request(&key);
        req.size = "gigantic".into();
        let err = sim.create_instance(&req).await.unwrap_err();
        assert_eq!(err.kind(), nimbus_common::ErrorKind::InvalidSpec);
        assert_eq!(sim.server_count(), 0);

        let err = sim.create_instance(&request("key-404")).await.unwrap_err();
        assert_eq!(err.kind(), nimbus_common::ErrorKind::InvalidSpec);
    }

    #[tokio::test]
    async fn test_fault_injection_is_consumed() {
        let sim = SimulatedProvider::new();
        sim.inject_fault("list", Fault::Transient, 1);
        assert!(sim.list_instances().await.unwrap_err().is_retryable());
        assert!(sim.list_instances().await.is_ok());
        assert_eq!(sim.calls("list"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_power_off_and_on() {
        let sim = SimulatedProvider::new().with_readiness_delay(Duration::ZERO);
        let key = sim.ensure_ssh_key("nimbus", KEY).await.unwrap();
        let created = sim.create_instance(&request(&key)).await.unwrap();

        sim.power_action(&created.provider_id, PowerAction::Off).await.unwrap();
        assert_eq!(
            sim.get_instance(&created.provider_id).await.unwrap().status,
            ProviderStatus::Off
        );
        sim.power_action(&created.provider_id, PowerAction::On).await.unwrap();
        assert_eq!(
            sim.get_instance(&created.provider_id).await.unwrap().status,
            ProviderStatus::Running
        );
    }
}
