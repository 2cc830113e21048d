#![allow(dead_code)]

use nimbus_common::{InstanceSpec, SshKeyMaterial};
use nimbus_daemon::certs::edge::SimulatedEdge;
use nimbus_daemon::config::DaemonConfig;
use nimbus_daemon::ssh::simulated::{test_key, SimulatedConnector};
use nimbus_daemon::state::{StateManager, DEFAULT_SSH_KEY};
use nimbus_daemon::{Backends, Daemon};
use nimbus_provider::{ProviderRegistry, SimulatedProvider};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub const JWT_SECRET: &str = "test-jwt-secret";

/// A daemon wired to in-process backends, with handles to poke them
pub struct Harness {
    pub daemon: Arc<Daemon>,
    pub provider: Arc<SimulatedProvider>,
    pub ssh: SimulatedConnector,
    pub edge: Arc<SimulatedEdge>,
}

pub fn config() -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.provisioning.initial_backoff_secs = 1;
    config.provisioning.max_backoff_secs = 10;
    config
}

pub fn harness() -> Harness {
    build(
        SimulatedProvider::new().with_readiness_delay(Duration::ZERO),
        SimulatedConnector::new(),
        config(),
    )
}

pub fn build(provider: SimulatedProvider, ssh: SimulatedConnector, config: DaemonConfig) -> Harness {
    let provider = Arc::new(provider);
    let edge = Arc::new(SimulatedEdge::new().with_zone("example.com"));

    let mut providers = ProviderRegistry::new();
    providers.register(provider.clone());

    let state = StateManager::in_memory("test-sealing-key").unwrap();
    // Key generation is slow; every test shares one placeholder key
    state.store_ssh_key(DEFAULT_SSH_KEY, &shared_key()).unwrap();

    let backends = Backends {
        providers,
        connector: Arc::new(ssh.clone()),
        edge: Some(edge.clone()),
    };
    let daemon = Arc::new(Daemon::new(config, state, backends, JWT_SECRET).unwrap());

    Harness {
        daemon,
        provider,
        ssh,
        edge,
    }
}

pub fn shared_key() -> SshKeyMaterial {
    test_key()
}

pub fn spec(name: &str) -> InstanceSpec {
    InstanceSpec {
        name: name.to_string(),
        size: "small".to_string(),
        region: "r1".to_string(),
        provider: None,
        image: None,
        domain: None,
        labels: HashMap::new(),
    }
}

impl Harness {
    /// Create an instance and wait for the workflow to finish
    pub async fn running(&self, name: &str) -> nimbus_common::InstanceRecord {
        let handle = self.daemon.vps().create_vps(spec(name)).await.unwrap();
        handle.wait().await.unwrap()
    }
}
