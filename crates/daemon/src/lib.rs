//! Nimbus daemon
//!
//! Owns every long-lived component of the control plane and wires them
//! together. Nothing here is global: a [`Daemon`] is constructed once, handed
//! to the HTTP surface, and shut down explicitly.

pub mod auth;
pub mod certs;
pub mod config;
pub mod lifecycle;
pub mod reconciler;
pub mod server;
pub mod ssh;
pub mod state;
pub mod terminal;

use crate::auth::JwtAuth;
use crate::certs::cloudflare::CloudflareEdge;
use crate::certs::edge::{EdgeApi, SimulatedEdge};
use crate::certs::CertificateManager;
use crate::config::{DaemonConfig, Secrets};
use crate::lifecycle::VpsManager;
use crate::reconciler::Reconciler;
use crate::ssh::simulated::SimulatedConnector;
use crate::ssh::transport::RusshConnector;
use crate::ssh::{SshConnector, SshService};
use crate::state::StateManager;
use crate::terminal::TerminalManager;
use nimbus_common::{Backoff, Result};
use nimbus_provider::{HetznerProvider, ProviderRegistry, Retrying, SimulatedProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// External collaborators the daemon talks to
pub struct Backends {
    pub providers: ProviderRegistry,
    pub connector: Arc<dyn SshConnector>,
    /// `None` disables domain configuration
    pub edge: Option<Arc<dyn EdgeApi>>,
}

impl Backends {
    /// Pick backends from configuration and environment secrets.
    ///
    /// When every enabled provider is simulated, SSH and the edge API are
    /// simulated as well, since simulated instances have no real address.
    pub fn from_config(config: &DaemonConfig, secrets: &Secrets) -> anyhow::Result<Self> {
        let policy = Backoff::attempts(4).with_initial(Duration::from_secs(1));
        let mut providers = ProviderRegistry::new();

        for name in &config.providers.enabled {
            match name.as_str() {
                "simulated" => {
                    providers.register(Arc::new(Retrying::new(SimulatedProvider::new(), policy.clone())))
                }
                "hetzner" => {
                    let token = secrets.hcloud_token.as_deref().ok_or_else(|| {
                        anyhow::anyhow!("HCLOUD_TOKEN must be set to enable the hetzner provider")
                    })?;
                    let hetzner = match &config.providers.hetzner_endpoint {
                        Some(endpoint) => HetznerProvider::with_endpoint(endpoint, token)?,
                        None => HetznerProvider::new(token)?,
                    }
                    .with_default_image(config.provisioning.default_image.clone());
                    providers.register(Arc::new(Retrying::new(hetzner, policy.clone())));
                }
                other => anyhow::bail!("unknown provider '{}'", other),
            }
        }
        providers.set_default(&config.providers.default)?;

        let simulated_only = config.providers.enabled.iter().all(|p| p == "simulated");

        let connector: Arc<dyn SshConnector> = if simulated_only {
            info!("Using simulated SSH transport");
            Arc::new(SimulatedConnector::new())
        } else {
            Arc::new(RusshConnector::new(Duration::from_secs(
                config.terminal.idle_timeout_secs,
            )))
        };

        let edge: Option<Arc<dyn EdgeApi>> = match &secrets.cloudflare_token {
            Some(token) => Some(Arc::new(CloudflareEdge::with_endpoint(
                &config.certs.edge_endpoint,
                token,
            )?)),
            None if simulated_only => Some(Arc::new(SimulatedEdge::accepting_any_zone())),
            None => {
                warn!("CLOUDFLARE_API_TOKEN not set; domain configuration disabled");
                None
            }
        };

        Ok(Self {
            providers,
            connector,
            edge,
        })
    }
}

/// The assembled control plane
pub struct Daemon {
    config: DaemonConfig,
    state: StateManager,
    ssh: Arc<SshService>,
    certs: Option<Arc<CertificateManager>>,
    vps: Arc<VpsManager>,
    terminals: Arc<TerminalManager>,
    reconciler: Arc<Reconciler>,
    auth: Arc<JwtAuth>,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn new(
        config: DaemonConfig,
        state: StateManager,
        backends: Backends,
        jwt_secret: &str,
    ) -> Result<Self> {
        let ssh = Arc::new(SshService::new(backends.connector, config.ssh.clone()));
        let certs = backends.edge.map(|edge| {
            Arc::new(CertificateManager::new(
                edge,
                state.clone(),
                ssh.clone(),
                config.certs.clone(),
            ))
        });
        let vps = Arc::new(VpsManager::new(
            state.clone(),
            backends.providers.clone(),
            ssh.clone(),
            certs.clone(),
            config.provisioning.clone(),
            config.bootstrap.clone(),
        ));
        let terminals = Arc::new(TerminalManager::new(
            vps.clone(),
            state.clone(),
            config.terminal.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            state.clone(),
            backends.providers,
            vps.clone(),
            certs.clone(),
            Duration::from_secs(config.reconcile_interval_secs),
        ));

        Ok(Self {
            auth: Arc::new(JwtAuth::new(jwt_secret)?),
            config,
            state,
            ssh,
            certs,
            vps,
            terminals,
            reconciler,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn ssh(&self) -> &Arc<SshService> {
        &self.ssh
    }

    pub fn certs(&self) -> Option<&Arc<CertificateManager>> {
        self.certs.as_ref()
    }

    pub fn vps(&self) -> &Arc<VpsManager> {
        &self.vps
    }

    pub fn terminals(&self) -> &Arc<TerminalManager> {
        &self.terminals
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn auth(&self) -> &Arc<JwtAuth> {
        &self.auth
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the idle sweeper and the reconciler
    pub fn start_background(&self) -> Result<Vec<JoinHandle<()>>> {
        self.terminals.purge_stale()?;

        let terminals = self.terminals.clone();
        let token = self.shutdown.clone();
        let sweeper = tokio::spawn(async move { terminals.run_sweeper(token).await });

        let reconciler = self.reconciler.clone();
        let token = self.shutdown.clone();
        let reconcile = tokio::spawn(async move { reconciler.run(token).await });

        Ok(vec![sweeper, reconcile])
    }

    /// Stop background work, close terminals and drop cached SSH connections
    pub async fn shutdown(&self) {
        info!("Shutting down");
        self.shutdown.cancel();
        self.terminals.shutdown_all();
        self.ssh.close_all().await;
    }
}
