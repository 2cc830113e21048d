//! SSH execution service
//!
//! Keeps at most one live connection per `(host, port, user)`, recreates it
//! lazily after a failure or explicit invalidation, and queues concurrent
//! commands on the same connection so their output never interleaves.

pub mod ops;
pub mod transport;
pub mod simulated;

use crate::config::SshConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use nimbus_common::retry;
use nimbus_common::{Error, KeyedLocks, Result, SshKeyMaterial};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Connection identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Result of one remote command. A non-zero exit is data, not an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// -1 when the remote side never reported a status
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into an error for callers that require success.
    pub fn check(self, what: &str) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            self.stderr.trim().to_string()
        };
        Err(Error::Ssh {
            message: format!("{} exited with status {}", what, self.exit_code),
            detail: Some(detail),
            transient: false,
        })
    }
}

/// Input to an interactive PTY
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyInput {
    Data(Vec<u8>),
    Resize { cols: u32, rows: u32 },
}

/// An attached pseudo-terminal.
///
/// Dropping `input` closes the remote channel; `output` ends when the remote
/// shell exits.
#[derive(Debug)]
pub struct PtyHandle {
    pub input: mpsc::Sender<PtyInput>,
    pub output: mpsc::Receiver<Vec<u8>>,
}

/// One authenticated SSH session
#[async_trait]
pub trait SshSession: Send + Sync {
    async fn exec(&self, command: &str) -> Result<ExecOutput>;

    async fn open_pty(&self, term: &str, cols: u32, rows: u32) -> Result<PtyHandle>;

    fn is_alive(&self) -> bool;

    async fn close(&self);
}

/// Establishes sessions
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(&self, target: &Target, key: &SshKeyMaterial) -> Result<Arc<dyn SshSession>>;
}

/// Runs commands on one host
#[async_trait]
pub trait CommandRunner: Send + Sync {
    fn host(&self) -> &str;

    async fn run(&self, command: &str, timeout: Duration) -> Result<ExecOutput>;
}

/// A cached, shareable connection
pub struct CachedConnection {
    target: Target,
    session: Arc<dyn SshSession>,
    exec_gate: Mutex<()>,
    established_at: i64,
}

impl CachedConnection {
    fn new(target: Target, session: Arc<dyn SshSession>) -> Self {
        Self {
            target,
            session,
            exec_gate: Mutex::new(()),
            established_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn established_at(&self) -> i64 {
        self.established_at
    }

    pub fn is_healthy(&self) -> bool {
        self.session.is_alive()
    }

    /// Run `command`, waiting for any command already running on this connection.
    pub async fn execute(&self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        let _turn = self.exec_gate.lock().await;
        debug!("ssh {}: {}", self.target, first_line(command));

        match tokio::time::timeout(timeout, self.session.exec(command)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(
                format!("command on {}", self.target.host),
                timeout,
            )),
        }
    }

    /// Attach a PTY running the login shell.
    pub async fn open_pty(&self, cols: u32, rows: u32) -> Result<PtyHandle> {
        self.session.open_pty("xterm-256color", cols, rows).await
    }
}

fn first_line(command: &str) -> &str {
    command.lines().next().unwrap_or_default()
}

#[async_trait]
impl CommandRunner for CachedConnection {
    fn host(&self) -> &str {
        &self.target.host
    }

    async fn run(&self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        self.execute(command, timeout).await
    }
}

/// Commands for one host routed through [`SshService::execute`]: a broken
/// transport is evicted and the command retried on a fresh connection.
pub struct Remote {
    service: Arc<SshService>,
    host: String,
    key: SshKeyMaterial,
}

impl Remote {
    pub fn new(service: Arc<SshService>, host: &str, key: SshKeyMaterial) -> Self {
        Self {
            service,
            host: host.to_string(),
            key,
        }
    }
}

#[async_trait]
impl CommandRunner for Remote {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &str, timeout: Duration) -> Result<ExecOutput> {
        self.service
            .execute(&self.host, &self.key, command, timeout)
            .await
    }
}

/// Connection cache plus retrying execution
pub struct SshService {
    connector: Arc<dyn SshConnector>,
    config: SshConfig,
    cache: DashMap<Target, Arc<CachedConnection>>,
    connect_gates: KeyedLocks,
}

impl SshService {
    pub fn new(connector: Arc<dyn SshConnector>, config: SshConfig) -> Self {
        Self {
            connector,
            config,
            cache: DashMap::new(),
            connect_gates: KeyedLocks::new(),
        }
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Target for `host` using the configured user and port
    pub fn target(&self, host: &str) -> Target {
        Target {
            host: host.to_string(),
            port: self.config.port,
            user: self.config.user.clone(),
        }
    }

    fn cached(&self, target: &Target) -> Option<Arc<CachedConnection>> {
        self.cache.get(target).map(|entry| entry.value().clone())
    }

    /// Return the cached connection for `host`/`user` if healthy, otherwise
    /// establish and cache a new one.
    pub async fn get_connection(
        &self,
        host: &str,
        user: &str,
        key: &SshKeyMaterial,
    ) -> Result<Arc<CachedConnection>> {
        let target = Target {
            host: host.to_string(),
            port: self.config.port,
            user: user.to_string(),
        };

        if let Some(conn) = self.cached(&target) {
            if conn.is_healthy() {
                return Ok(conn);
            }
        }

        let _gate = self.connect_gates.lock(&target.to_string()).await;

        // Someone else may have reconnected while we waited
        if let Some(conn) = self.cached(&target) {
            if conn.is_healthy() {
                return Ok(conn);
            }
            debug!("Dropping unhealthy connection to {}", target);
            self.cache.remove(&target);
            conn.session.close().await;
        }

        let connect_timeout = Duration::from_secs(self.config.connect_timeout_secs);
        let connector = &self.connector;
        let target_ref = &target;
        let session = retry::retry(&self.config.connect_backoff(), "ssh connect", || async move {
            match tokio::time::timeout(connect_timeout, connector.connect(target_ref, key)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Ssh {
                    message: format!("connection to {} timed out", target_ref),
                    detail: None,
                    transient: true,
                }),
            }
        })
        .await?;

        info!("SSH connection established to {}", target);
        let conn = Arc::new(CachedConnection::new(target.clone(), session));
        self.cache.insert(target, conn.clone());
        Ok(conn)
    }

    /// Connection for `host` as the configured user
    pub async fn connect(&self, host: &str, key: &SshKeyMaterial) -> Result<Arc<CachedConnection>> {
        self.get_connection(host, &self.config.user, key).await
    }

    /// Execute on `host`, reconnecting and retrying after transport failures.
    pub async fn execute(
        &self,
        host: &str,
        key: &SshKeyMaterial,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        retry::retry(&self.config.connect_backoff(), "ssh execute", || async move {
            let conn = self.connect(host, key).await?;
            match conn.execute(command, timeout).await {
                Err(e) if e.is_retryable() => {
                    warn!("SSH transport failure on {}: {}", conn.target(), e);
                    self.evict(conn.target()).await;
                    Err(e)
                }
                other => other,
            }
        })
        .await
    }

    async fn evict(&self, target: &Target) {
        if let Some((_, conn)) = self.cache.remove(target) {
            conn.session.close().await;
        }
    }

    /// Tear down every cached connection to `host`.
    pub async fn invalidate(&self, host: &str) {
        let targets: Vec<Target> = self
            .cache
            .iter()
            .filter(|e| e.key().host == host)
            .map(|e| e.key().clone())
            .collect();
        for target in targets {
            debug!("Invalidating SSH connection {}", target);
            self.evict(&target).await;
        }
    }

    /// Close everything (shutdown).
    pub async fn close_all(&self) {
        let targets: Vec<Target> = self.cache.iter().map(|e| e.key().clone()).collect();
        for target in targets {
            self.evict(&target).await;
        }
        info!("Closed all SSH connections");
    }

    pub fn cached_count(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::simulated::{test_key as key, SimulatedConnector};
    use super::*;

    fn ok(stdout: &str) -> ExecOutput {
        ExecOutput {
            stdout: stdout.to_string(),
            ..Default::default()
        }
    }

    fn service(connector: Arc<SimulatedConnector>) -> SshService {
        let config = SshConfig {
            connect_attempts: 3,
            ..Default::default()
        };
        SshService::new(connector, config)
    }

    #[tokio::test]
    async fn test_connection_is_cached_per_target() {
        let connector = Arc::new(SimulatedConnector::with_responder(|_| ok("")));
        let svc = service(connector.clone());
        let key = key();

        let a = svc.get_connection("203.0.113.7", "root", &key).await.unwrap();
        let b = svc.get_connection("203.0.113.7", "root", &key).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        svc.get_connection("203.0.113.7", "deploy", &key).await.unwrap();
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(svc.cached_count(), 2);
    }

    #[tokio::test]
    async fn test_unhealthy_connection_is_replaced() {
        let connector = Arc::new(SimulatedConnector::with_responder(|_| ok("")));
        let svc = service(connector.clone());
        let key = key();

        let a = svc.connect("203.0.113.7", &key).await.unwrap();
        a.session.close().await;
        let b = svc.connect("203.0.113.7", &key).await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_connect_failures_are_retried() {
        let connector = Arc::new(SimulatedConnector::with_responder(|_| ok("")));
        connector.fail_connects(2);
        let svc = service(connector.clone());

        svc.connect("203.0.113.7", &key()).await.unwrap();
        assert_eq!(connector.connect_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_is_not_retried() {
        let connector = Arc::new(SimulatedConnector::with_responder(|_| ok("")));
        connector.reject_auth(true);
        let svc = service(connector.clone());

        let err = svc.connect("203.0.113.7", &key()).await.err().unwrap();
        assert!(matches!(err, Error::Authentication { .. }));
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_not_an_error() {
        let connector = Arc::new(SimulatedConnector::with_responder(|_| ExecOutput {
            stdout: String::new(),
            stderr: "no such file".into(),
            exit_code: 2,
        }));
        let svc = service(connector);

        let out = svc
            .execute("203.0.113.7", &key(), "cat /nope", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 2);
        let err = out.check("cat").unwrap_err();
        assert_eq!(err.detail(), Some("no such file"));
    }

    #[tokio::test]
    async fn test_commands_on_one_connection_are_queued() {
        let connector =
            Arc::new(SimulatedConnector::with_responder(|_| ok("")).with_delay(Duration::from_millis(20)));
        let svc = Arc::new(service(connector.clone()));
        let key = key();
        let conn = svc.connect("203.0.113.7", &key).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..4 {
            let conn = conn.clone();
            tasks.push(tokio::spawn(async move {
                conn.execute(&format!("echo {}", i), Duration::from_secs(5)).await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        assert_eq!(connector.max_parallel(), 1);
        assert_eq!(connector.commands().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_timeout() {
        let connector =
            Arc::new(SimulatedConnector::with_responder(|_| ok("")).with_delay(Duration::from_secs(60)));
        let svc = service(connector);
        let conn = svc.connect("203.0.113.7", &key()).await.unwrap();
        let err = conn
            .execute("sleep 60", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_invalidate_closes_host_connections() {
        let connector = Arc::new(SimulatedConnector::with_responder(|_| ok("")));
        let svc = service(connector.clone());
        let key = key();
        let conn = svc.connect("203.0.113.7", &key).await.unwrap();
        svc.connect("203.0.113.8", &key).await.unwrap();

        svc.invalidate("203.0.113.7").await;
        assert!(!conn.is_healthy());
        assert_eq!(svc.cached_count(), 1);

        svc.close_all().await;
        assert_eq!(svc.cached_count(), 0);
    }
}
