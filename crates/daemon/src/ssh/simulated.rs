//! In-process SSH backend
//!
//! Pairs with the simulated compute provider: commands are answered by a
//! responder function and PTYs echo their input. Fault knobs let callers
//! exercise reconnects, authentication failures and unreachable hosts.

use super::{ExecOutput, PtyHandle, PtyInput, SshConnector, SshSession, Target};
use async_trait::async_trait;
use nimbus_common::{Error, Result, SshKeyMaterial};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

type Responder = dyn Fn(&str) -> ExecOutput + Send + Sync;

/// Shared counters and knobs, visible through the connector
#[derive(Default)]
struct Shared {
    connects: AtomicUsize,
    fail_connects: AtomicUsize,
    drop_execs: AtomicUsize,
    reject_auth: AtomicBool,
    unreachable: AtomicBool,
    running: AtomicUsize,
    max_parallel: AtomicUsize,
    open_ptys: AtomicUsize,
    commands: Mutex<Vec<(String, String)>>,
    pty_sizes: Mutex<Vec<(u32, u32)>>,
}

/// Simulated connector
#[derive(Clone)]
pub struct SimulatedConnector {
    shared: Arc<Shared>,
    respond: Arc<Responder>,
    delay: Duration,
}

impl Default for SimulatedConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedConnector {
    /// Connector answering like a freshly bootstrapped single-node cluster
    pub fn new() -> Self {
        Self::with_responder(default_response)
    }

    pub fn with_responder(respond: impl Fn(&str) -> ExecOutput + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            respond: Arc::new(respond),
            delay: Duration::ZERO,
        }
    }

    /// Every command takes `delay` to complete
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `n` connects with a transient error
    pub fn fail_connects(&self, n: usize) {
        self.shared.fail_connects.store(n, Ordering::SeqCst);
    }

    /// Kill the session under the next `n` commands
    pub fn drop_next_execs(&self, n: usize) {
        self.shared.drop_execs.store(n, Ordering::SeqCst);
    }

    pub fn reject_auth(&self, reject: bool) {
        self.shared.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// While set, every connect fails transiently
    pub fn set_unreachable(&self, unreachable: bool) {
        self.shared.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Highest number of commands seen running at once on one session
    pub fn max_parallel(&self) -> usize {
        self.shared.max_parallel.load(Ordering::SeqCst)
    }

    /// `(host, command)` pairs in execution order
    pub fn commands(&self) -> Vec<(String, String)> {
        self.shared.commands.lock().clone()
    }

    pub fn commands_for(&self, host: &str) -> Vec<String> {
        self.shared
            .commands
            .lock()
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn open_ptys(&self) -> usize {
        self.shared.open_ptys.load(Ordering::SeqCst)
    }

    pub fn pty_sizes(&self) -> Vec<(u32, u32)> {
        self.shared.pty_sizes.lock().clone()
    }
}

#[async_trait]
impl SshConnector for SimulatedConnector {
    async fn connect(&self, target: &Target, _key: &SshKeyMaterial) -> Result<Arc<dyn SshSession>> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);

        if self.shared.reject_auth.load(Ordering::SeqCst) {
            return Err(Error::Authentication {
                message: format!("public key rejected for {}", target),
                detail: None,
            });
        }
        let refused = self.shared.unreachable.load(Ordering::SeqCst)
            || self
                .shared
                .fail_connects
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if refused {
            return Err(Error::Ssh {
                message: format!("connection to {} refused", target),
                detail: None,
                transient: true,
            });
        }

        Ok(Arc::new(SimulatedSession {
            host: target.host.clone(),
            alive: AtomicBool::new(true),
            shared: self.shared.clone(),
            respond: self.respond.clone(),
            delay: self.delay,
        }))
    }
}

struct SimulatedSession {
    host: String,
    alive: AtomicBool,
    shared: Arc<Shared>,
    respond: Arc<Responder>,
    delay: Duration,
}

#[async_trait]
impl SshSession for SimulatedSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(Error::Ssh {
                message: "session closed".into(),
                detail: None,
                transient: true,
            });
        }
        let dropped = self
            .shared
            .drop_execs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if dropped {
            self.alive.store(false, Ordering::SeqCst);
            return Err(Error::Ssh {
                message: format!("connection to {} reset", self.host),
                detail: None,
                transient: true,
            });
        }
        let now = self.shared.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_parallel.fetch_max(now, Ordering::SeqCst);
        self.shared
            .commands
            .lock()
            .push((self.host.clone(), command.to_string()));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.shared.running.fetch_sub(1, Ordering::SeqCst);
        Ok((self.respond)(command))
    }

    async fn open_pty(&self, _term: &str, cols: u32, rows: u32) -> Result<PtyHandle> {
        let (input_tx, mut input_rx) = mpsc::channel::<PtyInput>(64);
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(64);
        let shared = self.shared.clone();
        shared.open_ptys.fetch_add(1, Ordering::SeqCst);
        shared.pty_sizes.lock().push((cols, rows));

        tokio::spawn(async move {
            let _ = output_tx.send(b"$ ".to_vec()).await;
            while let Some(input) = input_rx.recv().await {
                match input {
                    PtyInput::Data(bytes) => {
                        let exit = bytes.starts_with(b"exit");
                        if output_tx.send(bytes).await.is_err() || exit {
                            break;
                        }
                    }
                    PtyInput::Resize { cols, rows } => {
                        shared.pty_sizes.lock().push((cols, rows));
                    }
                }
            }
            shared.open_ptys.fetch_sub(1, Ordering::SeqCst);
        });

        Ok(PtyHandle {
            input: input_tx,
            output: output_rx,
        })
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Canned answers for the commands the daemon issues
pub fn default_response(command: &str) -> ExecOutput {
    let stdout = if command.contains("==DISK==") {
        concat!(
            "==DISK==\n",
            "/dev/sda1 40000000000 8000000000 32000000000 20% /\n",
            "==MEM==\n",
            "4000000000 1000000000 2800000000\n",
            "==RUNTIME==\n",
            "active\n",
            "==NODES==\n",
            "node-1 Ready control-plane,master 1m v1.30.4+k3s1\n",
        )
        .to_string()
    } else if command.starts_with("helm status") {
        r#"{"name":"release","info":{"status":"deployed"},"version":1}"#.to_string()
    } else if command.starts_with("kubectl get nodes") {
        "node-1 Ready control-plane,master 1m v1.30.4+k3s1\n".to_string()
    } else {
        String::new()
    };
    ExecOutput {
        stdout,
        stderr: String::new(),
        exit_code: 0,
    }
}

/// Placeholder key material; the simulated backend never reads it
pub fn test_key() -> SshKeyMaterial {
    SshKeyMaterial {
        fingerprint: "0".repeat(64),
        public_key: "ssh-rsa AAAAB3NzaC1yc2E simulated".into(),
        private_key_pem: String::new(),
        created_at: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Target {
        Target {
            host: "198.51.100.1".into(),
            port: 22,
            user: "root".into(),
        }
    }

    #[tokio::test]
    async fn test_pty_echoes_and_releases_on_exit() {
        let connector = SimulatedConnector::new();
        let session = connector.connect(&target(), &test_key()).await.unwrap();
        let mut pty = session.open_pty("xterm", 100, 30).await.unwrap();
        assert_eq!(connector.open_ptys(), 1);

        assert_eq!(pty.output.recv().await.unwrap(), b"$ ".to_vec());
        pty.input.send(PtyInput::Data(b"ls\n".to_vec())).await.unwrap();
        assert_eq!(pty.output.recv().await.unwrap(), b"ls\n".to_vec());

        pty.input
            .send(PtyInput::Resize { cols: 120, rows: 40 })
            .await
            .unwrap();
        pty.input.send(PtyInput::Data(b"exit\n".to_vec())).await.unwrap();
        assert_eq!(pty.output.recv().await.unwrap(), b"exit\n".to_vec());
        assert!(pty.output.recv().await.is_none());
        assert_eq!(connector.open_ptys(), 0);
        assert_eq!(connector.pty_sizes(), vec![(100, 30), (120, 40)]);
    }

    #[tokio::test]
    async fn test_dropping_input_releases_pty() {
        let connector = SimulatedConnector::new();
        let session = connector.connect(&target(), &test_key()).await.unwrap();
        let PtyHandle { input, mut output } = session.open_pty("xterm", 80, 24).await.unwrap();
        drop(input);
        while output.recv().await.is_some() {}
        assert_eq!(connector.open_ptys(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        let connector = SimulatedConnector::new();
        connector.set_unreachable(true);
        let err = connector
            .connect(&target(), &test_key())
            .await
            .err()
            .unwrap();
        assert!(err.is_retryable());
    }
}
