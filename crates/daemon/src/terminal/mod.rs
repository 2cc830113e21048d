//! Terminal sessions
//!
//! A session binds one user to one instance. It is created over plain HTTP,
//! then a single WebSocket addressed by the session id carries the shell
//! (see [`bridge`]). Sessions die on disconnect, explicit close, shutdown or
//! after sitting idle past the configured window.

pub mod bridge;

use crate::config::TerminalConfig;
use crate::lifecycle::VpsManager;
use crate::ssh::PtyHandle;
use crate::state::StateManager;
use dashmap::DashMap;
use nimbus_common::crypto::random_id_256;
use nimbus_common::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Persisted bookkeeping for a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub user: String,
    pub instance_id: String,
    pub created_at: i64,
    pub last_activity: i64,
}

/// A live session
#[derive(Debug)]
pub struct TerminalSession {
    record: Mutex<SessionRecord>,
    last_seen: Mutex<Instant>,
    attached: AtomicBool,
    cancel: CancellationToken,
}

impl TerminalSession {
    fn new(record: SessionRecord) -> Self {
        Self {
            record: Mutex::new(record),
            last_seen: Mutex::new(Instant::now()),
            attached: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> String {
        self.record.lock().id.clone()
    }

    pub fn user(&self) -> String {
        self.record.lock().user.clone()
    }

    pub fn instance_id(&self) -> String {
        self.record.lock().instance_id.clone()
    }

    pub fn record(&self) -> SessionRecord {
        self.record.lock().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Note activity in either direction
    pub fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
        self.record.lock().last_activity = chrono::Utc::now().timestamp();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Fires when the session is closed from anywhere
    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Session registry
pub struct TerminalManager {
    vps: Arc<VpsManager>,
    state: StateManager,
    config: TerminalConfig,
    sessions: DashMap<String, Arc<TerminalSession>>,
}

impl TerminalManager {
    pub fn new(vps: Arc<VpsManager>, state: StateManager, config: TerminalConfig) -> Self {
        Self {
            vps,
            state,
            config,
            sessions: DashMap::new(),
        }
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.config
    }

    /// Drop records left by a previous process; their channels are gone.
    pub fn purge_stale(&self) -> Result<usize> {
        let mut purged = 0;
        for record in self.state.list_sessions()? {
            if !self.sessions.contains_key(&record.id) {
                self.state.remove_session(&record.id)?;
                purged += 1;
            }
        }
        if purged > 0 {
            info!("Purged {} stale terminal session records", purged);
        }
        Ok(purged)
    }

    /// Create a session for `user` on an instance that is reachable over SSH
    pub fn open_session(&self, instance_id: &str, user: &str) -> Result<SessionRecord> {
        if user.is_empty() {
            return Err(Error::Validation("session user is empty".to_string()));
        }
        let instance = self.vps.get_vps(instance_id)?;
        if !instance.state.is_ssh_reachable() {
            return Err(Error::Conflict(format!(
                "instance {} is {}, not reachable over SSH",
                instance.name, instance.state
            )));
        }

        let now = chrono::Utc::now().timestamp();
        let record = SessionRecord {
            id: random_id_256(),
            user: user.to_string(),
            instance_id: instance_id.to_string(),
            created_at: now,
            last_activity: now,
        };
        self.state.record_session(&record)?;
        self.sessions
            .insert(record.id.clone(), Arc::new(TerminalSession::new(record.clone())));
        info!(session_id = %short(&record.id), instance_id = %instance_id, user = %user, "Terminal session opened");
        Ok(record)
    }

    /// The session, if `user` owns it
    pub fn authorize(&self, session_id: &str, user: &str) -> Result<Arc<TerminalSession>> {
        let session = self
            .sessions
            .get(session_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| Error::not_found("terminal session", short(session_id)))?;
        if session.user() != user {
            warn!(session_id = %short(session_id), user = %user, "Terminal session owner mismatch");
            return Err(Error::Authentication {
                message: "terminal session belongs to another user".to_string(),
                detail: None,
            });
        }
        Ok(session)
    }

    /// Attach the PTY for `session`. A session carries at most one channel.
    pub async fn attach(&self, session: &TerminalSession) -> Result<PtyHandle> {
        if session.attached.swap(true, Ordering::SeqCst) {
            return Err(Error::Conflict("terminal session is already attached".to_string()));
        }
        let attached = async {
            let conn = self.vps.connection_for(&session.instance_id()).await?;
            conn.open_pty(self.config.default_cols, self.config.default_rows)
                .await
        }
        .await;
        match attached {
            Ok(pty) => {
                session.touch();
                debug!(session_id = %short(&session.id()), "PTY attached");
                Ok(pty)
            }
            Err(e) => {
                session.attached.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    pub fn close_session(&self, session_id: &str) -> Result<bool> {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return Ok(false);
        };
        session.cancel.cancel();
        self.state.remove_session(session_id)?;
        info!(session_id = %short(session_id), "Terminal session closed");
        Ok(true)
    }

    /// Close on behalf of `user`; only the owner may
    pub fn close_owned(&self, session_id: &str, user: &str) -> Result<()> {
        self.authorize(session_id, user)?;
        self.close_session(session_id)?;
        Ok(())
    }

    /// Close every session idle longer than the configured window
    pub fn sweep_idle(&self) -> usize {
        let limit = Duration::from_secs(self.config.idle_timeout_secs);
        let idle: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.value().idle_for() >= limit)
            .map(|s| s.key().clone())
            .collect();

        let mut closed = 0;
        for id in idle {
            match self.close_session(&id) {
                Ok(true) => {
                    info!(session_id = %short(&id), "Idle terminal session expired");
                    closed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(session_id = %short(&id), "Failed to expire session: {}", e),
            }
        }
        closed
    }

    /// Periodic idle sweep until `shutdown` fires
    pub async fn run_sweeper(&self, shutdown: CancellationToken) {
        let interval = Duration::from_secs(self.config.sweep_interval_secs);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    self.sweep_idle();
                }
            }
        }
        debug!("Terminal sweeper stopped");
    }

    pub fn shutdown_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for id in &ids {
            if let Err(e) = self.close_session(id) {
                warn!(session_id = %short(id), "Failed to close session: {}", e);
            }
        }
        info!("Closed {} terminal sessions", ids.len());
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn list_for(&self, user: &str) -> Vec<SessionRecord> {
        self.sessions
            .iter()
            .map(|s| s.value().record())
            .filter(|r| r.user == user)
            .collect()
    }
}

/// Session ids are bearer-like; log a prefix only
pub(crate) fn short(id: &str) -> &str {
    &id[..id.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id() {
        assert_eq!(short("0123456789abcdef"), "01234567");
        assert_eq!(short("abc"), "abc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_resets_idle_clock() {
        let session = TerminalSession::new(SessionRecord {
            id: "s".into(),
            user: "alice".into(),
            instance_id: "i".into(),
            created_at: 0,
            last_activity: 0,
        });
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(session.idle_for() >= Duration::from_secs(120));
        session.touch();
        assert!(session.idle_for() < Duration::from_secs(1));
        assert!(session.record().last_activity > 0);
    }
}
