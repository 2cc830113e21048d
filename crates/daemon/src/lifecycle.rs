//! VPS lifecycle manager
//!
//! Drives instances through
//! `Requested -> Provisioning -> NetworkReady -> Bootstrapping -> SshReady
//! [-> DomainConfigured] -> Running`, plus power actions, retry and delete.
//! Every operation on one instance id runs under that id's gate; different
//! instances never wait on each other.

use crate::certs::CertificateManager;
use crate::config::{BootstrapConfig, ProvisioningConfig};
use crate::ssh::{ops, CachedConnection, Remote, SshService};
use crate::state::{StateManager, DEFAULT_SSH_KEY};
use nimbus_common::retry::{self, Poll};
use nimbus_common::{
    Error, InstanceRecord, InstanceSpec, InstanceState, KeyedLocks, OrphanMarker, PowerAction,
    Result, SshKeyMaterial, SshKeyRef,
};
use nimbus_provider::{ComputeProvider, CreateRequest, DeleteOutcome, ProviderRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Handle to a provisioning workflow running in the background.
///
/// Dropping the handle does not stop the workflow.
#[derive(Debug)]
pub struct InstanceHandle {
    pub id: String,
    pub name: String,
    task: JoinHandle<Result<InstanceRecord>>,
}

impl InstanceHandle {
    /// Wait for the workflow to finish
    pub async fn wait(self) -> Result<InstanceRecord> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("provisioning task failed: {}", e)))?
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Name rules shared by every provider we support
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "invalid instance name '{}': use lowercase letters, digits and '-'",
            name
        )))
    }
}

pub struct VpsManager {
    state: StateManager,
    providers: ProviderRegistry,
    ssh: Arc<SshService>,
    certs: Option<Arc<CertificateManager>>,
    provisioning: ProvisioningConfig,
    bootstrap: BootstrapConfig,
    instance_gates: KeyedLocks,
    /// Guards load-or-generate of the shared key pair (local work only)
    key_gate: Mutex<()>,
}

impl VpsManager {
    pub fn new(
        state: StateManager,
        providers: ProviderRegistry,
        ssh: Arc<SshService>,
        certs: Option<Arc<CertificateManager>>,
        provisioning: ProvisioningConfig,
        bootstrap: BootstrapConfig,
    ) -> Self {
        Self {
            state,
            providers,
            ssh,
            certs,
            provisioning,
            bootstrap,
            instance_gates: KeyedLocks::new(),
            key_gate: Mutex::new(()),
        }
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn get_vps(&self, id: &str) -> Result<InstanceRecord> {
        self.state.require_instance(id)
    }

    pub fn list_vps(&self) -> Result<Vec<InstanceRecord>> {
        let mut records = self.state.list_instances()?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(records)
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Validate `spec`, record the instance and start provisioning.
    ///
    /// Returns as soon as the record exists; the workflow keeps running even
    /// if the caller goes away. Poll [`VpsManager::get_vps`] or wait on the
    /// handle for the outcome.
    pub async fn create_vps(self: &Arc<Self>, spec: InstanceSpec) -> Result<InstanceHandle> {
        validate_name(&spec.name)?;
        let provider = self.providers.get(spec.provider.as_deref())?;
        let catalog = provider.catalog().await?;
        let size = catalog.validate(&spec.size, &spec.region)?;

        let mut record = InstanceRecord::new(&spec, provider.name());
        record.cost.hourly_rate = size.hourly_price;
        record.cost.currency = size.currency.clone();
        self.state.insert_instance(&record)?;
        info!(instance_id = %record.id, name = %record.name, provider = %provider.name(), "Instance requested");

        Ok(self.spawn_provisioning(record.id.clone(), record.name.clone()))
    }

    fn spawn_provisioning(self: &Arc<Self>, id: String, name: String) -> InstanceHandle {
        let this = self.clone();
        let task_id = id.clone();
        let task = tokio::spawn(async move {
            let result = this.provision(&task_id).await;
            if let Err(e) = &result {
                error!(instance_id = %task_id, "Provisioning failed: {}", e);
            }
            result
        });
        InstanceHandle { id, name, task }
    }

    async fn provision(&self, id: &str) -> Result<InstanceRecord> {
        let _gate = self.instance_gates.lock(id).await;

        let mut record = self.state.require_instance(id)?;
        if record.state != InstanceState::Requested {
            return Err(Error::Conflict(format!(
                "instance {} is {}, not requested",
                record.name, record.state
            )));
        }
        let provider = self.providers.get(Some(&record.provider))?;
        let image = record
            .image
            .clone()
            .unwrap_or_else(|| self.provisioning.default_image.clone());

        self.advance(&mut record, InstanceState::Provisioning)?;

        // Allocation
        let allocated = async {
            let (key, key_id) = self.ensure_shared_key(provider.as_ref()).await?;
            let req = CreateRequest {
                name: record.name.clone(),
                size: record.size.clone(),
                region: record.region.clone(),
                image,
                ssh_key_id: key_id.clone(),
                labels: record.labels.clone(),
                user_data: None,
            };
            let instance = provider.create_instance(&req).await?;
            Ok::<_, Error>((key, key_id, instance))
        }
        .await;
        let (key, key_id, instance) = match allocated {
            Ok(v) => v,
            Err(e) => return Err(self.fail(&mut record, InstanceState::ProvisionFailed, e)),
        };

        instance.apply_to(&mut record);
        record.ssh_key = Some(SshKeyRef {
            fingerprint: key.fingerprint.clone(),
            provider_key_id: key_id,
        });
        record.cost.accrual_started_at = Some(chrono::Utc::now().timestamp());
        self.state.save_instance(&record)?;
        info!(instance_id = %id, provider_id = %instance.provider_id, "Instance allocated");

        // Readiness
        let provider_id = instance.provider_id.clone();
        let ready = {
            let provider = &provider;
            let pid = provider_id.as_str();
            retry::poll_until(
                &self.provisioning.readiness_backoff(),
                "instance readiness",
                || async move {
                    let current = provider.get_instance(pid).await?;
                    debug!(provider_id = %pid, status = ?current.status, "Readiness probe");
                    Ok(if current.is_network_ready() {
                        Poll::Ready(current)
                    } else {
                        Poll::Pending
                    })
                },
            )
            .await
        };
        let ready = match ready {
            Ok(ready) => ready,
            Err(e) => return Err(self.abort_with_cleanup(&mut record, provider.as_ref(), "readiness", e).await),
        };
        ready.apply_to(&mut record);
        self.advance(&mut record, InstanceState::NetworkReady)?;

        // Bootstrap
        self.advance(&mut record, InstanceState::Bootstrapping)?;
        let ip = record
            .ipv4
            .clone()
            .ok_or_else(|| Error::Internal("network-ready instance without address".into()))?;
        if let Err(e) = self.bootstrap_runtime(&ip, &key).await {
            return Err(match e {
                Error::Timeout { .. } => {
                    self.abort_with_cleanup(&mut record, provider.as_ref(), "bootstrap", e)
                        .await
                }
                other => self.fail(&mut record, InstanceState::ConfigFailed, other),
            });
        }
        self.advance(&mut record, InstanceState::SshReady)?;

        // Domain
        if let Some(domain) = record.domain.clone() {
            let configured = match &self.certs {
                Some(certs) => certs.configure_domain_ssl(&domain, &ip).await.map(|_| ()),
                None => Err(Error::Validation(
                    "domain requested but no edge API is configured".to_string(),
                )),
            };
            if let Err(e) = configured {
                return Err(self.fail(&mut record, InstanceState::ConfigFailed, e));
            }
            self.advance(&mut record, InstanceState::DomainConfigured)?;
        }

        self.advance(&mut record, InstanceState::Running)?;
        info!(instance_id = %id, ip = %ip, "Instance running");
        Ok(record)
    }

    /// Wait for SSH, run the bootstrap script and verify the runtime
    async fn bootstrap_runtime(&self, ip: &str, key: &SshKeyMaterial) -> Result<()> {
        let conn = {
            let ssh = &self.ssh;
            retry::poll_until(
                &self.provisioning.readiness_backoff(),
                "ssh reachability",
                || async move { ssh.connect(ip, key).await.map(Poll::Ready) },
            )
            .await?
        };

        let budget = Duration::from_secs(self.bootstrap.timeout_secs);
        ops::run_script(&*conn, &self.bootstrap.script, budget)
            .await?
            .check("bootstrap script")?;
        conn.execute(&self.bootstrap.verify_command, self.ssh.config().command_timeout())
            .await?
            .check("runtime verification")?;
        info!(host = %ip, "Runtime bootstrapped");
        Ok(())
    }

    /// Apply a forward transition and persist it
    fn advance(&self, record: &mut InstanceRecord, next: InstanceState) -> Result<()> {
        record.transition(next, None)?;
        self.state.save_instance(record)?;
        debug!(instance_id = %record.id, state = %next, "State changed");
        Ok(())
    }

    /// Record a failure state and hand the error back
    fn fail(&self, record: &mut InstanceRecord, state: InstanceState, e: Error) -> Error {
        record.last_error = Some(e.to_string());
        if record.transition(state, Some(e.kind().to_string())).is_err() {
            record.force_state(state, Some(e.kind().to_string()));
        }
        if let Err(save) = self.state.save_instance(record) {
            warn!(instance_id = %record.id, "Failed to persist failure state: {}", save);
        }
        e
    }

    /// Mark the instance timed out and delete the provider resource.
    ///
    /// A failed delete leaves an orphan marker for the reconciler.
    async fn abort_with_cleanup(
        &self,
        record: &mut InstanceRecord,
        provider: &dyn ComputeProvider,
        step: &str,
        e: Error,
    ) -> Error {
        let state = if e.kind() == nimbus_common::ErrorKind::Timeout {
            InstanceState::BootstrapTimeout
        } else {
            InstanceState::ProvisionFailed
        };
        let e = self.fail(record, state, e);

        let compensated = match record.provider_id.clone() {
            None => true,
            Some(pid) => match provider.delete_instance(&pid).await {
                Ok(_) => {
                    info!(instance_id = %record.id, provider_id = %pid, "Compensating delete succeeded");
                    record.provider_id = None;
                    record.ipv4 = None;
                    record.cost.accrual_ended_at = Some(chrono::Utc::now().timestamp());
                    true
                }
                Err(delete_err) => {
                    warn!(instance_id = %record.id, provider_id = %pid, "Compensating delete failed: {}", delete_err);
                    let marker = OrphanMarker {
                        provider: record.provider.clone(),
                        provider_id: pid,
                        instance_name: record.name.clone(),
                        reason: delete_err.to_string(),
                        created_at: chrono::Utc::now().timestamp(),
                        attempts: 1,
                    };
                    if let Err(store_err) = self.state.record_orphan(&marker) {
                        error!("Failed to record orphan marker: {}", store_err);
                    }
                    false
                }
            },
        };
        if let Err(save) = self.state.save_instance(record) {
            warn!(instance_id = %record.id, "Failed to persist record: {}", save);
        }

        Error::Pipeline {
            workflow: format!("create instance {}", record.name),
            step: step.to_string(),
            compensated,
            source: Box::new(e),
        }
    }

    /// Load or create the shared key pair, then make sure the provider knows it
    async fn ensure_shared_key(&self, provider: &dyn ComputeProvider) -> Result<(SshKeyMaterial, String)> {
        let key = {
            let _gate = self.key_gate.lock().await;
            match self.state.load_ssh_key(DEFAULT_SSH_KEY)? {
                Some(key) => key,
                None => {
                    let bits = self.ssh.config().key_bits;
                    info!("Generating shared {}-bit SSH key", bits);
                    let key = tokio::task::spawn_blocking(move || SshKeyMaterial::generate(bits, "nimbus"))
                        .await
                        .map_err(|e| Error::Internal(format!("key generation task failed: {}", e)))??;
                    self.state.store_ssh_key(DEFAULT_SSH_KEY, &key)?;
                    key
                }
            }
        };

        let name = format!("nimbus-{}", &key.fingerprint[..12.min(key.fingerprint.len())]);
        let key_id = provider.ensure_ssh_key(&name, &key.public_key).await?;
        Ok((key, key_id))
    }

    // ========================================================================
    // Retry / delete / power
    // ========================================================================

    /// Restart a failed instance from `Requested`.
    ///
    /// Any provider resource left from the failed attempt is deleted first.
    pub async fn retry_vps(self: &Arc<Self>, id: &str) -> Result<InstanceHandle> {
        let name = {
            let _gate = self.instance_gates.lock(id).await;
            let mut record = self.state.require_instance(id)?;
            if !record.state.can_retry() {
                return Err(Error::Conflict(format!(
                    "instance {} is {}; only failed instances can be retried",
                    record.name, record.state
                )));
            }
            let provider = self.providers.get(Some(&record.provider))?;
            if let Some(pid) = record.provider_id.take() {
                provider.delete_instance(&pid).await?;
                info!(instance_id = %id, provider_id = %pid, "Removed resource from failed attempt");
            }
            record.ipv4 = None;
            record.ssh_key = None;
            record.last_error = None;
            record.cost.accrual_started_at = None;
            record.cost.accrual_ended_at = None;
            record.force_state(InstanceState::Requested, Some("retry".to_string()));
            self.state.save_instance(&record)?;
            record.name
        };
        info!(instance_id = %id, "Retrying instance");
        Ok(self.spawn_provisioning(id.to_string(), name))
    }

    /// Delete an instance. Deleting an unknown id succeeds.
    pub async fn delete_vps(&self, id: &str) -> Result<()> {
        let _gate = self.instance_gates.lock(id).await;

        let Some(mut record) = self.state.get_instance(id)? else {
            debug!(instance_id = %id, "Delete of unknown instance is a no-op");
            return Ok(());
        };
        if record.state != InstanceState::Deleting {
            record.transition(InstanceState::Deleting, None)?;
            self.state.save_instance(&record)?;
        }

        if let Some(ip) = &record.ipv4 {
            self.ssh.invalidate(ip).await;
        }

        if let Some(pid) = record.provider_id.clone() {
            let provider = self.providers.get(Some(&record.provider))?;
            match provider.delete_instance(&pid).await {
                Ok(DeleteOutcome::Deleted) => info!(instance_id = %id, provider_id = %pid, "Provider instance deleted"),
                Ok(DeleteOutcome::AlreadyGone) => debug!(instance_id = %id, "Provider instance already gone"),
                Err(e) => {
                    record.last_error = Some(e.to_string());
                    self.state.save_instance(&record)?;
                    return Err(e);
                }
            }
        }

        if let (Some(domain), Some(certs), Some(ip)) = (&record.domain, &self.certs, &record.ipv4) {
            match certs.get_domain(domain) {
                Ok(Some(status)) if &status.instance_ip == ip => {
                    if let Err(e) = certs.remove_domain_configuration(domain).await {
                        warn!(instance_id = %id, domain = %domain, "Leaving domain configuration in place: {}", e);
                    }
                }
                _ => {}
            }
        }

        record.transition(InstanceState::Deleted, None)?;
        self.state.remove_instance(id)?;
        info!(instance_id = %id, name = %record.name, "Instance deleted");
        Ok(())
    }

    pub async fn power_action(&self, id: &str, action: PowerAction) -> Result<InstanceRecord> {
        let _gate = self.instance_gates.lock(id).await;
        let mut record = self.state.require_instance(id)?;

        let allowed = match action {
            PowerAction::Off | PowerAction::Reboot => record.state == InstanceState::Running,
            PowerAction::On => record.state == InstanceState::PoweredOff,
        };
        if !allowed {
            return Err(Error::Conflict(format!(
                "cannot power {} instance {} while {}",
                action, record.name, record.state
            )));
        }
        let pid = record
            .provider_id
            .clone()
            .ok_or_else(|| Error::Internal(format!("instance {} has no provider id", record.name)))?;
        let provider = self.providers.get(Some(&record.provider))?;

        if action == PowerAction::Reboot {
            self.advance(&mut record, InstanceState::Rebooting)?;
        }
        if let Err(e) = provider.power_action(&pid, action).await {
            if action == PowerAction::Reboot {
                record.last_error = Some(e.to_string());
                record.force_state(InstanceState::Running, Some("reboot rejected".to_string()));
                self.state.save_instance(&record)?;
            }
            return Err(e);
        }
        if let Some(ip) = &record.ipv4 {
            self.ssh.invalidate(ip).await;
        }

        match action {
            PowerAction::Off => self.advance(&mut record, InstanceState::PoweredOff)?,
            PowerAction::On | PowerAction::Reboot => {
                let pid = pid.as_str();
                let provider = &provider;
                let ready = retry::poll_until(
                    &self.provisioning.readiness_backoff(),
                    "power on",
                    || async move {
                        let current = provider.get_instance(pid).await?;
                        Ok(if current.is_network_ready() {
                            Poll::Ready(())
                        } else {
                            Poll::Pending
                        })
                    },
                )
                .await;
                // The provider accepted the action, so the record follows it
                // even when readiness could not be confirmed.
                if let Err(e) = ready {
                    warn!(instance_id = %id, action = %action, "Readiness not confirmed: {}", e);
                    record.last_error = Some(e.to_string());
                    record.force_state(InstanceState::Running, Some(format!("{} unconfirmed", action)));
                    self.state.save_instance(&record)?;
                    return Err(e);
                }
                record.last_error = None;
                self.advance(&mut record, InstanceState::Running)?;
            }
        }
        info!(instance_id = %id, action = %action, "Power action complete");
        Ok(record)
    }

    // ========================================================================
    // SSH access
    // ========================================================================

    /// Connection to an instance that has passed `SshReady`
    pub async fn connection_for(&self, id: &str) -> Result<Arc<CachedConnection>> {
        let (ip, key) = self.ssh_target(id)?;
        self.ssh.connect(&ip, &key).await
    }

    /// Retrying command runner for an instance that has passed `SshReady`
    pub fn remote_for(&self, id: &str) -> Result<Remote> {
        let (ip, key) = self.ssh_target(id)?;
        Ok(Remote::new(self.ssh.clone(), &ip, key))
    }

    fn ssh_target(&self, id: &str) -> Result<(String, SshKeyMaterial)> {
        let record = self.state.require_instance(id)?;
        if !record.state.is_ssh_reachable() {
            return Err(Error::Conflict(format!(
                "instance {} is {}, not reachable over SSH",
                record.name, record.state
            )));
        }
        let ip = record
            .ipv4
            .ok_or_else(|| Error::Conflict(format!("instance {} has no address", record.name)))?;
        let key = self
            .state
            .load_ssh_key(DEFAULT_SSH_KEY)?
            .ok_or_else(|| Error::not_found("ssh key", DEFAULT_SSH_KEY))?;
        Ok((ip, key))
    }

    pub fn ssh(&self) -> &Arc<SshService> {
        &self.ssh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("test1").is_ok());
        assert!(validate_name("web-01").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("Test").is_err());
        assert!(validate_name("-web").is_err());
        assert!(validate_name("a_b").is_err());
        assert!(validate_name(&"a".repeat(64)).is_err());
    }
}
