//! Certificate pipeline
//!
//! Turns a bare domain into an HTTPS endpoint in front of an instance:
//! origin key and CSR, edge-issued origin certificate, full chain, hardened
//! edge policy, DNS, www redirect, sealed persistence and finally the files
//! on the instance. Every step with an external side effect registers a
//! compensating action; the first failure unwinds them in reverse order.
//! Edge changes that cannot be unwound are recorded as an [`EdgeLeftover`]
//! and retried by the reconciler.

pub mod cloudflare;
pub mod edge;

use crate::config::CertsConfig;
use crate::ssh::{ops, CommandRunner, Remote, SshService};
use crate::state::{StateManager, DEFAULT_SSH_KEY};
use edge::{DnsChange, EdgeApi};
use nimbus_common::{DomainCertificate, EdgeLeftover, EdgePolicy, Error, KeyedLocks, Result};
use rand::rngs::OsRng;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_RSA_SHA256};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Modulus size of origin keys
pub const ORIGIN_KEY_BITS: usize = 2048;

/// Pipeline steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ResolveZone,
    GenerateKey,
    RequestCertificate,
    BuildChain,
    EdgePolicy,
    DnsRecords,
    RedirectRule,
    Persist,
    PushToInstance,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::ResolveZone => "resolve_zone",
            Step::GenerateKey => "generate_key",
            Step::RequestCertificate => "request_certificate",
            Step::BuildChain => "build_chain",
            Step::EdgePolicy => "edge_policy",
            Step::DnsRecords => "dns_records",
            Step::RedirectRule => "redirect_rule",
            Step::Persist => "persist",
            Step::PushToInstance => "push_to_instance",
        }
    }
}

fn at(step: Step) -> impl FnOnce(Error) -> (Step, Error) {
    move |e| (step, e)
}

/// Public view of a configured domain (no key material)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainStatus {
    pub domain: String,
    pub instance_ip: String,
    pub policy: EdgePolicy,
    pub redirect_rule_id: Option<String>,
    pub created_at: i64,
    /// False when an existing configuration already matched the request
    pub issued: bool,
}

impl DomainStatus {
    fn from_record(record: &DomainCertificate, issued: bool) -> Self {
        Self {
            domain: record.domain.clone(),
            instance_ip: record.instance_ip.clone(),
            policy: record.policy,
            redirect_rule_id: record.redirect_rule_id.clone(),
            created_at: record.created_at,
            issued,
        }
    }
}

enum Undo {
    Policy {
        zone_id: String,
        restore: EdgePolicy,
    },
    Dns {
        zone_id: String,
        change: DnsChange,
    },
    Redirect {
        zone_id: String,
        rule_id: String,
    },
    Record {
        domain: String,
        previous: Option<Box<DomainCertificate>>,
    },
}

/// Lower-cased, trailing dot removed, hostname syntax checked
pub fn normalize_domain(domain: &str) -> Result<String> {
    let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    let labels: Vec<&str> = domain.split('.').collect();
    let valid = domain.len() <= 253
        && labels.len() >= 2
        && labels.iter().all(|l| {
            !l.is_empty()
                && l.len() <= 63
                && !l.starts_with('-')
                && !l.ends_with('-')
                && l.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });
    if !valid {
        return Err(Error::Validation(format!("invalid domain '{}'", domain)));
    }
    Ok(domain)
}

/// New RSA key (PKCS#8 PEM) and a CSR for `domain` and `*.domain`
pub fn generate_key_and_csr(domain: &str) -> Result<(String, String)> {
    let private = RsaPrivateKey::new(&mut OsRng, ORIGIN_KEY_BITS)
        .map_err(|e| Error::Internal(format!("RSA key generation failed: {}", e)))?;
    let key_pem = private
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| Error::Internal(format!("failed to encode origin key: {}", e)))?
        .to_string();

    let csr_err = |e: rcgen::Error| Error::Internal(format!("CSR generation failed: {}", e));
    let key_pair = KeyPair::from_pem_and_sign_algo(&key_pem, &PKCS_RSA_SHA256).map_err(csr_err)?;
    let mut params =
        CertificateParams::new(vec![domain.to_string(), format!("*.{}", domain)]).map_err(csr_err)?;
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, domain);
    params.distinguished_name = name;

    let csr_pem = params
        .serialize_request(&key_pair)
        .and_then(|csr| csr.pem())
        .map_err(csr_err)?;
    Ok((key_pem, csr_pem))
}

/// Leaf followed by the issuer root, each validated as a PEM certificate
pub fn build_chain(leaf: &str, root: &str) -> Result<String> {
    let mut chain = String::new();
    for (what, text) in [("leaf", leaf), ("root", root)] {
        let blocks = pem::parse_many(text.as_bytes())
            .map_err(|e| Error::Validation(format!("{} certificate is not PEM: {}", what, e)))?;
        if blocks.is_empty() || blocks.iter().any(|b| b.tag() != "CERTIFICATE") {
            return Err(Error::Validation(format!(
                "{} does not contain a certificate",
                what
            )));
        }
        let text = text.replace("\r\n", "\n");
        chain.push_str(text.trim());
        chain.push('\n');
    }
    Ok(chain)
}

/// Fold an edge compensation that failed into the leftover marker
fn remember(slot: &mut Option<EdgeLeftover>, domain: &str, action: Undo, cause: &Error) {
    let new = |zone_id: &str| EdgeLeftover::new(domain, zone_id, cause.to_string());
    match action {
        Undo::Policy { zone_id, restore } => {
            slot.get_or_insert_with(|| new(&zone_id)).restore_policy = Some(restore)
        }
        Undo::Dns { zone_id, change } => {
            let leftover = slot.get_or_insert_with(|| new(&zone_id));
            match change.previous {
                None => leftover.dns_record_ids.push(change.record_id),
                Some(ip) => leftover.dns_restores.push((change.name, ip)),
            }
        }
        Undo::Redirect { zone_id, rule_id } => {
            slot.get_or_insert_with(|| new(&zone_id)).redirect_rule_id = Some(rule_id)
        }
        Undo::Record { domain, .. } => {
            error!(domain = %domain, "Stored certificate record could not be rolled back")
        }
    }
}

/// Runs domain configuration and removal, one at a time per domain
pub struct CertificateManager {
    edge: Arc<dyn EdgeApi>,
    state: StateManager,
    ssh: Arc<SshService>,
    config: CertsConfig,
    gates: KeyedLocks,
}

impl CertificateManager {
    pub fn new(
        edge: Arc<dyn EdgeApi>,
        state: StateManager,
        ssh: Arc<SshService>,
        config: CertsConfig,
    ) -> Self {
        Self {
            edge,
            state,
            ssh,
            config,
            gates: KeyedLocks::new(),
        }
    }

    pub fn get_domain(&self, domain: &str) -> Result<Option<DomainStatus>> {
        let domain = normalize_domain(domain)?;
        Ok(self
            .state
            .load_certificate(&domain)?
            .map(|r| DomainStatus::from_record(&r, false)))
    }

    pub fn list_domains(&self) -> Result<Vec<DomainStatus>> {
        let mut out = Vec::new();
        for domain in self.state.certificate_domains()? {
            if let Some(record) = self.state.load_certificate(&domain)? {
                out.push(DomainStatus::from_record(&record, false));
            }
        }
        Ok(out)
    }

    /// Configure `domain` to front `instance_ip`.
    ///
    /// A domain already installed for the same address is left untouched.
    /// On failure the returned [`Error::Pipeline`] names the failed step and
    /// whether every compensating action succeeded.
    ///
    /// The work runs on its own task: dropping the returned future does not
    /// stop the pipeline half way.
    pub async fn configure_domain_ssl(
        self: &Arc<Self>,
        domain: &str,
        instance_ip: &str,
    ) -> Result<DomainStatus> {
        let domain = normalize_domain(domain)?;
        instance_ip
            .parse::<Ipv4Addr>()
            .map_err(|_| Error::Validation(format!("invalid IPv4 address '{}'", instance_ip)))?;

        let manager = self.clone();
        let instance_ip = instance_ip.to_string();
        tokio::spawn(async move { manager.configure(&domain, &instance_ip).await })
            .await
            .map_err(|e| Error::Internal(format!("domain configuration task failed: {}", e)))?
    }

    async fn configure(&self, domain: &str, instance_ip: &str) -> Result<DomainStatus> {
        let _gate = self.gates.lock(domain).await;
        self.settle_leftover(domain).await?;

        let previous = self.state.load_certificate(domain)?;
        if let Some(existing) = &previous {
            if existing.instance_ip == instance_ip && existing.installed {
                info!(domain = %domain, "Domain already configured for {}", instance_ip);
                return Ok(DomainStatus::from_record(existing, false));
            }
        }

        info!(domain = %domain, ip = %instance_ip, "Configuring domain SSL");
        let mut undo = Vec::new();
        match self
            .run_pipeline(domain, instance_ip, previous, &mut undo)
            .await
        {
            Ok(record) => {
                info!(domain = %domain, "Domain SSL configured");
                Ok(DomainStatus::from_record(&record, true))
            }
            Err((step, source)) => {
                warn!(domain = %domain, step = step.as_str(), "Domain SSL failed: {}", source);
                let compensated = self.compensate(domain, undo, &source).await;
                Err(Error::Pipeline {
                    workflow: format!("configure SSL for {}", domain),
                    step: step.as_str().to_string(),
                    compensated,
                    source: Box::new(source),
                })
            }
        }
    }

    async fn run_pipeline(
        &self,
        domain: &str,
        instance_ip: &str,
        previous: Option<DomainCertificate>,
        undo: &mut Vec<Undo>,
    ) -> std::result::Result<DomainCertificate, (Step, Error)> {
        let zone_id = self.edge.zone_id(domain).await.map_err(at(Step::ResolveZone))?;

        let owned = domain.to_string();
        let (key_pem, csr_pem) = tokio::task::spawn_blocking(move || generate_key_and_csr(&owned))
            .await
            .map_err(|e| Error::Internal(format!("key generation task failed: {}", e)))
            .and_then(|r| r)
            .map_err(at(Step::GenerateKey))?;

        let hostnames = vec![domain.to_string(), format!("*.{}", domain)];
        let issued = self
            .edge
            .request_origin_certificate(&csr_pem, &hostnames, self.config.validity_days)
            .await
            .map_err(at(Step::RequestCertificate))?;

        let root = self.edge.origin_root().await.map_err(at(Step::BuildChain))?;
        let chain = build_chain(&issued.certificate, &root).map_err(at(Step::BuildChain))?;

        let restore = previous
            .as_ref()
            .map(|p| p.policy)
            .unwrap_or(EdgePolicy::DEFAULT);
        self.edge
            .set_policy(&zone_id, EdgePolicy::HARDENED)
            .await
            .map_err(at(Step::EdgePolicy))?;
        undo.push(Undo::Policy {
            zone_id: zone_id.clone(),
            restore,
        });

        let mut dns_record_ids = previous
            .as_ref()
            .map(|p| p.dns_record_ids.clone())
            .unwrap_or_default();
        for name in [domain.to_string(), format!("www.{}", domain)] {
            let change = self
                .edge
                .upsert_a_record(&zone_id, &name, instance_ip)
                .await
                .map_err(at(Step::DnsRecords))?;
            if change.previous.is_none() {
                dns_record_ids.push(change.record_id.clone());
            }
            undo.push(Undo::Dns {
                zone_id: zone_id.clone(),
                change,
            });
        }

        let redirect_rule_id = match previous.as_ref().and_then(|p| p.redirect_rule_id.clone()) {
            Some(existing) => existing,
            None => {
                let rule_id = self
                    .edge
                    .create_redirect_rule(&zone_id, domain)
                    .await
                    .map_err(at(Step::RedirectRule))?;
                undo.push(Undo::Redirect {
                    zone_id: zone_id.clone(),
                    rule_id: rule_id.clone(),
                });
                rule_id
            }
        };

        let mut record = DomainCertificate {
            domain: domain.to_string(),
            certificate_chain: chain,
            private_key_pem: key_pem,
            policy: EdgePolicy::HARDENED,
            instance_ip: instance_ip.to_string(),
            redirect_rule_id: Some(redirect_rule_id),
            dns_record_ids,
            created_at: chrono::Utc::now().timestamp(),
            installed: false,
        };
        self.state
            .store_certificate(&record)
            .map_err(at(Step::Persist))?;
        undo.push(Undo::Record {
            domain: domain.to_string(),
            previous: previous.map(Box::new),
        });

        self.push_to_instance(&record)
            .await
            .map_err(at(Step::PushToInstance))?;

        record.installed = true;
        self.state
            .store_certificate(&record)
            .map_err(at(Step::Persist))?;
        Ok(record)
    }

    async fn push_to_instance(&self, record: &DomainCertificate) -> Result<()> {
        let key = self.state.load_ssh_key(DEFAULT_SSH_KEY)?.ok_or_else(|| {
            Error::Validation("no instance SSH key has been created yet".to_string())
        })?;
        let timeout = Duration::from_secs(60);
        let remote = Remote::new(self.ssh.clone(), &record.instance_ip, key);

        ops::push_file(
            &remote,
            &self.config.remote_cert_path,
            record.certificate_chain.as_bytes(),
            0o644,
            timeout,
        )
        .await?;
        ops::push_file(
            &remote,
            &self.config.remote_key_path,
            record.private_key_pem.as_bytes(),
            0o600,
            timeout,
        )
        .await?;

        if let Some(reload) = &self.config.reload_command {
            remote.run(reload, timeout).await?.check("reload")?;
        }
        info!(domain = %record.domain, host = %record.instance_ip, "Certificate installed on instance");
        Ok(())
    }

    /// Run compensations newest first; true when all of them succeeded.
    ///
    /// Edge changes that could not be undone are recorded for the reconciler.
    async fn compensate(&self, domain: &str, undo: Vec<Undo>, cause: &Error) -> bool {
        let mut clean = true;
        let mut leftover = None;
        for action in undo.into_iter().rev() {
            let result = match &action {
                Undo::Policy { zone_id, restore } => self.edge.set_policy(zone_id, *restore).await,
                Undo::Dns { zone_id, change } => match &change.previous {
                    None => self.edge.delete_dns_record(zone_id, &change.record_id).await,
                    Some(ip) => self
                        .edge
                        .upsert_a_record(zone_id, &change.name, ip)
                        .await
                        .map(|_| ()),
                },
                Undo::Redirect { zone_id, rule_id } => {
                    self.edge.delete_redirect_rule(zone_id, rule_id).await
                }
                Undo::Record { domain, previous } => match previous {
                    Some(p) => self.state.store_certificate(p),
                    None => self.state.remove_certificate(domain).map(|_| ()),
                },
            };
            if let Err(e) = result {
                warn!(domain = %domain, "Compensation failed: {}", e);
                clean = false;
                remember(&mut leftover, domain, action, cause);
            }
        }

        let Some(leftover) = leftover else {
            return clean;
        };
        let merged = match self.state.load_edge_leftover(domain) {
            Ok(Some(mut existing)) => {
                existing.merge(leftover);
                existing
            }
            _ => leftover,
        };
        match self.state.record_edge_leftover(&merged) {
            Ok(()) => warn!(domain = %domain, "Edge changes left for reconciliation"),
            Err(e) => error!(domain = %domain, "Failed to record edge leftovers: {}", e),
        }
        false
    }

    /// Retry the recorded leftovers for `domain`. Caller holds the domain gate.
    async fn settle_leftover(&self, domain: &str) -> Result<()> {
        let Some(mut leftover) = self.state.load_edge_leftover(domain)? else {
            return Ok(());
        };
        let zone_id = leftover.zone_id.clone();
        let mut failure = None;

        if let Some(rule_id) = leftover.redirect_rule_id.take() {
            if let Err(e) = self.edge.delete_redirect_rule(&zone_id, &rule_id).await {
                leftover.redirect_rule_id = Some(rule_id);
                failure = Some(e);
            }
        }
        for record_id in std::mem::take(&mut leftover.dns_record_ids) {
            if let Err(e) = self.edge.delete_dns_record(&zone_id, &record_id).await {
                leftover.dns_record_ids.push(record_id);
                failure = Some(e);
            }
        }
        for (name, ip) in std::mem::take(&mut leftover.dns_restores) {
            if let Err(e) = self.edge.upsert_a_record(&zone_id, &name, &ip).await {
                leftover.dns_restores.push((name, ip));
                failure = Some(e);
            }
        }
        if let Some(policy) = leftover.restore_policy.take() {
            if let Err(e) = self.edge.set_policy(&zone_id, policy).await {
                leftover.restore_policy = Some(policy);
                failure = Some(e);
            }
        }

        match failure {
            None => {
                self.state.clear_edge_leftover(domain)?;
                info!(domain = %domain, "Edge leftovers cleaned up");
                Ok(())
            }
            Some(e) => {
                leftover.attempts += 1;
                leftover.reason = e.to_string();
                self.state.record_edge_leftover(&leftover)?;
                Err(e)
            }
        }
    }

    /// One reconciliation pass over recorded leftovers: `(cleared, remaining)`
    pub async fn reconcile_leftovers(&self) -> Result<(usize, usize)> {
        let (mut cleared, mut remaining) = (0, 0);
        for leftover in self.state.list_edge_leftovers()? {
            let _gate = self.gates.lock(&leftover.domain).await;
            match self.settle_leftover(&leftover.domain).await {
                Ok(()) => cleared += 1,
                Err(e) => {
                    warn!(domain = %leftover.domain, "Edge cleanup still failing: {}", e);
                    remaining += 1;
                }
            }
        }
        Ok((cleared, remaining))
    }

    /// Undo edge policy, redirect, DNS records and the stored record.
    ///
    /// The origin certificate itself stays valid at the CA; it is not revoked.
    /// Removing a domain that is not configured succeeds.
    pub async fn remove_domain_configuration(&self, domain: &str) -> Result<()> {
        let domain = normalize_domain(domain)?;
        let _gate = self.gates.lock(&domain).await;
        self.settle_leftover(&domain).await?;

        let Some(record) = self.state.load_certificate(&domain)? else {
            info!(domain = %domain, "Domain not configured, nothing to remove");
            return Ok(());
        };

        let zone_id = self.edge.zone_id(&domain).await?;
        self.edge.set_policy(&zone_id, EdgePolicy::DEFAULT).await?;
        if let Some(rule_id) = &record.redirect_rule_id {
            self.edge.delete_redirect_rule(&zone_id, rule_id).await?;
        }
        for record_id in &record.dns_record_ids {
            self.edge.delete_dns_record(&zone_id, record_id).await?;
        }
        self.state.remove_certificate(&domain)?;
        info!(domain = %domain, "Domain configuration removed");
        Ok(())
    }
}
