//! Edge (CDN / certificate authority) API seam

use async_trait::async_trait;
use nimbus_common::{EdgePolicy, Error, ProviderErrorKind, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

/// An origin certificate returned by the edge CA
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub id: String,
    /// PEM leaf
    pub certificate: String,
}

/// Outcome of pointing a DNS name at an address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsChange {
    pub record_id: String,
    pub name: String,
    /// Content before the change; `None` when the record was created
    pub previous: Option<String>,
}

#[async_trait]
pub trait EdgeApi: Send + Sync {
    /// Zone that serves `domain`
    async fn zone_id(&self, domain: &str) -> Result<String>;

    async fn request_origin_certificate(
        &self,
        csr_pem: &str,
        hostnames: &[String],
        validity_days: u32,
    ) -> Result<IssuedCertificate>;

    /// Root certificate of the origin CA (PEM)
    async fn origin_root(&self) -> Result<String>;

    async fn set_policy(&self, zone_id: &str, policy: EdgePolicy) -> Result<()>;

    /// Create or repoint a proxied A record
    async fn upsert_a_record(&self, zone_id: &str, name: &str, ip: &str) -> Result<DnsChange>;

    /// Missing records count as deleted
    async fn delete_dns_record(&self, zone_id: &str, record_id: &str) -> Result<()>;

    /// Redirect `www.<domain>` to the bare domain over HTTPS; returns the rule id
    async fn create_redirect_rule(&self, zone_id: &str, domain: &str) -> Result<String>;

    /// Missing rules count as deleted
    async fn delete_redirect_rule(&self, zone_id: &str, rule_id: &str) -> Result<()>;
}

/// Operation names accepted by [`SimulatedEdge::fail`]
pub mod op {
    pub const ZONE: &str = "zone";
    pub const ISSUE: &str = "issue";
    pub const ROOT: &str = "root";
    pub const POLICY: &str = "policy";
    pub const DNS: &str = "dns";
    pub const REDIRECT: &str = "redirect";
    /// Deletions only; `DNS` and `REDIRECT` fail both directions
    pub const DNS_DELETE: &str = "dns_delete";
    pub const REDIRECT_DELETE: &str = "redirect_delete";
}

#[derive(Default)]
struct EdgeState {
    zones: HashMap<String, String>,
    policies: HashMap<String, EdgePolicy>,
    /// record id -> (zone, name, ip)
    dns: HashMap<String, (String, String, String)>,
    /// rule id -> (zone, domain)
    rules: HashMap<String, (String, String)>,
    failing: HashSet<&'static str>,
    next_id: u64,
    /// Treat the registrable part of any domain as a known zone
    accept_any: bool,
}

/// In-memory edge used for local runs and tests
#[derive(Default)]
pub struct SimulatedEdge {
    state: Mutex<EdgeState>,
    issued: AtomicUsize,
}

pub const SIMULATED_ROOT: &str = "-----BEGIN CERTIFICATE-----\n\
bmltYnVzIHNpbXVsYXRlZCBvcmlnaW4gcm9vdA==\n\
-----END CERTIFICATE-----\n";

impl SimulatedEdge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every domain resolves to a zone named after its last two labels
    pub fn accepting_any_zone() -> Self {
        let edge = Self::default();
        edge.state.lock().accept_any = true;
        edge
    }

    /// Register a zone so lookups for the domain and its subdomains succeed
    pub fn with_zone(self, name: &str) -> Self {
        {
            let mut state = self.state.lock();
            let id = format!("zone-{}", state.zones.len() + 1);
            state.zones.insert(name.to_string(), id);
        }
        self
    }

    /// Make `op` fail permanently until [`SimulatedEdge::recover`]
    pub fn fail(&self, op: &'static str) {
        self.state.lock().failing.insert(op);
    }

    pub fn recover(&self, op: &'static str) {
        self.state.lock().failing.remove(op);
    }

    pub fn issued_count(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn policy(&self, zone_id: &str) -> Option<EdgePolicy> {
        self.state.lock().policies.get(zone_id).copied()
    }

    pub fn dns_records(&self) -> Vec<(String, String)> {
        let mut records: Vec<_> = self
            .state
            .lock()
            .dns
            .values()
            .map(|(_, name, ip)| (name.clone(), ip.clone()))
            .collect();
        records.sort();
        records
    }

    pub fn redirect_rules(&self) -> usize {
        self.state.lock().rules.len()
    }

    fn check(&self, op: &'static str) -> Result<()> {
        if self.state.lock().failing.contains(op) {
            return Err(Error::provider(
                ProviderErrorKind::Permanent,
                format!("simulated edge failure: {}", op),
            ));
        }
        Ok(())
    }

    fn next_id(state: &mut EdgeState, prefix: &str) -> String {
        state.next_id += 1;
        format!("{}-{}", prefix, state.next_id)
    }
}

#[async_trait]
impl EdgeApi for SimulatedEdge {
    async fn zone_id(&self, domain: &str) -> Result<String> {
        self.check(op::ZONE)?;
        let state = self.state.lock();
        let candidates = zone_candidates(domain);
        if let Some(id) = candidates
            .iter()
            .find_map(|candidate| state.zones.get(*candidate).cloned())
        {
            return Ok(id);
        }
        match candidates.last() {
            Some(apex) if state.accept_any && apex.contains('.') => Ok(format!("zone-{}", apex)),
            _ => Err(Error::not_found("zone", domain)),
        }
    }

    async fn request_origin_certificate(
        &self,
        csr_pem: &str,
        hostnames: &[String],
        _validity_days: u32,
    ) -> Result<IssuedCertificate> {
        self.check(op::ISSUE)?;
        if !csr_pem.contains("CERTIFICATE REQUEST") || hostnames.is_empty() {
            return Err(Error::provider(ProviderErrorKind::InvalidSpec, "malformed CSR"));
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        let body = Sha256::digest(csr_pem.as_bytes());
        let certificate = pem::encode(&pem::Pem::new("CERTIFICATE", body.to_vec()));
        Ok(IssuedCertificate {
            id: format!("cert-{}", n),
            certificate,
        })
    }

    async fn origin_root(&self) -> Result<String> {
        self.check(op::ROOT)?;
        Ok(SIMULATED_ROOT.to_string())
    }

    async fn set_policy(&self, zone_id: &str, policy: EdgePolicy) -> Result<()> {
        self.check(op::POLICY)?;
        self.state.lock().policies.insert(zone_id.to_string(), policy);
        Ok(())
    }

    async fn upsert_a_record(&self, zone_id: &str, name: &str, ip: &str) -> Result<DnsChange> {
        self.check(op::DNS)?;
        let mut state = self.state.lock();
        let existing = state
            .dns
            .iter_mut()
            .find(|(_, (zone, n, _))| zone == zone_id && n == name);
        if let Some((id, (_, _, content))) = existing {
            let previous = std::mem::replace(content, ip.to_string());
            return Ok(DnsChange {
                record_id: id.clone(),
                name: name.to_string(),
                previous: Some(previous),
            });
        }
        let id = Self::next_id(&mut state, "dns");
        state.dns.insert(
            id.clone(),
            (zone_id.to_string(), name.to_string(), ip.to_string()),
        );
        Ok(DnsChange {
            record_id: id,
            name: name.to_string(),
            previous: None,
        })
    }

    async fn delete_dns_record(&self, _zone_id: &str, record_id: &str) -> Result<()> {
        self.check(op::DNS)?;
        self.check(op::DNS_DELETE)?;
        self.state.lock().dns.remove(record_id);
        Ok(())
    }

    async fn create_redirect_rule(&self, zone_id: &str, domain: &str) -> Result<String> {
        self.check(op::REDIRECT)?;
        let mut state = self.state.lock();
        let id = Self::next_id(&mut state, "rule");
        state
            .rules
            .insert(id.clone(), (zone_id.to_string(), domain.to_string()));
        Ok(id)
    }

    async fn delete_redirect_rule(&self, _zone_id: &str, rule_id: &str) -> Result<()> {
        self.check(op::REDIRECT)?;
        self.check(op::REDIRECT_DELETE)?;
        self.state.lock().rules.remove(rule_id);
        Ok(())
    }
}

/// `a.b.example.com` -> `a.b.example.com`, `b.example.com`, `example.com`
pub fn zone_candidates(domain: &str) -> Vec<&str> {
    let mut out = vec![domain];
    let mut rest = domain;
    while let Some((_, parent)) = rest.split_once('.') {
        if !parent.contains('.') {
            break;
        }
        out.push(parent);
        rest = parent;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_candidates() {
        assert_eq!(
            zone_candidates("a.b.example.com"),
            vec!["a.b.example.com", "b.example.com", "example.com"]
        );
        assert_eq!(zone_candidates("example.com"), vec!["example.com"]);
    }

    #[tokio::test]
    async fn test_dns_upsert_reports_previous() {
        let edge = SimulatedEdge::new().with_zone("example.com");
        let zone = edge.zone_id("www.example.com").await.unwrap();

        let created = edge.upsert_a_record(&zone, "example.com", "203.0.113.1").await.unwrap();
        assert!(created.previous.is_none());
        let updated = edge.upsert_a_record(&zone, "example.com", "203.0.113.2").await.unwrap();
        assert_eq!(updated.record_id, created.record_id);
        assert_eq!(updated.previous.as_deref(), Some("203.0.113.1"));
        assert_eq!(
            edge.dns_records(),
            vec![("example.com".to_string(), "203.0.113.2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_accepting_any_zone() {
        let edge = SimulatedEdge::accepting_any_zone();
        assert_eq!(edge.zone_id("www.example.org").await.unwrap(), "zone-example.org");
        assert!(edge.zone_id("localhost").await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_zone() {
        let edge = SimulatedEdge::new().with_zone("example.com");
        assert!(edge.zone_id("example.org").await.unwrap_err().is_not_found());
    }
}
