//! Cloudflare v4 API edge backend

use super::edge::{zone_candidates, DnsChange, EdgeApi, IssuedCertificate};
use async_trait::async_trait;
use dashmap::DashMap;
use nimbus_common::{EdgePolicy, Error, Result};
use nimbus_provider::client::ApiClient;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

pub const DEFAULT_ENDPOINT: &str = "https://api.cloudflare.com/client/v4";
pub const ORIGIN_CA_RSA_ROOT_URL: &str =
    "https://developers.cloudflare.com/ssl/static/origin_ca_rsa_root.pem";

/// `{ success, errors, result }` wrapper on every response
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct OriginCertificate {
    id: String,
    certificate: String,
}

#[derive(Debug, Deserialize)]
struct DnsRecord {
    id: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct Identified {
    id: String,
}

#[derive(Debug, Serialize)]
struct DnsRecordBody<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
    proxied: bool,
}

/// Cloudflare client
pub struct CloudflareEdge {
    api: ApiClient,
    root_url: String,
    /// domain -> zone id, for the lifetime of this client
    zones: DashMap<String, String>,
}

impl CloudflareEdge {
    pub fn new(token: &str) -> Result<Self> {
        Self::with_endpoint(DEFAULT_ENDPOINT, token)
    }

    pub fn with_endpoint(endpoint: &str, token: &str) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new("cloudflare", endpoint, token)?,
            root_url: ORIGIN_CA_RSA_ROOT_URL.to_string(),
            zones: DashMap::new(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        Ok(self.api.get::<Envelope<T>>(path).await?.result)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        Ok(self.api.post::<B, Envelope<T>>(path, body).await?.result)
    }

    async fn patch<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        Ok(self.api.patch::<B, Envelope<T>>(path, body).await?.result)
    }

    async fn delete_ignoring_missing(&self, path: &str) -> Result<()> {
        match self.api.delete(path).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

#[async_trait]
impl EdgeApi for CloudflareEdge {
    async fn zone_id(&self, domain: &str) -> Result<String> {
        if let Some(id) = self.zones.get(domain) {
            return Ok(id.clone());
        }
        for candidate in zone_candidates(domain) {
            let zones: Vec<Zone> = self.get(&format!("/zones?name={}", candidate)).await?;
            if let Some(zone) = zones.into_iter().find(|z| z.name == candidate) {
                debug!(domain = %domain, zone = %zone.id, "Resolved zone");
                self.zones.insert(domain.to_string(), zone.id.clone());
                return Ok(zone.id);
            }
        }
        Err(Error::not_found("zone", domain))
    }

    async fn request_origin_certificate(
        &self,
        csr_pem: &str,
        hostnames: &[String],
        validity_days: u32,
    ) -> Result<IssuedCertificate> {
        let body = json!({
            "csr": csr_pem,
            "hostnames": hostnames,
            "request_type": "origin-rsa",
            "requested_validity": validity_days,
        });
        let cert: OriginCertificate = self.post("/certificates", &body).await?;
        info!(certificate_id = %cert.id, "Origin certificate issued");
        Ok(IssuedCertificate {
            id: cert.id,
            certificate: cert.certificate,
        })
    }

    async fn origin_root(&self) -> Result<String> {
        self.api.get_text(&self.root_url).await
    }

    async fn set_policy(&self, zone_id: &str, policy: EdgePolicy) -> Result<()> {
        let _: serde_json::Value = self
            .patch(
                &format!("/zones/{}/settings/ssl", zone_id),
                &json!({ "value": policy.tls_mode.as_str() }),
            )
            .await?;
        let https = if policy.force_https { "on" } else { "off" };
        let _: serde_json::Value = self
            .patch(
                &format!("/zones/{}/settings/always_use_https", zone_id),
                &json!({ "value": https }),
            )
            .await?;
        Ok(())
    }

    async fn upsert_a_record(&self, zone_id: &str, name: &str, ip: &str) -> Result<DnsChange> {
        let existing: Vec<DnsRecord> = self
            .get(&format!("/zones/{}/dns_records?type=A&name={}", zone_id, name))
            .await?;
        let body = DnsRecordBody {
            kind: "A",
            name,
            content: ip,
            ttl: 1,
            proxied: true,
        };

        match existing.into_iter().next() {
            Some(record) => {
                let _: Identified = self
                    .patch(&format!("/zones/{}/dns_records/{}", zone_id, record.id), &body)
                    .await?;
                Ok(DnsChange {
                    record_id: record.id,
                    name: name.to_string(),
                    previous: Some(record.content),
                })
            }
            None => {
                let created: Identified = self
                    .post(&format!("/zones/{}/dns_records", zone_id), &body)
                    .await?;
                Ok(DnsChange {
                    record_id: created.id,
                    name: name.to_string(),
                    previous: None,
                })
            }
        }
    }

    async fn delete_dns_record(&self, zone_id: &str, record_id: &str) -> Result<()> {
        self.delete_ignoring_missing(&format!("/zones/{}/dns_records/{}", zone_id, record_id))
            .await
    }

    async fn create_redirect_rule(&self, zone_id: &str, domain: &str) -> Result<String> {
        let rule: Identified = self
            .post(&format!("/zones/{}/pagerules", zone_id), &redirect_rule_body(domain))
            .await?;
        Ok(rule.id)
    }

    async fn delete_redirect_rule(&self, zone_id: &str, rule_id: &str) -> Result<()> {
        self.delete_ignoring_missing(&format!("/zones/{}/pagerules/{}", zone_id, rule_id))
            .await
    }
}

/// Page rule sending `www.<domain>/*` to `https://<domain>/$1`
fn redirect_rule_body(domain: &str) -> serde_json::Value {
    json!({
        "targets": [{
            "target": "url",
            "constraint": { "operator": "matches", "value": format!("www.{}/*", domain) },
        }],
        "actions": [{
            "id": "forwarding_url",
            "value": { "url": format!("https://{}/$1", domain), "status_code": 301 },
        }],
        "status": "active",
    })
}
