//! Hetzner Cloud backend

use crate::client::ApiClient;
use crate::provider::{
    Catalog, ComputeProvider, CreateRequest, DeleteOutcome, ProviderInstance, ProviderStatus,
    SizeInfo,
};
use async_trait::async_trait;
use nimbus_common::crypto::same_public_key;
use nimbus_common::{Error, PowerAction, ProviderErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub const DEFAULT_ENDPOINT: &str = "https://api.hetzner.cloud/v1";
pub const DEFAULT_IMAGE: &str = "ubuntu-22.04";

#[derive(Debug, Deserialize)]
struct Server {
    id: u64,
    name: String,
    status: String,
    public_net: PublicNet,
    server_type: ServerTypeRef,
    datacenter: Datacenter,
}

#[derive(Debug, Deserialize)]
struct PublicNet {
    ipv4: Option<Ipv4>,
}

#[derive(Debug, Deserialize)]
struct Ipv4 {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct ServerTypeRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Datacenter {
    location: Location,
}

#[derive(Debug, Deserialize)]
struct Location {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ServerEnvelope {
    server: Server,
}

#[derive(Debug, Deserialize)]
struct ServerList {
    servers: Vec<Server>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
struct Meta {
    pagination: Pagination,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    next_page: Option<u32>,
}

#[derive(Debug, Serialize)]
struct CreateServer<'a> {
    name: &'a str,
    server_type: &'a str,
    location: &'a str,
    image: &'a str,
    ssh_keys: Vec<u64>,
    labels: &'a HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_data: Option<&'a str>,
    start_after_create: bool,
}

#[derive(Debug, Deserialize)]
struct SshKey {
    id: u64,
    public_key: String,
}

#[derive(Debug, Deserialize)]
struct SshKeyList {
    ssh_keys: Vec<SshKey>,
    #[serde(default)]
    meta: Option<Meta>,
}

#[derive(Debug, Deserialize)]
struct SshKeyEnvelope {
    ssh_key: SshKey,
}

#[derive(Debug, Serialize)]
struct CreateSshKey<'a> {
    name: &'a str,
    public_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct ServerType {
    name: String,
    cores: u32,
    memory: f64,
    disk: u64,
    #[serde(default)]
    deprecated: Option<bool>,
    prices: Vec<Price>,
}

#[derive(Debug, Deserialize)]
struct Price {
    location: String,
    price_hourly: PriceAmount,
}

#[derive(Debug, Deserialize)]
struct PriceAmount {
    gross: String,
}

#[derive(Debug, Deserialize)]
struct ServerTypeList {
    server_types: Vec<ServerType>,
}

#[derive(Debug, Deserialize)]
struct LocationList {
    locations: Vec<Location>,
}

fn map_status(status: &str) -> ProviderStatus {
    match status {
        "initializing" => ProviderStatus::Initializing,
        "starting" => ProviderStatus::Starting,
        "running" => ProviderStatus::Running,
        "stopping" => ProviderStatus::Stopping,
        "off" => ProviderStatus::Off,
        "deleting" => ProviderStatus::Deleting,
        _ => ProviderStatus::Unknown,
    }
}

impl From<Server> for ProviderInstance {
    fn from(s: Server) -> Self {
        Self {
            provider_id: s.id.to_string(),
            name: s.name,
            status: map_status(&s.status),
            ipv4: s.public_net.ipv4.map(|v| v.ip),
            size: s.server_type.name,
            region: s.datacenter.location.name,
        }
    }
}

fn parse_id(kind: &str, id: &str) -> Result<u64> {
    id.parse()
        .map_err(|_| Error::Validation(format!("invalid Hetzner {} id '{}'", kind, id)))
}

/// Hetzner Cloud compute provider
pub struct HetznerProvider {
    api: ApiClient,
    default_image: String,
}

impl HetznerProvider {
    pub fn new(token: &str) -> Result<Self> {
        Self::with_endpoint(DEFAULT_ENDPOINT, token)
    }

    pub fn with_endpoint(endpoint: &str, token: &str) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new("hetzner", endpoint, token)?,
            default_image: DEFAULT_IMAGE.to_string(),
        })
    }

    pub fn with_default_image(mut self, image: impl Into<String>) -> Self {
        self.default_image = image.into();
        self
    }

    async fn list_ssh_keys(&self) -> Result<Vec<SshKey>> {
        let mut keys = Vec::new();
        let mut page = 1;
        loop {
            let list: SshKeyList = self
                .api
                .get(&format!("/ssh_keys?per_page=50&page={}", page))
                .await?;
            keys.extend(list.ssh_keys);
            match list.meta.and_then(|m| m.pagination.next_page) {
                Some(next) => page = next,
                None => break,
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl ComputeProvider for HetznerProvider {
    fn name(&self) -> &str {
        "hetzner"
    }

    async fn create_instance(&self, req: &CreateRequest) -> Result<ProviderInstance> {
        let image = if req.image.is_empty() {
            self.default_image.as_str()
        } else {
            req.image.as_str()
        };
        let body = CreateServer {
            name: &req.name,
            server_type: &req.size,
            location: &req.region,
            image,
            ssh_keys: vec![parse_id("ssh key", &req.ssh_key_id)?],
            labels: &req.labels,
            user_data: req.user_data.as_deref(),
            start_after_create: true,
        };

        let created: ServerEnvelope = self.api.post("/servers", &body).await?;
        info!(
            "Hetzner server {} created (id {})",
            created.server.name, created.server.id
        );
        Ok(created.server.into())
    }

    async fn get_instance(&self, provider_id: &str) -> Result<ProviderInstance> {
        let id = parse_id("server", provider_id)?;
        match self.api.get::<ServerEnvelope>(&format!("/servers/{}", id)).await {
            Ok(env) => Ok(env.server.into()),
            Err(e) if e.is_not_found() => Err(Error::not_found("server", provider_id)),
            Err(e) => Err(e),
        }
    }

    async fn delete_instance(&self, provider_id: &str) -> Result<DeleteOutcome> {
        let id = parse_id("server", provider_id)?;
        match self.api.delete(&format!("/servers/{}", id)).await {
            Ok(()) => {
                info!("Hetzner server {} deleted", id);
                Ok(DeleteOutcome::Deleted)
            }
            Err(e) if e.is_not_found() => {
                debug!("Hetzner server {} already gone", id);
                Ok(DeleteOutcome::AlreadyGone)
            }
            Err(e) => Err(e),
        }
    }

    async fn power_action(&self, provider_id: &str, action: PowerAction) -> Result<()> {
        let id = parse_id("server", provider_id)?;
        let verb = match action {
            PowerAction::Off => "poweroff",
            PowerAction::On => "poweron",
            PowerAction::Reboot => "reboot",
        };
        let _: serde_json::Value = self
            .api
            .post(&format!("/servers/{}/actions/{}", id, verb), &serde_json::json!({}))
            .await?;
        info!("Hetzner server {} {}", id, verb);
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<ProviderInstance>> {
        let mut out = Vec::new();
        let mut page = 1;
        loop {
            let list: ServerList = self
                .api
                .get(&format!("/servers?per_page=50&page={}", page))
                .await?;
            out.extend(list.servers.into_iter().map(ProviderInstance::from));
            match list.meta.and_then(|m| m.pagination.next_page) {
                Some(next) => page = next,
                None => break,
            }
        }
        Ok(out)
    }

    async fn ensure_ssh_key(&self, name: &str, public_key: &str) -> Result<String> {
        if let Some(existing) = self
            .list_ssh_keys()
            .await?
            .into_iter()
            .find(|k| same_public_key(&k.public_key, public_key))
        {
            debug!("Reusing Hetzner SSH key {}", existing.id);
            return Ok(existing.id.to_string());
        }

        let created: Result<SshKeyEnvelope> = self
            .api
            .post("/ssh_keys", &CreateSshKey { name, public_key })
            .await;
        match created {
            Ok(env) => {
                info!("Registered Hetzner SSH key {} ({})", name, env.ssh_key.id);
                Ok(env.ssh_key.id.to_string())
            }
            Err(Error::Conflict(msg)) => {
                // Name taken by a different key
                warn!("SSH key name {} is taken: {}", name, msg);
                let alt = format!("{}-{}", name, chrono::Utc::now().timestamp());
                let env: SshKeyEnvelope = self
                    .api
                    .post("/ssh_keys", &CreateSshKey { name: &alt, public_key })
                    .await?;
                Ok(env.ssh_key.id.to_string())
            }
            Err(e) => Err(e),
        }
    }

    async fn catalog(&self) -> Result<Catalog> {
        let types: ServerTypeList = self.api.get("/server_types").await?;
        let locations: LocationList = self.api.get("/locations").await?;

        let sizes = types
            .server_types
            .into_iter()
            .filter(|t| !t.deprecated.unwrap_or(false))
            .map(|t| -> Result<SizeInfo> {
                let hourly_price = t
                    .prices
                    .first()
                    .map(|p| p.price_hourly.gross.parse::<f64>())
                    .transpose()
                    .map_err(|e| {
                        Error::provider(
                            ProviderErrorKind::Permanent,
                            format!("unparseable price for {}: {}", t.name, e),
                        )
                    })?
                    .unwrap_or_default();
                Ok(SizeInfo {
                    regions: t.prices.iter().map(|p| p.location.clone()).collect(),
                    name: t.name,
                    cores: t.cores,
                    memory_gb: t.memory,
                    disk_gb: t.disk,
                    hourly_price,
                    currency: "EUR".to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Catalog {
            sizes,
            regions: locations.locations.into_iter().map(|l| l.name).collect(),
        })
    }
}
