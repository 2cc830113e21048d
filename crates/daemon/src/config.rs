//! Daemon configuration

use nimbus_common::retry::Backoff;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// HTTP listen address
    pub listen: String,

    /// Seconds between orphan reconciliation passes
    pub reconcile_interval_secs: u64,

    pub provisioning: ProvisioningConfig,

    pub ssh: SshConfig,

    pub terminal: TerminalConfig,

    pub certs: CertsConfig,

    pub bootstrap: BootstrapConfig,

    pub providers: ProvidersConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: nimbus_common::default_store_path(),
            listen: "127.0.0.1:8080".to_string(),
            reconcile_interval_secs: 300,
            provisioning: ProvisioningConfig::default(),
            ssh: SshConfig::default(),
            terminal: TerminalConfig::default(),
            certs: CertsConfig::default(),
            bootstrap: BootstrapConfig::default(),
            providers: ProvidersConfig::default(),
        }
    }
}

/// Instance readiness polling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// Overall readiness timeout
    pub timeout_secs: u64,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    /// Image used when the spec names none
    pub default_image: String,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            initial_backoff_secs: 2,
            max_backoff_secs: 30,
            default_image: "ubuntu-22.04".to_string(),
        }
    }
}

impl ProvisioningConfig {
    /// Polling policy: unbounded attempts, bounded by the overall timeout
    pub fn readiness_backoff(&self) -> Backoff {
        Backoff::default()
            .with_initial(Duration::from_secs(self.initial_backoff_secs))
            .with_max(Duration::from_secs(self.max_backoff_secs))
            .unbounded_attempts()
            .with_deadline(Duration::from_secs(self.timeout_secs))
    }
}

/// SSH execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
    pub port: u16,
    /// Connection attempts for transient network failures
    pub connect_attempts: u32,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    /// RSA modulus size for the shared instance key
    pub key_bits: usize,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            port: 22,
            connect_attempts: 5,
            connect_timeout_secs: 15,
            command_timeout_secs: 120,
            key_bits: 4096,
        }
    }
}

impl SshConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn connect_backoff(&self) -> Backoff {
        Backoff::attempts(self.connect_attempts).with_initial(Duration::from_secs(1))
    }
}

/// Terminal bridge settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub default_cols: u32,
    pub default_rows: u32,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 1800,
            sweep_interval_secs: 60,
            default_cols: 80,
            default_rows: 24,
        }
    }
}

/// Certificate pipeline settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertsConfig {
    pub validity_days: u32,
    /// Where the chain and key land on the instance
    pub remote_cert_path: String,
    pub remote_key_path: String,
    /// Run on the instance after the files are written
    pub reload_command: Option<String>,
    /// Cloudflare API base URL
    pub edge_endpoint: String,
}

impl Default for CertsConfig {
    fn default() -> Self {
        Self {
            validity_days: 5475,
            remote_cert_path: "/etc/nimbus/tls/origin.pem".to_string(),
            remote_key_path: "/etc/nimbus/tls/origin.key".to_string(),
            reload_command: None,
            edge_endpoint: "https://api.cloudflare.com/client/v4".to_string(),
        }
    }
}

/// Runtime bootstrap
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Shell script run once over SSH on a fresh instance
    pub script: String,
    /// Must exit 0 before the instance counts as reachable
    pub verify_command: String,
    /// Budget for the script itself
    pub timeout_secs: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            script: DEFAULT_BOOTSTRAP_SCRIPT.to_string(),
            verify_command: "kubectl get nodes".to_string(),
            timeout_secs: 900,
        }
    }
}

pub const DEFAULT_BOOTSTRAP_SCRIPT: &str = r#"set -eu
export DEBIAN_FRONTEND=noninteractive
if ! command -v k3s >/dev/null 2>&1; then
  curl -sfL https://get.k3s.io | INSTALL_K3S_EXEC="--write-kubeconfig-mode 644" sh -
fi
if ! command -v helm >/dev/null 2>&1; then
  curl -fsSL https://raw.githubusercontent.com/helm/helm/main/scripts/get-helm-3 | bash
fi
mkdir -p /root/.kube
cp /etc/rancher/k3s/k3s.yaml /root/.kube/config
"#;

/// Provider selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub default: String,
    pub enabled: Vec<String>,
    pub hetzner_endpoint: Option<String>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            default: "simulated".to_string(),
            enabled: vec!["simulated".to_string()],
            hetzner_endpoint: None,
        }
    }
}

/// Secrets, read from the environment only
#[derive(Clone, Default)]
pub struct Secrets {
    /// Token every persisted secret is sealed under
    pub sealing_key: String,
    pub jwt_secret: String,
    pub hcloud_token: Option<String>,
    pub cloudflare_token: Option<String>,
}

impl Secrets {
    pub fn from_env() -> anyhow::Result<Self> {
        let required = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| anyhow::anyhow!("{} must be set", name))
        };
        let optional = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        Ok(Self {
            sealing_key: required("NIMBUS_SECRET_KEY")?,
            jwt_secret: required("NIMBUS_JWT_SECRET")?,
            hcloud_token: optional("HCLOUD_TOKEN"),
            cloudflare_token: optional("CLOUDFLARE_API_TOKEN"),
        })
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("hcloud_token", &self.hcloud_token.is_some())
            .field("cloudflare_token", &self.cloudflare_token.is_some())
            .finish_non_exhaustive()
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the daemon cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        let nonzero = [
            ("provisioning.timeout_secs", self.provisioning.timeout_secs),
            (
                "provisioning.initial_backoff_secs",
                self.provisioning.initial_backoff_secs,
            ),
            ("ssh.command_timeout_secs", self.ssh.command_timeout_secs),
            ("ssh.connect_timeout_secs", self.ssh.connect_timeout_secs),
            ("terminal.idle_timeout_secs", self.terminal.idle_timeout_secs),
            ("terminal.sweep_interval_secs", self.terminal.sweep_interval_secs),
            ("reconcile_interval_secs", self.reconcile_interval_secs),
            ("bootstrap.timeout_secs", self.bootstrap.timeout_secs),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }
        if self.ssh.connect_attempts == 0 {
            anyhow::bail!("ssh.connect_attempts must be greater than zero");
        }
        if self.ssh.key_bits < 2048 {
            anyhow::bail!("ssh.key_bits must be at least 2048");
        }
        if !self.providers.enabled.contains(&self.providers.default) {
            anyhow::bail!(
                "default provider '{}' is not enabled",
                self.providers.default
            );
        }
        for name in &self.providers.enabled {
            if !matches!(name.as_str(), "simulated" | "hetzner") {
                anyhow::bail!("unknown provider '{}'", name);
            }
        }
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = DaemonConfig::default();
        config.validate().unwrap();
        assert_eq!(config.provisioning.timeout_secs, 300);
        assert_eq!(config.terminal.idle_timeout_secs, 1800);
        assert_eq!(config.certs.validity_days, 5475);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            listen = "0.0.0.0:9000"

            [ssh]
            user = "ubuntu"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.ssh.user, "ubuntu");
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.providers.default, "simulated");
    }

    #[test]
    fn test_validation_failures() {
        let mut config = DaemonConfig::default();
        config.provisioning.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.providers.default = "hetzner".into();
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.providers.enabled.push("aws".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/config.toml");
        let mut config = DaemonConfig::default();
        config.reconcile_interval_secs = 42;
        config.save(&path).unwrap();

        let loaded = DaemonConfig::load(&path).unwrap();
        assert_eq!(loaded.reconcile_interval_secs, 42);
        assert!(DaemonConfig::load(&tmp.path().join("missing.toml")).is_ok());
    }

    #[test]
    fn test_readiness_backoff_is_bounded() {
        let backoff = ProvisioningConfig::default().readiness_backoff();
        assert_eq!(backoff.deadline, Some(Duration::from_secs(300)));
        assert_eq!(backoff.max, Duration::from_secs(30));
        assert!(backoff.max_attempts.is_none());
    }
}
