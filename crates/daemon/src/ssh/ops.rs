//! Operations layered on remote command execution
//!
//! Each operation issues one shell command and parses its output into a
//! typed result. Parsers are plain functions so they can be tested without
//! a connection.

use super::{CommandRunner, ExecOutput};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use nimbus_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

const HEREDOC: &str = "NIMBUS_EOF";

/// Quote `value` for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn heredoc_body(content: &str) -> Result<&str> {
    if content.lines().any(|l| l.trim() == HEREDOC) {
        return Err(Error::Validation(format!(
            "content may not contain a line reading {}",
            HEREDOC
        )));
    }
    Ok(content.trim_end_matches('\n'))
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub name: String,
    pub ready: bool,
}

/// Structured health of one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub disk: Option<DiskUsage>,
    pub memory: Option<MemoryUsage>,
    /// `systemctl is-active` output for the runtime unit
    pub runtime_status: String,
    pub nodes: Vec<NodeStatus>,
    pub healthy: bool,
    pub checked_at: i64,
}

const HEALTH_SCRIPT: &str = "echo ==DISK==; df -P -B1 / | tail -n 1; \
echo ==MEM==; free -b | awk '/^Mem:/ {print $2, $3, $7}'; \
echo ==RUNTIME==; systemctl is-active k3s 2>/dev/null || true; \
echo ==NODES==; kubectl get nodes --no-headers 2>/dev/null || true";

/// Probe disk, memory, runtime daemon and cluster nodes
pub async fn health_check(conn: &dyn CommandRunner, timeout: Duration) -> Result<HealthReport> {
    let out = conn.run(HEALTH_SCRIPT, timeout).await?;
    let report = parse_health(&out.stdout);
    debug!(
        host = %conn.host(),
        healthy = report.healthy,
        "Health check complete"
    );
    Ok(report)
}

pub fn parse_health(stdout: &str) -> HealthReport {
    let mut section = "";
    let mut disk = None;
    let mut memory = None;
    let mut runtime_status = String::from("unknown");
    let mut nodes = Vec::new();

    for line in stdout.lines() {
        let line = line.trim();
        if line.starts_with("==") && line.ends_with("==") && line.len() > 4 {
            section = line;
            continue;
        }
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        match section {
            "==DISK==" if fields.len() >= 4 => {
                let num = |i: usize| fields[i].parse::<u64>().ok();
                if let (Some(total), Some(used), Some(available)) = (num(1), num(2), num(3)) {
                    disk = Some(DiskUsage {
                        total_bytes: total,
                        used_bytes: used,
                        available_bytes: available,
                    });
                }
            }
            "==MEM==" if fields.len() >= 3 => {
                let num = |i: usize| fields[i].parse::<u64>().ok();
                if let (Some(total), Some(used), Some(available)) = (num(0), num(1), num(2)) {
                    memory = Some(MemoryUsage {
                        total_bytes: total,
                        used_bytes: used,
                        available_bytes: available,
                    });
                }
            }
            "==RUNTIME==" => runtime_status = line.to_string(),
            "==NODES==" if fields.len() >= 2 => nodes.push(NodeStatus {
                name: fields[0].to_string(),
                ready: fields[1].split(',').next() == Some("Ready"),
            }),
            _ => {}
        }
    }

    let healthy = runtime_status == "active"
        && !nodes.is_empty()
        && nodes.iter().all(|n| n.ready)
        && disk.map_or(false, |d| d.available_bytes > 0);

    HealthReport {
        disk,
        memory,
        runtime_status,
        nodes,
        healthy,
        checked_at: Utc::now().timestamp(),
    }
}

// ============================================================================
// Manifests and charts
// ============================================================================

/// `kubectl apply` a manifest
pub async fn deploy_manifest(conn: &dyn CommandRunner, manifest: &str, timeout: Duration) -> Result<()> {
    if manifest.trim().is_empty() {
        return Err(Error::Validation("manifest is empty".to_string()));
    }
    let command = format!(
        "kubectl apply -f - <<'{tag}'\n{body}\n{tag}",
        tag = HEREDOC,
        body = heredoc_body(manifest)?
    );
    conn.run(&command, timeout).await?.check("kubectl apply")?;
    info!(host = %conn.host(), "Manifest applied");
    Ok(())
}

/// Helm release to install or upgrade
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartRelease {
    pub name: String,
    /// Chart reference (`repo/chart`, OCI URL or path)
    pub chart: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub values: serde_json::Value,
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Deployed,
    Failed,
    Pending,
    Unknown,
}

fn validate_name(kind: &str, value: &str) -> Result<()> {
    let ok = !value.is_empty()
        && value.len() <= 53
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-');
    if ok {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid {} '{}'", kind, value)))
    }
}

pub fn install_command(release: &ChartRelease) -> Result<String> {
    validate_name("release name", &release.name)?;
    validate_name("namespace", &release.namespace)?;
    // JSON is valid YAML, so helm reads the values file as-is
    let values = if release.values.is_null() {
        "{}".to_string()
    } else {
        serde_json::to_string_pretty(&release.values)?
    };
    let version = release
        .version
        .as_deref()
        .map(|v| format!(" --version {}", shell_quote(v)))
        .unwrap_or_default();

    Ok(format!(
        "f=$(mktemp) && cat > \"$f\" <<'{tag}'\n{values}\n{tag}\n\
helm upgrade --install {name} {chart} --namespace {ns} --create-namespace{version} -f \"$f\"; \
rc=$?; rm -f \"$f\"; exit $rc",
        tag = HEREDOC,
        values = heredoc_body(&values)?,
        name = release.name,
        chart = shell_quote(&release.chart),
        ns = release.namespace,
        version = version,
    ))
}

/// `helm upgrade --install`, then report the release status
pub async fn install_or_upgrade_chart(
    conn: &dyn CommandRunner,
    release: &ChartRelease,
    timeout: Duration,
) -> Result<ReleaseStatus> {
    let install = conn.run(&install_command(release)?, timeout).await?;
    if !install.success() {
        debug!(release = %release.name, stderr = %install.stderr.trim(), "helm upgrade failed");
    }

    let status = conn
        .run(
            &format!("helm status {} -n {} -o json", release.name, release.namespace),
            timeout,
        )
        .await?;
    let result = if status.success() {
        parse_release_status(&status.stdout)
    } else if install.success() {
        ReleaseStatus::Unknown
    } else {
        ReleaseStatus::Failed
    };

    info!(release = %release.name, status = ?result, "Chart install/upgrade finished");
    Ok(result)
}

pub fn parse_release_status(json: &str) -> ReleaseStatus {
    #[derive(Deserialize)]
    struct Info {
        status: String,
    }
    #[derive(Deserialize)]
    struct Status {
        info: Info,
    }

    match serde_json::from_str::<Status>(json) {
        Ok(s) => match s.info.status.as_str() {
            "deployed" | "superseded" => ReleaseStatus::Deployed,
            "failed" => ReleaseStatus::Failed,
            other if other.starts_with("pending") => ReleaseStatus::Pending,
            _ => ReleaseStatus::Unknown,
        },
        Err(_) => ReleaseStatus::Unknown,
    }
}

/// Remove a release. Uninstalling a release that does not exist succeeds.
pub async fn uninstall_chart(
    conn: &dyn CommandRunner,
    name: &str,
    namespace: &str,
    timeout: Duration,
) -> Result<()> {
    validate_name("release name", name)?;
    validate_name("namespace", namespace)?;
    let out = conn
        .run(&format!("helm uninstall {} -n {}", name, namespace), timeout)
        .await?;
    if !out.success() && out.stderr.contains("not found") {
        debug!(release = %name, "Release already absent");
        return Ok(());
    }
    out.check("helm uninstall")?;
    info!(release = %name, "Chart uninstalled");
    Ok(())
}

// ============================================================================
// Logs
// ============================================================================

/// Which pods to read logs from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSelector {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Kubernetes label selector, e.g. `app=web`
    pub labels: String,
    #[serde(default)]
    pub tail: Option<u32>,
    /// Relative window such as `10m` or `1h`
    #[serde(default)]
    pub since: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    /// `pod/<name>/<container>` when known
    pub source: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub message: String,
}

pub fn logs_command(selector: &LogSelector) -> Result<String> {
    validate_name("namespace", &selector.namespace)?;
    if selector.labels.trim().is_empty() {
        return Err(Error::Validation("label selector is empty".to_string()));
    }
    let mut command = format!(
        "kubectl logs -n {} -l {} --timestamps --prefix --all-containers",
        selector.namespace,
        shell_quote(&selector.labels)
    );
    if let Some(tail) = selector.tail {
        command.push_str(&format!(" --tail={}", tail));
    }
    if let Some(since) = &selector.since {
        command.push_str(&format!(" --since={}", shell_quote(since)));
    }
    Ok(command)
}

pub async fn fetch_logs(
    conn: &dyn CommandRunner,
    selector: &LogSelector,
    timeout: Duration,
) -> Result<Vec<LogLine>> {
    let out = conn
        .run(&logs_command(selector)?, timeout)
        .await?
        .check("kubectl logs")?;
    Ok(out.stdout.lines().filter_map(parse_log_line).collect())
}

pub fn parse_log_line(line: &str) -> Option<LogLine> {
    if line.trim().is_empty() {
        return None;
    }
    let mut rest = line;
    let mut source = None;
    if let Some(stripped) = rest.strip_prefix('[') {
        if let Some(end) = stripped.find("] ") {
            source = Some(stripped[..end].to_string());
            rest = &stripped[end + 2..];
        }
    }

    let (timestamp, message) = match rest.split_once(' ') {
        Some((first, tail)) => match DateTime::parse_from_rfc3339(first) {
            Ok(ts) => (Some(ts.with_timezone(&Utc)), tail),
            Err(_) => (None, rest),
        },
        None => match DateTime::parse_from_rfc3339(rest) {
            Ok(ts) => (Some(ts.with_timezone(&Utc)), ""),
            Err(_) => (None, rest),
        },
    };

    Some(LogLine {
        source,
        timestamp,
        message: message.to_string(),
    })
}

// ============================================================================
// Files and bootstrap
// ============================================================================

/// Write `contents` to `path` atomically with the given octal mode
pub async fn push_file(
    conn: &dyn CommandRunner,
    path: &str,
    contents: &[u8],
    mode: u32,
    timeout: Duration,
) -> Result<()> {
    let command = push_file_command(path, contents, mode)?;
    conn.run(&command, timeout)
        .await?
        .check(&format!("write {}", path))?;
    debug!(host = %conn.host(), path = %path, "File pushed");
    Ok(())
}

pub fn push_file_command(path: &str, contents: &[u8], mode: u32) -> Result<String> {
    if !path.starts_with('/') {
        return Err(Error::Validation(format!("remote path must be absolute: {}", path)));
    }
    let dir = match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((dir, _)) => dir,
    };
    let tmp = format!("{}.tmp", path);
    Ok(format!(
        "mkdir -p {dir} && printf '%s' {data} | base64 -d > {tmp} && chmod {mode:o} {tmp} && mv {tmp} {path}",
        dir = shell_quote(dir),
        data = shell_quote(&BASE64.encode(contents)),
        tmp = shell_quote(&tmp),
        mode = mode,
        path = shell_quote(path),
    ))
}

/// Run a bootstrap script through bash
pub async fn run_script(conn: &dyn CommandRunner, script: &str, timeout: Duration) -> Result<ExecOutput> {
    let command = format!(
        "bash -s <<'{tag}'\n{body}\n{tag}",
        tag = HEREDOC,
        body = heredoc_body(script)?
    );
    conn.run(&command, timeout).await
}
