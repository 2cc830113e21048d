//! HTTP and WebSocket surface
//!
//! A thin JSON layer over the daemon. Every `/api` route requires a token;
//! `/health` is public.

use crate::auth::{require_auth, AuthUser};
use crate::certs::{CertificateManager, DomainStatus};
use crate::ssh::ops::{self, ChartRelease, HealthReport, LogLine, LogSelector, ReleaseStatus};
use crate::terminal::{bridge, SessionRecord};
use crate::Daemon;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{middleware, Json, Router};
use futures::StreamExt;
use nimbus_common::{Error, ErrorBody, ErrorKind, InstanceRecord, InstanceSpec, PowerAction};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Error rendered as `{kind, message, detail}` with a status derived from the kind
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation | ErrorKind::InvalidSpec => StatusCode::BAD_REQUEST,
        ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::ProviderTransient => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::ProviderPermanent
        | ErrorKind::Encryption
        | ErrorKind::Ssh
        | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody::from(&self.0);
        let status = status_for(body.kind);
        if status.is_server_error() {
            error!(kind = %body.kind, "Request failed: {}", self.0);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

type AppState = Arc<Daemon>;

pub fn router(daemon: Arc<Daemon>) -> Router {
    let api = Router::new()
        // Instances
        .route("/api/instances", get(list_instances).post(create_instance))
        .route("/api/instances/:id", get(get_instance).delete(delete_instance))
        .route("/api/instances/:id/power", post(power_instance))
        .route("/api/instances/:id/retry", post(retry_instance))
        .route("/api/instances/:id/health", get(instance_health))
        .route("/api/instances/:id/logs", get(instance_logs))
        .route("/api/instances/:id/manifests", post(apply_manifest))
        .route("/api/instances/:id/charts", post(install_chart))
        .route("/api/instances/:id/charts/:namespace/:name", delete(uninstall_chart))
        // Domains
        .route("/api/domains", get(list_domains))
        .route(
            "/api/domains/:domain",
            get(get_domain).put(configure_domain).delete(remove_domain),
        )
        // Terminals
        .route("/api/terminal/sessions", get(list_sessions).post(open_session))
        .route("/api/terminal/sessions/:id", delete(close_session))
        .route("/api/terminal/sessions/:id/ws", get(terminal_socket))
        .layer(middleware::from_fn_with_state(daemon.auth().clone(), require_auth));

    Router::new()
        .route("/health", get(health_handler))
        .merge(api)
        .fallback(not_found_handler)
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(daemon)
}

/// Serve until the daemon's shutdown token fires
pub async fn serve(daemon: Arc<Daemon>, listener: TcpListener) -> anyhow::Result<()> {
    info!("HTTP API listening on http://{}", listener.local_addr()?);
    let shutdown = daemon.shutdown_token();
    axum::serve(listener, router(daemon))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "nimbusd",
        "version": nimbus_common::VERSION,
    }))
}

async fn not_found_handler() -> ApiError {
    ApiError(Error::not_found("route", "unknown"))
}

/// Reply to a create or retry: the workflow continues in the background
#[derive(Debug, Serialize, Deserialize)]
pub struct Accepted {
    pub id: String,
    pub name: String,
}

async fn list_instances(State(d): State<AppState>) -> ApiResult<Json<Vec<InstanceRecord>>> {
    Ok(Json(d.vps().list_vps()?))
}

async fn create_instance(
    State(d): State<AppState>,
    Json(spec): Json<InstanceSpec>,
) -> ApiResult<(StatusCode, Json<Accepted>)> {
    let handle = d.vps().create_vps(spec).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            id: handle.id,
            name: handle.name,
        }),
    ))
}

async fn get_instance(State(d): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<InstanceRecord>> {
    Ok(Json(d.vps().get_vps(&id)?))
}

async fn delete_instance(State(d): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    d.vps().delete_vps(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct PowerRequest {
    pub action: PowerAction,
}

async fn power_instance(
    State(d): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PowerRequest>,
) -> ApiResult<Json<InstanceRecord>> {
    Ok(Json(d.vps().power_action(&id, req.action).await?))
}

async fn retry_instance(
    State(d): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Accepted>)> {
    let handle = d.vps().retry_vps(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            id: handle.id,
            name: handle.name,
        }),
    ))
}

async fn instance_health(State(d): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<HealthReport>> {
    let remote = d.vps().remote_for(&id)?;
    let timeout = d.config().ssh.command_timeout();
    Ok(Json(ops::health_check(&remote, timeout).await?))
}

async fn instance_logs(
    State(d): State<AppState>,
    Path(id): Path<String>,
    Query(selector): Query<LogSelector>,
) -> ApiResult<Json<Vec<LogLine>>> {
    let remote = d.vps().remote_for(&id)?;
    let timeout = d.config().ssh.command_timeout();
    Ok(Json(ops::fetch_logs(&remote, &selector, timeout).await?))
}

#[derive(Debug, Deserialize)]
pub struct ManifestRequest {
    pub manifest: String,
}

async fn apply_manifest(
    State(d): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ManifestRequest>,
) -> ApiResult<StatusCode> {
    let remote = d.vps().remote_for(&id)?;
    ops::deploy_manifest(&remote, &req.manifest, d.config().ssh.command_timeout()).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChartResponse {
    pub release: String,
    pub status: ReleaseStatus,
}

async fn install_chart(
    State(d): State<AppState>,
    Path(id): Path<String>,
    Json(release): Json<ChartRelease>,
) -> ApiResult<Json<ChartResponse>> {
    let remote = d.vps().remote_for(&id)?;
    let status =
        ops::install_or_upgrade_chart(&remote, &release, d.config().ssh.command_timeout()).await?;
    Ok(Json(ChartResponse {
        release: release.name,
        status,
    }))
}

async fn uninstall_chart(
    State(d): State<AppState>,
    Path((id, namespace, name)): Path<(String, String, String)>,
) -> ApiResult<StatusCode> {
    let remote = d.vps().remote_for(&id)?;
    ops::uninstall_chart(&remote, &name, &namespace, d.config().ssh.command_timeout()).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn certs(d: &Daemon) -> ApiResult<&Arc<CertificateManager>> {
    d.certs().ok_or_else(|| {
        ApiError(Error::Validation(
            "domain configuration is disabled: no edge API configured".to_string(),
        ))
    })
}

async fn list_domains(State(d): State<AppState>) -> ApiResult<Json<Vec<DomainStatus>>> {
    Ok(Json(certs(&d)?.list_domains()?))
}

async fn get_domain(State(d): State<AppState>, Path(domain): Path<String>) -> ApiResult<Json<DomainStatus>> {
    certs(&d)?
        .get_domain(&domain)?
        .map(Json)
        .ok_or_else(|| ApiError(Error::not_found("domain", domain)))
}

#[derive(Debug, Deserialize)]
pub struct ConfigureDomainRequest {
    pub instance_ip: String,
}

async fn configure_domain(
    State(d): State<AppState>,
    Path(domain): Path<String>,
    Json(req): Json<ConfigureDomainRequest>,
) -> ApiResult<Json<DomainStatus>> {
    Ok(Json(
        certs(&d)?
            .configure_domain_ssl(&domain, &req.instance_ip)
            .await?,
    ))
}

async fn remove_domain(State(d): State<AppState>, Path(domain): Path<String>) -> ApiResult<StatusCode> {
    certs(&d)?.remove_domain_configuration(&domain).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct OpenSessionRequest {
    pub instance_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    pub session_id: String,
    pub websocket_path: String,
}

async fn open_session(
    State(d): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(req): Json<OpenSessionRequest>,
) -> ApiResult<(StatusCode, Json<OpenSessionResponse>)> {
    let record = d.terminals().open_session(&req.instance_id, &user)?;
    Ok((
        StatusCode::CREATED,
        Json(OpenSessionResponse {
            websocket_path: format!("/api/terminal/sessions/{}/ws", record.id),
            session_id: record.id,
        }),
    ))
}

async fn list_sessions(
    State(d): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Json<Vec<SessionRecord>> {
    Json(d.terminals().list_for(&user))
}

async fn close_session(
    State(d): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    d.terminals().close_owned(&id, &user)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Ownership is checked before the upgrade; the PTY is attached after it
async fn terminal_socket(
    State(d): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let session = d.terminals().authorize(&id, &user)?;
    let terminals = d.terminals().clone();
    Ok(ws.on_upgrade(move |socket| async move {
        let (ws_tx, ws_rx) = socket.split();
        bridge::serve(&terminals, session, ws_tx, ws_rx).await;
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorKind::Validation), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(ErrorKind::Authentication), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::QuotaExceeded), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(status_for(ErrorKind::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(ErrorKind::ProviderTransient),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(ErrorKind::Encryption), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
