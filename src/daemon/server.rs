// HTTP control API over a unix socket or TCP

use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::daemon::config::ListenAddr;
use crate::daemon::manager::{BridgeRequest, HydraManager, InstanceInfo, InstanceStatus, PurgeReport};
use crate::icc::network::port_mapping::PortMapping;
use crate::icc::network::veth::BridgeAttachment;
use crate::sync::error::BridgerError;
use crate::utils::constants::VERSION;

impl BridgerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            BridgerError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            BridgerError::PrivilegedModeDisabled => StatusCode::FORBIDDEN,
            BridgerError::UnknownScope { .. } => StatusCode::NOT_FOUND,
            BridgerError::ContainerNotReady { .. } | BridgerError::ScopeNotRunning { .. } => StatusCode::CONFLICT,
            BridgerError::ResourceExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
            BridgerError::DaemonStartTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            BridgerError::KernelOperationFailed { .. } | BridgerError::Runtime { .. } | BridgerError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for BridgerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), "Request failed: {}", self);
        } else {
            tracing::debug!(kind = self.kind(), "Request rejected: {}", self);
        }
        let body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, BridgerError>;

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, BridgerError> {
    payload
        .map(|Json(v)| v)
        .map_err(|rejection| BridgerError::invalid(rejection.body_text()))
}

#[derive(Debug, Deserialize)]
struct CreateInstanceBody {
    scope_id: String,
}

#[derive(Debug, Deserialize)]
struct BridgeDesktopBody {
    scope_id: String,
    desktop_container_id: String,
    #[serde(default)]
    privileged: bool,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    active_instances: usize,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct DeletedResponse {
    scope_id: String,
    deleted: bool,
}

#[derive(Debug, Serialize)]
struct DnsRestartResponse {
    scope_id: String,
    dns: String,
}

#[derive(Debug, Serialize)]
struct PortsResponse {
    scope_id: String,
    forwarded_ports: Vec<PortMapping>,
}

pub fn router(manager: Arc<HydraManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/instances", get(list_instances).post(create_instance))
        .route("/instances/{scope_id}", axum::routing::delete(delete_instance))
        .route("/instances/{scope_id}/status", get(instance_status))
        .route("/instances/{scope_id}/purge", post(purge_instance))
        .route("/instances/{scope_id}/dns/restart", post(restart_dns))
        .route("/instances/{scope_id}/ports/refresh", post(refresh_ports))
        .route("/bridge-desktop", post(bridge_desktop))
        .with_state(manager)
}

async fn health(State(manager): State<Arc<HydraManager>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_instances: manager.active_instances(),
        version: VERSION,
    })
}

async fn list_instances(State(manager): State<Arc<HydraManager>>) -> Json<Vec<InstanceStatus>> {
    Json(manager.list().await)
}

async fn create_instance(
    State(manager): State<Arc<HydraManager>>,
    payload: Result<Json<CreateInstanceBody>, JsonRejection>,
) -> ApiResult<InstanceInfo> {
    let req = body(payload)?;
    Ok(Json(manager.create_instance(&req.scope_id).await?))
}

async fn bridge_desktop(
    State(manager): State<Arc<HydraManager>>,
    payload: Result<Json<BridgeDesktopBody>, JsonRejection>,
) -> ApiResult<BridgeAttachment> {
    let req = body(payload)?;
    let request = BridgeRequest {
        scope_id: req.scope_id,
        desktop_container_id: req.desktop_container_id,
        privileged: req.privileged,
        timeout: req.timeout_ms.map(Duration::from_millis),
    };
    Ok(Json(manager.bridge_desktop(&request).await?))
}

async fn instance_status(
    State(manager): State<Arc<HydraManager>>,
    Path(scope_id): Path<String>,
) -> ApiResult<InstanceStatus> {
    Ok(Json(manager.status(&scope_id).await?))
}

async fn delete_instance(
    State(manager): State<Arc<HydraManager>>,
    Path(scope_id): Path<String>,
) -> ApiResult<DeletedResponse> {
    manager.delete_instance(&scope_id).await?;
    Ok(Json(DeletedResponse {
        scope_id,
        deleted: true,
    }))
}

async fn purge_instance(
    State(manager): State<Arc<HydraManager>>,
    Path(scope_id): Path<String>,
) -> ApiResult<PurgeReport> {
    Ok(Json(manager.purge_instance(&scope_id).await?))
}

async fn restart_dns(
    State(manager): State<Arc<HydraManager>>,
    Path(scope_id): Path<String>,
) -> ApiResult<DnsRestartResponse> {
    let dns = manager.restart_dns(&scope_id).await?;
    Ok(Json(DnsRestartResponse { scope_id, dns }))
}

async fn refresh_ports(
    State(manager): State<Arc<HydraManager>>,
    Path(scope_id): Path<String>,
) -> ApiResult<PortsResponse> {
    let forwarded_ports = manager.refresh_ports(&scope_id).await?;
    Ok(Json(PortsResponse {
        scope_id,
        forwarded_ports,
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown requested, leaving tenant networks in place");
}

/// Serve the API until SIGINT/SIGTERM. Instances stay up; the next start
/// recovers them from the kernel.
pub async fn serve(manager: Arc<HydraManager>, listen: &ListenAddr) -> std::io::Result<()> {
    let app = router(manager);
    match listen {
        ListenAddr::Tcp(addr) => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::info!("Control API listening on {}", addr);
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await
        }
        ListenAddr::Unix(path) => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::debug!(socket = %path.display(), "Removed stale API socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            let listener = tokio::net::UnixListener::bind(path)?;
            tracing::info!("Control API listening on unix:{}", path.display());
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await;
            if let Err(e) = tokio::fs::remove_file(path).await {
                tracing::debug!(socket = %path.display(), "API socket not removed: {}", e);
            }
            served
        }
    }
}
