//! HTTP surface: app registration, upgrade control, agent status reports and
//! the agent WebSocket.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::builder::PlanBuilder;
use crate::engine::{Engine, StepUpdate};
use crate::error::{UpgradeError, find_upgrade_error};
use crate::health::{self, HealthState};
use crate::metrics::metrics_handler;
use crate::plan::StepStatus;
use crate::registry::{Registry, socket};
use crate::store::{InstalledApp, License, Store};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub builder: Arc<PlanBuilder>,
    pub engine: Arc<Engine>,
    pub registry: Arc<Registry>,
}

/// Error wrapper that maps [`UpgradeError`] kinds onto HTTP statuses.
pub struct ApiError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        if let Some(err) = find_upgrade_error(&self.0) {
            return match err {
                UpgradeError::AppNotFound(_)
                | UpgradeError::PlanNotFound { .. }
                | UpgradeError::StepNotFound(_) => StatusCode::NOT_FOUND,
                UpgradeError::PlanInProgress { .. } | UpgradeError::InvalidTransition { .. } => {
                    StatusCode::CONFLICT
                }
                UpgradeError::MissingLicense(_) => StatusCode::BAD_REQUEST,
                UpgradeError::NoConnectedAgent | UpgradeError::NodeNotConnected(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                UpgradeError::VersionResolution(_) => StatusCode::BAD_GATEWAY,
                UpgradeError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                UpgradeError::WriteFailed { .. }
                | UpgradeError::StepFailed { .. }
                | UpgradeError::InvalidExtensions { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            };
        }
        // Step output that does not match the step's type.
        if self.0.chain().any(|e| e.is::<serde_json::Error>()) {
            return StatusCode::BAD_REQUEST;
        }
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = format!("{:#}", self.0);
        if status.is_server_error() {
            warn!(status = status.as_u16(), error = %message, "Request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Body of `PUT /api/v1/app/{slug}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAppRequest {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_airgap: bool,
    #[serde(default)]
    pub license: Option<License>,
}

/// Body of `POST /api/v1/app/{slug}/upgrade`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeRequest {
    pub version_label: String,
    #[serde(default)]
    pub update_cursor: String,
    #[serde(default, rename = "channelID")]
    pub channel_id: String,
}

/// Body of a step status report.
#[derive(Debug, Deserialize)]
pub struct StatusReport {
    pub status: StepStatus,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub output: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentQuery {
    pub node_name: Option<String>,
    pub version: Option<String>,
}

async fn require_app(store: &dyn Store, slug: &str) -> Result<InstalledApp> {
    store
        .get_app_by_slug(slug)
        .await
        .context("Failed to load app")?
        .ok_or_else(|| UpgradeError::AppNotFound(slug.to_string()).into())
}

pub async fn register_app(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(req): Json<RegisterAppRequest>,
) -> Result<Json<InstalledApp>, ApiError> {
    let app = InstalledApp {
        id: req.id,
        slug,
        name: req.name,
        is_airgap: req.is_airgap,
        license: req.license,
    };
    state
        .store
        .upsert_app(&app)
        .await
        .context("Failed to save app")?;
    info!(app = %app.slug, app_id = %app.id, airgap = app.is_airgap, "Registered app");
    Ok(Json(app))
}

/// Plan an upgrade, persist it, and start executing it in the background.
pub async fn start_upgrade(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(req): Json<UpgradeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let app = require_app(state.store.as_ref(), &slug).await?;
    let plan = state
        .builder
        .create_plan(&app, &req.version_label, &req.update_cursor, &req.channel_id)
        .await?;

    info!(
        app = %app.slug,
        version_label = %plan.version_label,
        plan = %plan.id,
        steps = plan.steps.len(),
        "Starting upgrade"
    );
    drop(state.engine.spawn(plan.clone()));
    Ok((StatusCode::ACCEPTED, Json(plan)))
}

pub async fn current_plan(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let app = require_app(state.store.as_ref(), &slug).await?;
    let plan = state
        .store
        .get_current_plan(&app.id)
        .await
        .context("Failed to load current plan")?;
    Ok(match plan {
        Some(plan) => Json(plan).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("No plan for app {slug}") })),
        )
            .into_response(),
    })
}

pub async fn report_step_status(
    State(state): State<AppState>,
    Path((app_slug, version_label, step_id)): Path<(String, String, String)>,
    Json(report): Json<StatusReport>,
) -> Result<impl IntoResponse, ApiError> {
    let mut update = StepUpdate::new(report.status).description(report.description);
    if let Some(output) = report.output {
        update = update.output(output);
    }
    state
        .engine
        .update_step(&app_slug, &version_label, &step_id, update)
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn list_clients(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.client_infos())
}

/// Upgrade an agent connection. Both query parameters are required.
pub async fn agent_socket(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let node_name = query.node_name.unwrap_or_default();
    let version = query.version.unwrap_or_default();
    if node_name.is_empty() || version.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "nodeName and version are required" })),
        )
            .into_response();
    }

    match ws {
        Ok(ws) => {
            let registry = state.registry;
            ws.on_upgrade(move |socket| socket::serve(registry, socket, node_name, version))
        }
        Err(rejection) => rejection.into_response(),
    }
}

/// Full router: API, agent socket, metrics and health probes.
pub fn router(
    state: AppState,
    health: HealthState,
    metrics_registry: Arc<prometheus_client::registry::Registry>,
) -> Router {
    let metrics = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics_registry);

    Router::new()
        .route("/api/v1/app/{slug}", put(register_app))
        .route("/api/v1/app/{slug}/upgrade", post(start_upgrade))
        .route("/api/v1/app/{slug}/plan/current", get(current_plan))
        .route(
            "/api/v1/app/{app_slug}/plan/{version_label}/step/{step_id}/status",
            post(report_step_status),
        )
        .route("/api/v1/ec/clients", get(list_clients))
        .route("/ec-ws", get(agent_socket))
        .with_state(state)
        .merge(metrics)
        .merge(health::router(health))
}

/// Serve `app` on `port` until `shutdown` is cancelled.
pub async fn serve(port: u16, app: Router, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .with_context(|| format!("Failed to bind port {port}"))?;
    info!(port, "HTTP server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server error")?;
    Ok(())
}
