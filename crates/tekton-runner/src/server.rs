//! HTTP service.
//!
//! Provides endpoints for:
//! - Health checks
//! - Submitting build/deploy requests (`/run`)
//! - Workspace and app administration (`/workspace/*`, `/app/*`)
//! - External port mappings and forwards

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::error::{Result, RunnerError};
use crate::manifest;
use crate::orchestrator::Orchestrator;
use crate::portmap::ExternalPortEntry;
use crate::request::RunRequest;

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// State shared across handlers.
pub struct ServerState {
    pub orchestrator: Arc<Orchestrator>,
    /// Bearer token required by `/run`; `None` disables the check.
    pub api_key: Option<String>,
}

impl ServerState {
    pub fn new(orchestrator: Arc<Orchestrator>, api_key: Option<String>) -> Self {
        Self {
            orchestrator,
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<()> {
        let Some(key) = &self.api_key else {
            return Ok(());
        };
        if bearer_token(headers) == Some(key.as_str()) {
            Ok(())
        } else {
            Err(RunnerError::Unauthorized)
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Build the HTTP router.
pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/run", post(run_handler))
        .route("/endpoint", get(endpoint_handler))
        .route("/workspaces", get(workspaces_handler))
        .route(
            "/workspace/status",
            get(workspace_status_handler).post(workspace_status_handler),
        )
        .route(
            "/workspace/delete",
            get(workspace_delete_handler).post(workspace_delete_handler),
        )
        .route(
            "/workspace/scale",
            get(workspace_scale_handler).post(workspace_scale_handler),
        )
        .route(
            "/workspace/restart",
            get(workspace_restart_handler).post(workspace_restart_handler),
        )
        .route("/app/status", get(app_status_handler).post(app_status_handler))
        .route("/app/delete", get(app_delete_handler).post(app_delete_handler))
        .route("/app/scale", get(app_scale_handler).post(app_scale_handler))
        .route(
            "/app/restart",
            get(app_restart_handler).post(app_restart_handler),
        )
        .route(
            "/external-map",
            get(external_map_handler).post(external_map_set_handler),
        )
        .route("/external-map/delete", post(external_map_delete_handler))
        .route("/forwards", get(forwards_handler))
        .route("/hostinfo", get(hostinfo_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .map_response(|res: Response<_>| res.map(axum::body::Body::new))
                .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES)),
        )
        .with_state(state)
}

/// Start the HTTP server and run until ctrl-c.
///
/// Persisted port mappings are replayed in the background once the listener
/// is bound. Forwards are stopped on shutdown.
pub async fn run_server(state: Arc<ServerState>, addr: &str) -> anyhow::Result<()> {
    let orchestrator = Arc::clone(&state.orchestrator);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("tekton-runner listening on {addr}");

    let restorer = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        restorer.restore_forwards().await;
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    orchestrator.shutdown().await;
    info!("tekton-runner stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct RunQuery {
    dry_run: Option<String>,
}

impl RunQuery {
    fn is_dry_run(&self) -> bool {
        matches!(self.dry_run.as_deref(), Some("true" | "1"))
    }
}

/// Query parameters shared by the administrative endpoints.
#[derive(Debug, Default, Deserialize)]
struct AdminQuery {
    workspace: Option<String>,
    app: Option<String>,
    replicas: Option<String>,
}

impl AdminQuery {
    fn workspace(&self) -> Result<&str> {
        required_param(self.workspace.as_deref(), "workspace")
    }

    fn app(&self) -> Result<&str> {
        required_param(self.app.as_deref(), "app")
    }

    fn optional_app(&self) -> Option<&str> {
        self.app.as_deref().map(str::trim).filter(|a| !a.is_empty())
    }

    fn replicas(&self) -> Result<u32> {
        required_param(self.replicas.as_deref(), "replicas")?
            .parse()
            .map_err(|_| RunnerError::validation("replicas must be an integer between 0 and 100"))
    }
}

fn required_param<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| RunnerError::validation(format!("missing query parameter: {name}")))
}

/// Body of `POST /external-map`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExternalPortRequest {
    workspace: String,
    app: String,
    external_port: i64,
}

impl ExternalPortRequest {
    fn into_entry(self) -> Result<ExternalPortEntry> {
        let port = u16::try_from(self.external_port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| RunnerError::validation("external_port must be between 1 and 65535"))?;
        Ok(ExternalPortEntry::new(self.workspace, self.app, port))
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> &'static str {
    "ok"
}

async fn run_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<RunQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    state.authorize(&headers)?;
    let raw = RunRequest::from_json(&body)?;
    let plan = state.orchestrator.prepare(raw)?;

    if query.is_dry_run() {
        return Ok((
            [(header::CONTENT_TYPE, "application/yaml")],
            manifest::join(&plan.manifests),
        )
            .into_response());
    }

    let submission = state.orchestrator.submit(&plan).await?;
    let target = plan.request.target();
    if let (Some(task_run), Some(_)) = (&submission.task_run, &target) {
        state
            .orchestrator
            .spawn_completion(plan.request.clone(), task_run.clone());
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "submitted",
            "task_run": submission.task_run,
            "workspace": target.as_ref().map(|t| &t.workspace),
            "app": target.as_ref().map(|t| &t.app),
        })),
    )
        .into_response())
}

async fn endpoint_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<AdminQuery>,
) -> Result<Json<serde_json::Value>> {
    let url = state
        .orchestrator
        .endpoint(query.workspace()?, query.app()?)
        .await?;
    Ok(Json(json!({ "endpoint": url })))
}

async fn workspaces_handler(State(state): State<Arc<ServerState>>) -> Result<impl IntoResponse> {
    Ok(Json(state.orchestrator.list_workspaces().await?))
}

async fn workspace_status_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<AdminQuery>,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state.orchestrator.workspace_status(query.workspace()?).await?,
    ))
}

async fn workspace_delete_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<AdminQuery>,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state.orchestrator.delete_workspace(query.workspace()?).await?,
    ))
}

async fn workspace_scale_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<AdminQuery>,
) -> Result<Json<serde_json::Value>> {
    let workspace = query.workspace()?;
    let replicas = query.replicas()?;
    let app = query.optional_app();
    state
        .orchestrator
        .scale_workspace(workspace, app, replicas)
        .await?;
    Ok(Json(json!({
        "workspace": workspace,
        "app": app,
        "replicas": replicas,
    })))
}

async fn workspace_restart_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<AdminQuery>,
) -> Result<Json<serde_json::Value>> {
    let workspace = query.workspace()?;
    state.orchestrator.restart_workspace(workspace).await?;
    Ok(Json(json!({ "workspace": workspace, "restarted": true })))
}

async fn app_status_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<AdminQuery>,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state
            .orchestrator
            .app_status(query.workspace()?, query.app()?)
            .await?,
    ))
}

async fn app_delete_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<AdminQuery>,
) -> Result<Json<serde_json::Value>> {
    let (workspace, app) = (query.workspace()?, query.app()?);
    state.orchestrator.delete_app(workspace, app).await?;
    Ok(Json(json!({ "workspace": workspace, "app": app, "deleted": true })))
}

async fn app_scale_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<AdminQuery>,
) -> Result<Json<serde_json::Value>> {
    let (workspace, app) = (query.workspace()?, query.app()?);
    let replicas = query.replicas()?;
    state.orchestrator.scale_app(workspace, app, replicas).await?;
    Ok(Json(json!({
        "workspace": workspace,
        "app": app,
        "replicas": replicas,
    })))
}

async fn app_restart_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<AdminQuery>,
) -> Result<Json<serde_json::Value>> {
    let (workspace, app) = (query.workspace()?, query.app()?);
    state.orchestrator.restart_app(workspace, app).await?;
    Ok(Json(json!({ "workspace": workspace, "app": app, "restarted": true })))
}

async fn external_map_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.orchestrator.external_map().await)
}

async fn external_map_set_handler(
    State(state): State<Arc<ServerState>>,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let request: ExternalPortRequest = serde_json::from_slice(&body)
        .map_err(|e| RunnerError::validation(format!("invalid JSON: {e}")))?;
    let mapped = state
        .orchestrator
        .set_external_port(request.into_entry()?)
        .await?;
    Ok(Json(mapped))
}

async fn external_map_delete_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<AdminQuery>,
) -> Result<impl IntoResponse> {
    Ok(Json(
        state
            .orchestrator
            .remove_external_port(query.workspace()?, query.app()?)
            .await?,
    ))
}

async fn forwards_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.orchestrator.forwards().await)
}

async fn hostinfo_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(json!({ "host_ip": state.orchestrator.host_ip() }))
}
