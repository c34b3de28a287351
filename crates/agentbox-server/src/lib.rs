pub mod config;
pub mod error;

use agentbox_common::{ContainerInfo, InstanceId, ProvisionResult, Tier};
use agentbox_manager::{DownloadLink, LeaseManager};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

pub use config::{RuntimeKind, ServerConfig, ServerConfigError};
pub use error::ApiError;

type ApiResult<T> = Result<T, ApiError>;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<LeaseManager>,
}

impl AppState {
    pub fn new(manager: Arc<LeaseManager>) -> Self {
        Self { manager }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub user_id: String,
    pub template_id: String,
    pub hours: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StopRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CleanupResponse {
    pub reclaimed_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub stale_provisioning_count: usize,
}

/// Catalog entry as shown to users.
#[derive(Debug, Serialize, Deserialize)]
pub struct TemplateView {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub tokens_per_hour: u64,
    pub required_tier: Tier,
    pub terminal_access: bool,
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        // Lease lifecycle
        .route("/api/v1/instances", post(provision_handler))
        .route("/api/v1/instances/:id", get(check_instance_handler))
        .route("/api/v1/instances/:id/stop", post(stop_instance_handler))
        .route("/api/v1/users/:user_id/instances", get(list_instances_handler))

        // Snapshots
        .route(
            "/api/v1/users/:user_id/snapshots/:template_id/download",
            get(snapshot_download_handler),
        )

        // Catalog and maintenance
        .route("/api/v1/templates", get(list_templates_handler))
        .route("/api/v1/cleanup", post(cleanup_handler))
        .route("/health", get(health_handler))

        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn provision_handler(
    State(state): State<AppState>,
    Json(req): Json<ProvisionRequest>,
) -> ApiResult<(StatusCode, Json<ProvisionResult>)> {
    info!(
        user_id = %req.user_id,
        template_id = %req.template_id,
        hours = req.hours,
        "Provision requested"
    );
    let result = state
        .manager
        .provision(&req.user_id, &req.template_id, req.hours)
        .await?;
    Ok((StatusCode::CREATED, Json(result)))
}

async fn list_instances_handler(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Vec<ContainerInfo>>> {
    Ok(Json(state.manager.list_instances(&user_id).await?))
}

async fn check_instance_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ContainerInfo>> {
    Ok(Json(state.manager.check_instance(InstanceId(id)).await?))
}

async fn stop_instance_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<StopRequest>,
) -> ApiResult<Json<ContainerInfo>> {
    info!(instance_id = %id, user_id = %req.user_id, "Stop requested");
    Ok(Json(
        state
            .manager
            .stop_instance(&req.user_id, InstanceId(id))
            .await?,
    ))
}

async fn cleanup_handler(State(state): State<AppState>) -> ApiResult<Json<CleanupResponse>> {
    let report = state.manager.cleanup_expired().await?;
    Ok(Json(CleanupResponse {
        reclaimed_count: report.reclaimed,
        failed_count: report.failed,
        skipped_count: report.skipped,
        stale_provisioning_count: report.stale_provisioning,
    }))
}

async fn snapshot_download_handler(
    State(state): State<AppState>,
    Path((user_id, template_id)): Path<(String, String)>,
) -> ApiResult<Json<DownloadLink>> {
    Ok(Json(
        state
            .manager
            .snapshot_download_url(&user_id, &template_id)
            .await?,
    ))
}

async fn list_templates_handler(State(state): State<AppState>) -> Json<Vec<TemplateView>> {
    Json(
        state
            .manager
            .templates()
            .into_iter()
            .map(|t| TemplateView {
                id: t.id,
                slug: t.slug,
                name: t.name,
                tokens_per_hour: t.tokens_per_hour,
                required_tier: t.required_tier,
                terminal_access: t.terminal_access,
            })
            .collect(),
    )
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "billing_mode": state.manager.config().billing_mode,
        "templates": state.manager.templates().len(),
    }))
}
