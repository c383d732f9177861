//! Health check handlers for stream services.
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`)
//! - Stream monitoring (`/stream/info`)
//! - Prometheus metrics (`/metrics`)
//! - DLQ admin endpoints (`/admin/dlq/*`)

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use redis::aio::ConnectionManager;
use redis::streams::StreamInfoGroupsReply;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::delayed_set_name;
use crate::dlq::DlqManager;
use crate::metrics;
use crate::registry::StreamDef;

type ApiError = (StatusCode, Json<Value>);

fn internal_error(e: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub redis: ConnectionManager,
    pub app_name: String,
    pub app_version: String,
    pub stream_name: String,
    pub dlq_stream_name: String,
}

impl HealthState {
    pub fn new(
        redis: ConnectionManager,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
        stream_name: impl Into<String>,
        dlq_stream_name: impl Into<String>,
    ) -> Self {
        Self {
            redis,
            app_name: app_name.into(),
            app_version: app_version.into(),
            stream_name: stream_name.into(),
            dlq_stream_name: dlq_stream_name.into(),
        }
    }

    pub fn from_stream_def<S: StreamDef>(
        redis: ConnectionManager,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self::new(redis, app_name, app_version, S::STREAM_NAME, S::DLQ_STREAM)
    }

    pub fn dlq_manager(&self) -> DlqManager {
        DlqManager::new(self.redis.clone(), &self.stream_name, &self.dlq_stream_name)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Always OK while the process is serving
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// OK only when Redis answers PING
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mut conn = state.redis.clone();

    let result: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;

    match result {
        Ok(response) if response == "PONG" => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": { "redis": "ok" }
            })),
        )),
        Ok(response) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "redis": format!("unexpected response: {}", response) }
            })),
        )),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "redis": format!("error: {}", e) }
            })),
        )),
    }
}

/// Queue depth plus per-group pending counts
pub async fn stream_info_handler(
    State(state): State<HealthState>,
) -> Result<Json<Value>, ApiError> {
    let mut conn = state.redis.clone();

    let length: i64 = redis::cmd("XLEN")
        .arg(&state.stream_name)
        .query_async(&mut conn)
        .await
        .map_err(internal_error)?;

    let dlq_length: i64 = redis::cmd("XLEN")
        .arg(&state.dlq_stream_name)
        .query_async(&mut conn)
        .await
        .map_err(internal_error)?;

    let delayed_length: i64 = redis::cmd("ZCARD")
        .arg(delayed_set_name(&state.stream_name))
        .query_async(&mut conn)
        .await
        .map_err(internal_error)?;

    // XINFO GROUPS errors while the stream does not exist yet
    let groups: Vec<Value> = redis::cmd("XINFO")
        .arg("GROUPS")
        .arg(&state.stream_name)
        .query_async::<StreamInfoGroupsReply>(&mut conn)
        .await
        .map(|reply| {
            reply
                .groups
                .into_iter()
                .map(|g| {
                    json!({
                        "name": g.name,
                        "consumers": g.consumers,
                        "pending": g.pending,
                        "last_delivered_id": g.last_delivered_id,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Json(json!({
        "stream": state.stream_name,
        "length": length,
        "dlq_stream": state.dlq_stream_name,
        "dlq_length": dlq_length,
        "delayed_length": delayed_length,
        "groups": groups,
    })))
}

/// Prometheus text format
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::get_metrics_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        )
            .into_response(),
    }
}

// ============================================================================
// DLQ Admin Handlers
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DlqListParams {
    /// Capped at 100
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    10
}

#[derive(Debug, Deserialize)]
pub struct DlqReprocessParams {
    /// Capped at 100
    #[serde(default = "default_limit")]
    pub count: usize,
}

/// `GET /admin/dlq/stats`
pub async fn dlq_stats_handler(
    State(state): State<HealthState>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = state.dlq_manager().stats().await.map_err(internal_error)?;
    Ok(Json(stats))
}

/// `GET /admin/dlq/messages?limit=10&offset=0`
pub async fn dlq_list_handler(
    State(state): State<HealthState>,
    Query(params): Query<DlqListParams>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = params.limit.min(100);

    let messages = state
        .dlq_manager()
        .list_messages(limit, params.offset)
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({
        "count": messages.len(),
        "messages": messages,
        "limit": limit,
        "offset": params.offset,
    })))
}

/// `POST /admin/dlq/reprocess/{id}`
pub async fn dlq_reprocess_one_handler(
    State(state): State<HealthState>,
    Path(message_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.dlq_manager().reprocess_message(&message_id).await {
        Ok(true) => Ok(Json(json!({
            "success": true,
            "message_id": message_id,
            "message": "Message requeued for processing"
        }))),
        Ok(false) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "Message not found in DLQ",
                "message_id": message_id
            })),
        )),
        Err(e) => Err(internal_error(e)),
    }
}

/// `POST /admin/dlq/reprocess?count=10`
pub async fn dlq_reprocess_batch_handler(
    State(state): State<HealthState>,
    Query(params): Query<DlqReprocessParams>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .dlq_manager()
        .reprocess_batch(params.count.min(100))
        .await
        .map_err(internal_error)?;
    Ok(Json(result))
}

/// `DELETE /admin/dlq/{id}`
pub async fn dlq_archive_one_handler(
    State(state): State<HealthState>,
    Path(message_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.dlq_manager().archive_message(&message_id).await {
        Ok(true) => Ok(Json(json!({
            "success": true,
            "message_id": message_id,
            "message": "Message archived (deleted from DLQ)"
        }))),
        Ok(false) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "Message not found in DLQ",
                "message_id": message_id
            })),
        )),
        Err(e) => Err(internal_error(e)),
    }
}

/// `DELETE /admin/dlq/all`
pub async fn dlq_archive_all_handler(
    State(state): State<HealthState>,
) -> Result<impl IntoResponse, ApiError> {
    let count = state
        .dlq_manager()
        .archive_all()
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({
        "success": true,
        "archived_count": count,
        "message": "All DLQ messages archived"
    })))
}

/// Liveness, readiness, stream info and metrics
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/stream/info", get(stream_info_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// DLQ admin endpoints
pub fn dlq_admin_router(state: HealthState) -> axum::Router {
    use axum::routing::{delete, get, post};

    axum::Router::new()
        .route("/admin/dlq/stats", get(dlq_stats_handler))
        .route("/admin/dlq/messages", get(dlq_list_handler))
        .route("/admin/dlq/reprocess/{id}", post(dlq_reprocess_one_handler))
        .route("/admin/dlq/reprocess", post(dlq_reprocess_batch_handler))
        .route("/admin/dlq/all", delete(dlq_archive_all_handler))
        .route("/admin/dlq/{id}", delete(dlq_archive_one_handler))
        .with_state(state)
}

/// [`health_router`] merged with [`dlq_admin_router`]
pub fn full_admin_router(state: HealthState) -> axum::Router {
    health_router(state.clone()).merge(dlq_admin_router(state))
}
