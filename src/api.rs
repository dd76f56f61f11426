//! HTTP surface for ingestion, the dashboard, and driver control.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::driver::DriverHandle;
use crate::error::DatabaseError;
use crate::store::Database;
use crate::workflow::types::{FeedbackOutcome, MessageStatus, NewMessage};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Database>,
    /// Present when a driver runs in this process.
    pub driver: Option<DriverHandle>,
}

/// Build the router with message, feedback and driver routes.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/messages", get(list_messages).post(ingest_message))
        .route("/api/messages/{id}", get(get_message))
        .route("/api/messages/{id}/feedback", post(submit_feedback))
        .route("/api/driver/status", get(driver_status))
        .route("/api/driver/stop", post(stop_driver))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn db_error(e: DatabaseError) -> Response {
    warn!(error = %e, "Request failed on storage");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": e.to_string()})),
    )
        .into_response()
}

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": format!("{what} not found")})),
    )
        .into_response()
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "message-triage"
    }))
}

// ── Messages ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<usize>,
}

async fn list_messages(State(state): State<AppState>, Query(q): Query<ListQuery>) -> Response {
    let status = match q.status.as_deref().map(str::parse::<MessageStatus>) {
        None => None,
        Some(Ok(status)) => Some(status),
        Some(Err(e)) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": e})),
            )
                .into_response();
        }
    };
    let limit = q.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);

    match state.store.list_messages(status, limit).await {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => db_error(e),
    }
}

async fn get_message(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let message = match state.store.get_message(&id).await {
        Ok(Some(m)) => m,
        Ok(None) => return not_found("Message"),
        Err(e) => return db_error(e),
    };
    match state.store.load_checkpoint(&id).await {
        Ok(checkpoint) => Json(serde_json::json!({
            "message": message,
            "checkpoint": checkpoint,
        }))
        .into_response(),
        Err(e) => db_error(e),
    }
}

async fn ingest_message(State(state): State<AppState>, Json(body): Json<NewMessage>) -> Response {
    if body.external_id.trim().is_empty() || body.channel.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "external_id and channel are required"})),
        )
            .into_response();
    }

    match state.store.insert_message(&body).await {
        Ok(Some(id)) => {
            info!(id = %id, external_id = %body.external_id, "Message ingested");
            if let Some(driver) = &state.driver {
                driver.wake();
            }
            (
                StatusCode::CREATED,
                Json(serde_json::json!({"id": id, "duplicate": false})),
            )
                .into_response()
        }
        Ok(None) => match state.store.get_message_by_external_id(&body.external_id).await {
            Ok(existing) => (
                StatusCode::OK,
                Json(serde_json::json!({
                    "id": existing.map(|m| m.id),
                    "duplicate": true,
                })),
            )
                .into_response(),
            Err(e) => db_error(e),
        },
        Err(e) => db_error(e),
    }
}

// ── Feedback ────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct FeedbackRequest {
    reply: String,
    #[serde(default)]
    checkpoint_version: Option<i64>,
}

async fn submit_feedback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<FeedbackRequest>,
) -> Response {
    if body.reply.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "reply must not be empty"})),
        )
            .into_response();
    }

    match state
        .store
        .submit_feedback(&id, &body.reply, body.checkpoint_version)
        .await
    {
        Ok(outcome) => {
            if matches!(outcome, FeedbackOutcome::Accepted { .. })
                && let Some(driver) = &state.driver
            {
                driver.wake();
            }
            Json(outcome).into_response()
        }
        Err(e) => db_error(e),
    }
}

// ── Driver ──────────────────────────────────────────────────────────────

async fn driver_status(State(state): State<AppState>) -> Response {
    let counts = match state.store.count_by_status().await {
        Ok(counts) => counts,
        Err(e) => return db_error(e),
    };
    let mut by_status = serde_json::Map::new();
    for status in MessageStatus::ALL {
        let n = counts
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0);
        by_status.insert(status.as_str().to_string(), n.into());
    }

    let driver = match &state.driver {
        Some(handle) => serde_json::to_value(handle.status().await).unwrap_or_default(),
        None => serde_json::Value::Null,
    };

    Json(serde_json::json!({
        "driver": driver,
        "messages": by_status,
    }))
    .into_response()
}

async fn stop_driver(State(state): State<AppState>) -> Response {
    match &state.driver {
        Some(handle) => {
            info!("Driver stop requested over HTTP");
            handle.stop();
            Json(serde_json::json!({"status": "stopping"})).into_response()
        }
        None => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"error": "No driver running in this process"})),
        )
            .into_response(),
    }
}
