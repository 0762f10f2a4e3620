//! API route handlers for the gateway.
//!
//! Every response body carries `ok`; failures add an `error` string and map
//! the capsule error kind onto an HTTP status.

use axum::http::StatusCode;
use axum::{
    Json,
    extract::{Path, State},
};
use chrono::Utc;
use std::sync::Arc;
use timecapsule_core::CapsuleError;
use timecapsule_scheduler::{CapsuleUpdate, NewCapsule};

use super::server::AppState;

type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn error_response(e: &CapsuleError) -> ApiResponse {
    let status = match e {
        CapsuleError::NotFound(_) => StatusCode::NOT_FOUND,
        CapsuleError::Validation(_) => StatusCode::BAD_REQUEST,
        CapsuleError::ConcurrencyConflict(_) => StatusCode::CONFLICT,
        CapsuleError::Delivery(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("💥 API error: {e}");
    }
    (
        status,
        Json(serde_json::json!({"ok": false, "error": e.to_string(), "kind": e.kind()})),
    )
}

fn bad_body(e: serde_json::Error) -> ApiResponse {
    error_response(&CapsuleError::Validation(format!("invalid request body: {e}")))
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "timecapsule",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "armed_timers": state.service.scheduler().armed_count(),
    }))
}

/// Reconciliation trigger, meant for an external cron.
pub async fn cron_sweep(State(state): State<Arc<AppState>>) -> ApiResponse {
    match state.sweep.sweep(Utc::now()).await {
        Ok(report) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "ok": true,
                "processed": report.processed,
                "successes": report.successes,
                "failures": report.failures,
            })),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn list_capsules(State(state): State<Arc<AppState>>) -> ApiResponse {
    match state.service.list().await {
        Ok(capsules) => (
            StatusCode::OK,
            Json(serde_json::json!({"ok": true, "capsules": capsules})),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn create_capsule(
    State(state): State<Arc<AppState>>,
    Json(body): Json<serde_json::Value>,
) -> ApiResponse {
    let req: NewCapsule = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => return bad_body(e),
    };
    match state.service.create(req).await {
        Ok(capsule) => (
            StatusCode::CREATED,
            Json(serde_json::json!({"ok": true, "capsule": capsule})),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn get_capsule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResponse {
    match state.service.get(&id).await {
        Ok(capsule) => (
            StatusCode::OK,
            Json(serde_json::json!({"ok": true, "capsule": capsule})),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn update_capsule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResponse {
    let req: CapsuleUpdate = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => return bad_body(e),
    };
    match state.service.update(&id, req).await {
        Ok(capsule) => (
            StatusCode::OK,
            Json(serde_json::json!({"ok": true, "capsule": capsule})),
        ),
        Err(e) => error_response(&e),
    }
}

pub async fn delete_capsule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResponse {
    match state.service.delete(&id).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"ok": true}))),
        Err(e) => error_response(&e),
    }
}
