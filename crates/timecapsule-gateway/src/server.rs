//! HTTP server implementation using Axum.

use std::future::Future;
use std::sync::Arc;

use axum::response::{IntoResponse, Response};
use axum::{
    Json, Router,
    extract::State,
    routing::get,
};
use timecapsule_scheduler::{CapsuleService, ReconciliationSweep};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CapsuleService>,
    pub sweep: Arc<ReconciliationSweep>,
    /// When set, `/api/cron` requires `Authorization: Bearer <secret>`.
    pub cron_secret: Option<String>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        service: Arc<CapsuleService>,
        sweep: Arc<ReconciliationSweep>,
        cron_secret: Option<String>,
    ) -> Self {
        Self {
            service,
            sweep,
            cron_secret: cron_secret.filter(|s| !s.is_empty()),
            start_time: std::time::Instant::now(),
        }
    }
}

/// Cron auth middleware — validates the bearer token against `cron_secret`.
async fn require_cron_secret(
    State(state): State<Arc<AppState>>,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let Some(expected) = &state.cron_secret else {
        return next.run(req).await;
    };

    let presented = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    if presented == expected {
        return next.run(req).await;
    }

    tracing::warn!("🔒 Rejected cron request with missing or invalid secret");
    (
        axum::http::StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({"ok": false, "error": "Unauthorized"})),
    )
        .into_response()
}

pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    let cron = Router::new()
        .route(
            "/api/cron",
            get(super::routes::cron_sweep).post(super::routes::cron_sweep),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_cron_secret,
        ));

    let api = Router::new()
        .route("/health", get(super::routes::health_check))
        .route(
            "/api/v1/capsules",
            get(super::routes::list_capsules).post(super::routes::create_capsule),
        )
        .route(
            "/api/v1/capsules/{id}",
            get(super::routes::get_capsule)
                .put(super::routes::update_capsule)
                .patch(super::routes::update_capsule)
                .delete(super::routes::delete_capsule),
        );

    cron.merge(api)
        .layer(
            CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PUT,
                    axum::http::Method::PATCH,
                    axum::http::Method::DELETE,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .allow_origin(Any)
                .max_age(std::time::Duration::from_secs(3600)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Bind `host:port` and serve until `shutdown` resolves.
pub async fn start(
    state: AppState,
    host: &str,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Time Capsule API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
