//! Liveness plus per-class load of the dispatcher.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::{OpenApi, ToSchema};

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(paths(get_health), components(schemas(HealthResponse, BackendLoad)))]
pub struct HealthApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(get_health))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// `ok`, or `shutting_down` once the dispatcher stopped admitting jobs.
    pub status: String,
    pub version: String,
    pub backends: Vec<BackendLoad>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BackendLoad {
    pub backend_class: String,
    pub workers: usize,
    /// Admission slots: workers plus queue depth.
    pub capacity: usize,
    /// Slots held by queued, running or backing-off jobs.
    pub in_flight: usize,
    pub queued: usize,
}

/// Report whether jobs are being admitted and how loaded each class is.
///
/// Answers 503 while the dispatcher is shutting down so load balancers stop
/// routing submissions here.
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Accepting jobs", body = HealthResponse),
        (status = 503, description = "Shutting down", body = HealthResponse)
    )
)]
pub async fn get_health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let dispatcher = &state.dispatcher;
    let backends = dispatcher
        .backend_classes()
        .iter()
        .filter_map(|class| {
            let pool = dispatcher.pool_config(class.as_str())?;
            Some(BackendLoad {
                backend_class: class.to_string(),
                workers: pool.workers,
                capacity: pool.capacity(),
                in_flight: dispatcher.in_flight(class.as_str())?,
                queued: dispatcher.queued(class.as_str())?,
            })
        })
        .collect();

    let (code, status) = if dispatcher.is_shut_down() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
    } else {
        (StatusCode::OK, "ok")
    };
    (
        code,
        Json(HealthResponse {
            status: status.to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
            backends,
        }),
    )
}
