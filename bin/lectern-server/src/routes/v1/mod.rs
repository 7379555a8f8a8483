pub mod generations;
pub mod jobs;
pub mod transcriptions;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use lectern_core::{JobKind, JobPolicy};
use utoipa::OpenApi;

use crate::config::Config;
use crate::state::AppState;

/// Routes nested under `/v1`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(transcriptions::router())
        .merge(generations::router())
        .merge(jobs::router())
}

pub fn api_docs() -> utoipa::openapi::OpenApi {
    let mut doc = transcriptions::TranscriptionsApi::openapi();
    doc.merge(generations::GenerationsApi::openapi());
    doc.merge(jobs::JobsApi::openapi());
    doc
}

/// Configured policy for `kind`, with per-request overrides applied.
pub(crate) fn request_policy(
    config: &Config,
    kind: JobKind,
    max_attempts: Option<u32>,
    timeout_secs: Option<u64>,
) -> JobPolicy {
    let mut policy = config.policy_for(kind);
    if let Some(max_attempts) = max_attempts {
        policy = policy.with_max_attempts(max_attempts);
    }
    if let Some(secs) = timeout_secs {
        policy = policy.with_timeout(Duration::from_secs(secs));
    }
    policy
}
