use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use lectern_core::{JobId, JobKind, Submission};
use tracing::{info, warn};
use utoipa::OpenApi;
use validator::Validate;

use super::request_policy;
use crate::error::ServerError;
use crate::mcq::{self, DEFAULT_WORDS_PER_SEGMENT};
use crate::schemas::v1::submissions::{
    GenerationRequest, McqRequest, SubmittedBatchResponse, SubmittedResponse,
};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(create_generation, create_mcq_generations),
    components(schemas(GenerationRequest, McqRequest, SubmittedResponse, SubmittedBatchResponse))
)]
pub struct GenerationsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/generations", post(create_generation))
        .route("/generations/mcq", post(create_mcq_generations))
}

/// Queue a free-form generation whose reply must embed a JSON object.
#[utoipa::path(
    post,
    path = "/v1/generations",
    tag = "generations",
    request_body = GenerationRequest,
    responses(
        (status = 202, description = "Job admitted", body = SubmittedResponse),
        (status = 400, description = "Invalid request"),
        (status = 503, description = "Generation backend overloaded"),
    )
)]
pub async fn create_generation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerationRequest>,
) -> Result<(StatusCode, Json<SubmittedResponse>), ServerError> {
    req.validate()?;

    let policy = request_policy(
        &state.config,
        JobKind::Generation,
        req.max_attempts,
        req.timeout_secs,
    );
    let mut submission = Submission::generation(req.prompt).policy(policy);
    if let Some(class) = req.backend_class {
        submission = submission.backend_class(class);
    }

    let id = state.dispatcher.submit(submission).await?;
    info!(job_id = %id, "generation submitted");
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmittedResponse { id: id.to_string() }),
    ))
}

/// Split a transcript into word windows and queue one MCQ generation each.
///
/// Admission is all-or-nothing: if any window is rejected, the jobs already
/// admitted for this request are cancelled.
#[utoipa::path(
    post,
    path = "/v1/generations/mcq",
    tag = "generations",
    request_body = McqRequest,
    responses(
        (status = 202, description = "One job per transcript segment", body = SubmittedBatchResponse),
        (status = 400, description = "Invalid request"),
        (status = 503, description = "Generation backend overloaded"),
    )
)]
pub async fn create_mcq_generations(
    State(state): State<Arc<AppState>>,
    Json(req): Json<McqRequest>,
) -> Result<(StatusCode, Json<SubmittedBatchResponse>), ServerError> {
    req.validate()?;

    let words = req.words_per_segment.unwrap_or(DEFAULT_WORDS_PER_SEGMENT);
    let segments = mcq::segment_transcript_by_words(&req.transcript, words);
    if segments.is_empty() {
        return Err(ServerError::BadRequest("transcript has no words".into()));
    }

    let policy = request_policy(
        &state.config,
        JobKind::Generation,
        req.max_attempts,
        req.timeout_secs,
    );

    let mut ids: Vec<JobId> = Vec::with_capacity(segments.len());
    for segment in &segments {
        let submission = Submission::generation(mcq::mcq_prompt(segment))
            .policy(policy)
            .validator(mcq::validate_mcq_set);
        match state.dispatcher.submit(submission).await {
            Ok(id) => ids.push(id),
            Err(err) => {
                warn!(
                    admitted = ids.len(),
                    segments = segments.len(),
                    error = %err,
                    "mcq batch rejected; cancelling admitted jobs"
                );
                for id in &ids {
                    if let Err(e) = state.dispatcher.cancel(id).await {
                        warn!(job_id = %id, error = %e, "failed to cancel batch job");
                    }
                }
                return Err(err.into());
            }
        }
    }

    info!(jobs = ids.len(), words_per_segment = words, "mcq generation submitted");
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmittedBatchResponse {
            ids: ids.iter().map(JobId::to_string).collect(),
        }),
    ))
}
