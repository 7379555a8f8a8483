use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use lectern_core::{JobKind, Submission};
use tracing::info;
use utoipa::OpenApi;
use validator::Validate;

use super::request_policy;
use crate::error::ServerError;
use crate::schemas::v1::submissions::{SubmittedResponse, TranscriptionRequest};
use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    paths(create_transcription),
    components(schemas(TranscriptionRequest, SubmittedResponse))
)]
pub struct TranscriptionsApi;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/transcriptions", post(create_transcription))
}

/// Queue a transcription of a media file already on the server's disk.
#[utoipa::path(
    post,
    path = "/v1/transcriptions",
    tag = "transcriptions",
    request_body = TranscriptionRequest,
    responses(
        (status = 202, description = "Job admitted", body = SubmittedResponse),
        (status = 400, description = "Invalid request"),
        (status = 503, description = "Transcription backend overloaded"),
    )
)]
pub async fn create_transcription(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TranscriptionRequest>,
) -> Result<(StatusCode, Json<SubmittedResponse>), ServerError> {
    req.validate()?;

    let policy = request_policy(
        &state.config,
        JobKind::Transcription,
        req.max_attempts,
        req.timeout_secs,
    );
    let mut submission = Submission::transcription(PathBuf::from(&req.media_path)).policy(policy);
    if let Some(class) = req.backend_class {
        submission = submission.backend_class(class);
    }

    let id = state.dispatcher.submit(submission).await?;
    info!(job_id = %id, media_path = %req.media_path, "transcription submitted");
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmittedResponse { id: id.to_string() }),
    ))
}
