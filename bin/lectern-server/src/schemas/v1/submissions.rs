//! Bodies of the `/v1/transcriptions` and `/v1/generations` endpoints.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

/// Request body for `POST /v1/transcriptions`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Validate)]
pub struct TranscriptionRequest {
    /// Path of the media file on the server's disk.
    #[validate(length(min = 1))]
    pub media_path: String,
    /// Overrides the configured attempt limit.
    #[serde(default)]
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: Option<u32>,
    /// Overrides the configured per-attempt deadline.
    #[serde(default)]
    #[validate(range(min = 1, max = 86400))]
    pub timeout_secs: Option<u64>,
    /// Run on this backend class instead of the default one.
    #[serde(default)]
    pub backend_class: Option<String>,
}

/// Request body for `POST /v1/generations`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Validate)]
pub struct GenerationRequest {
    /// Prompt sent to the model; the reply must embed a JSON object.
    #[validate(length(min = 1))]
    pub prompt: String,
    #[serde(default)]
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    #[validate(range(min = 1, max = 3600))]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub backend_class: Option<String>,
}

/// Request body for `POST /v1/generations/mcq`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Validate)]
pub struct McqRequest {
    /// Full lecture transcript.
    #[validate(length(min = 1))]
    pub transcript: String,
    /// Words per generated question batch (default `750`).
    #[serde(default)]
    #[validate(range(min = 1, max = 10000))]
    pub words_per_segment: Option<usize>,
    #[serde(default)]
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    #[validate(range(min = 1, max = 3600))]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubmittedResponse {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubmittedBatchResponse {
    /// One job per transcript segment, in transcript order.
    pub ids: Vec<String>,
}
