use lectern_core::Job;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};

/// Filters for `GET /v1/jobs`; unset fields match everything.
#[derive(Debug, Default, Deserialize, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct JobQuery {
    /// `transcription` or `generation`.
    pub kind: Option<String>,
    /// `pending`, `running`, `succeeded`, `failed` or `cancelled`.
    pub status: Option<String>,
    pub backend_class: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobResponse {
    pub id: String,
    pub kind: String,
    pub status: String,
    pub backend_class: String,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub timeout_ms: u64,
    /// Present once the job succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub result: Option<Value>,
    /// Present once the job failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub error: Option<Value>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        JobResponse {
            id: job.id.to_string(),
            kind: job.kind.to_string(),
            status: job.status.to_string(),
            backend_class: job.backend_class.to_string(),
            attempt_count: job.attempt_count,
            max_attempts: job.max_attempts(),
            timeout_ms: u64::try_from(job.timeout().as_millis()).unwrap_or(u64::MAX),
            result: job.result.and_then(|r| serde_json::to_value(r).ok()),
            error: job.error.and_then(|e| serde_json::to_value(e).ok()),
            created_at: job.created_at.to_rfc3339(),
            updated_at: job.updated_at.to_rfc3339(),
            started_at: job.started_at.map(|t| t.to_rfc3339()),
            finished_at: job.finished_at.map(|t| t.to_rfc3339()),
        }
    }
}
