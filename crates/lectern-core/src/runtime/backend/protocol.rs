use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::runtime::types::{JobId, JobInput, JobKind, Transcript};

/// Common failure taxonomy every backend maps its errors onto.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// The engine could not be reached or is temporarily saturated.
    Unavailable,
    /// The input was rejected; retrying the same input will not help.
    InvalidInput,
    /// The call did not finish within the per-attempt deadline.
    Timeout,
    /// Anything else the engine reported.
    Internal,
}

/// Failure returned by a [`BackendAdapter`] invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("backend {kind}: {message}")]
pub struct BackendFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl BackendFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unavailable, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidInput, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }

    /// `Unavailable` and `Timeout` are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, FailureKind::Unavailable | FailureKind::Timeout)
    }
}

/// What the dispatcher hands to a backend for one attempt.
///
/// Built from a job snapshot; adapters never see or mutate the job itself.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub job_id: JobId,
    pub input: JobInput,
    /// Deadline of this attempt; network adapters forward it to their client.
    pub timeout: Duration,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// Raw output of a successful backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendOutput {
    Transcript(Transcript),
    /// Free text, expected to embed a structured payload.
    Text(String),
}

pub type BackendResult = Result<BackendOutput, BackendFailure>;

/// Uniform capability interface over a concrete inference engine.
///
/// One process-wide instance per engine is created at startup and injected
/// into the dispatcher, which calls [`BackendAdapter::shutdown`] on teardown.
///
/// The dispatcher drops the future returned by [`BackendAdapter::invoke`] on
/// timeout or cancellation. Adapters should stop their work when that
/// happens, or at least tolerate it.
#[async_trait]
pub trait BackendAdapter: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// The job kind this backend can execute.
    fn capability(&self) -> JobKind;

    async fn invoke(&self, request: BackendRequest) -> BackendResult;

    async fn shutdown(&self) {}
}
