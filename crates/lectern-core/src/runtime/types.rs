use std::borrow::Borrow;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::runtime::backend::protocol::BackendFailure;
use crate::runtime::extract::ExtractionError;

/// Opaque, unique identifier assigned to a job at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The category of inference a job performs.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobKind {
    Transcription,
    Generation,
}

/// Lifecycle state of a job.
///
/// ```text
/// Pending -> Running -> Succeeded | Failed
/// Running -> Pending            (retryable failure, attempts remain)
/// Pending | Running -> Cancelled
/// ```
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Returns `true` for states from which no further transition occurs.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Name of a worker pool dedicated to one category of backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendClass(String);

impl BackendClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendClass {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for BackendClass {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for BackendClass {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Reference to a media file on local disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub path: PathBuf,
}

impl MediaRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl From<PathBuf> for MediaRef {
    fn from(path: PathBuf) -> Self {
        Self { path }
    }
}

impl From<&str> for MediaRef {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// Input payload carried by a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum JobInput {
    Media(MediaRef),
    Prompt(String),
}

impl JobInput {
    /// The job kind this input belongs to.
    pub fn kind(&self) -> JobKind {
        match self {
            JobInput::Media(_) => JobKind::Transcription,
            JobInput::Prompt(_) => JobKind::Generation,
        }
    }
}

/// One time-aligned piece of a transcript, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Output of a transcription backend.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

/// Result attached to a job in the `Succeeded` state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum JobResult {
    Transcript(Transcript),
    /// Decoded, validated payload extracted from generation output.
    Structured(serde_json::Value),
}

/// Error attached to a job in the `Failed` state.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "source", content = "detail", rename_all = "snake_case")]
pub enum JobError {
    #[error(transparent)]
    Backend(#[from] BackendFailure),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

/// Errors produced by the [`JobStore`](crate::runtime::storage::JobStore).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("job not found: {id}")]
    NotFound { id: JobId },

    #[error("job {id} already exists")]
    DuplicateId { id: JobId },

    /// The caller's view of the job is out of date; re-read and retry.
    #[error("stale transition on job {id}: expected {expected}, found {actual}")]
    StaleTransition {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("transition '{transition}' is not allowed from {from} (job {id})")]
    IllegalTransition {
        id: JobId,
        from: JobStatus,
        transition: &'static str,
    },
}

/// Errors reported synchronously by the [`Dispatcher`](crate::runtime::dispatcher::Dispatcher).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    /// Every admission slot of the backend class is taken.
    #[error("backend class '{backend_class}' is overloaded (capacity {capacity})")]
    Overloaded {
        backend_class: BackendClass,
        capacity: usize,
    },

    #[error("unknown backend class: {backend_class}")]
    UnknownBackendClass { backend_class: BackendClass },

    #[error("no backend class registered for {kind} jobs")]
    NoBackendForKind { kind: JobKind },

    #[error("invalid submission: {reason}")]
    InvalidSubmission { reason: String },

    #[error("invalid dispatcher configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("dispatcher is shut down")]
    Shutdown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DispatchError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        DispatchError::InvalidSubmission {
            reason: reason.into(),
        }
    }
}
