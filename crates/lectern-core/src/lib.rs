//! Job orchestration for backend-dispatched inference.
//!
//! Jobs (transcription or generation) are admitted into bounded per-class
//! queues, executed by fixed-size worker pools against pluggable
//! [`BackendAdapter`]s under per-attempt timeouts, retried on transient
//! failures, and recorded in an in-memory [`JobStore`] for polling.

mod runtime;

pub mod engine;

pub use runtime::backend::{
    Admission, BackendAdapter, BackendFailure, BackendOutput, BackendRequest, BackendResult,
    FailureKind, Permit, PoolConfig,
};
pub use runtime::dispatcher::{Dispatcher, DispatcherBuilder, DispatcherConfig, Submission};
pub use runtime::extract::{find_structured_span, ExtractionError, ResultExtractor, SchemaValidator};
pub use runtime::job::{Job, JobPolicy, Transition};
pub use runtime::storage::{JobFilter, JobStore, DEFAULT_RETENTION};
pub use runtime::types::{
    BackendClass, DispatchError, JobError, JobId, JobInput, JobKind, JobResult, JobStatus,
    MediaRef, Segment, StoreError, Transcript,
};
