use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use crate::runtime::types::{
    BackendClass, DispatchError, JobError, JobId, JobInput, JobKind, JobResult, JobStatus,
};

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Retry and deadline policy of a job. Immutable once the job is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobPolicy {
    /// Total number of attempts allowed, including the first one.
    pub max_attempts: u32,
    /// Per-attempt deadline for the backend call.
    #[serde(rename = "timeout_ms", serialize_with = "as_millis")]
    pub timeout: Duration,
    #[serde(rename = "base_delay_ms", serialize_with = "as_millis")]
    pub base_delay: Duration,
    #[serde(rename = "max_delay_ms", serialize_with = "as_millis")]
    pub max_delay: Duration,
}

impl JobPolicy {
    /// Default policy for a job kind.
    ///
    /// Transcription runs once (local compute failures rarely heal on retry);
    /// generation gets three attempts and the 180 s deadline the local model
    /// server is usually given.
    pub fn for_kind(kind: JobKind) -> Self {
        match kind {
            JobKind::Transcription => Self {
                max_attempts: 1,
                timeout: Duration::from_secs(15 * 60),
                base_delay: DEFAULT_BASE_DELAY,
                max_delay: DEFAULT_MAX_DELAY,
            },
            JobKind::Generation => Self {
                max_attempts: 3,
                timeout: Duration::from_secs(180),
                base_delay: DEFAULT_BASE_DELAY,
                max_delay: DEFAULT_MAX_DELAY,
            },
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Delay before re-enqueueing after `retries` previous retries:
    /// `base_delay * 2^retries`, capped at `max_delay`.
    pub fn backoff_delay(&self, retries: u32) -> Duration {
        let factor = 1u32.checked_shl(retries).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub(crate) fn validate(&self) -> Result<(), DispatchError> {
        if self.max_attempts == 0 {
            return Err(DispatchError::invalid("max_attempts must be at least 1"));
        }
        if self.timeout.is_zero() {
            return Err(DispatchError::invalid("timeout must be non-zero"));
        }
        if self.base_delay > self.max_delay {
            return Err(DispatchError::invalid(
                "base_delay must not exceed max_delay",
            ));
        }
        Ok(())
    }
}

fn as_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// A status change requested against the job store.
#[derive(Debug, Clone)]
pub enum Transition {
    /// `Pending -> Running`; starts a new attempt.
    Start,
    /// `Running -> Pending`; the attempt failed with a retryable error.
    Retry,
    /// `Running -> Succeeded`.
    Succeed(JobResult),
    /// `Pending | Running -> Failed`.
    Fail(JobError),
    /// `Pending | Running -> Cancelled`.
    Cancel,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::Start => "start",
            Transition::Retry => "retry",
            Transition::Succeed(_) => "succeed",
            Transition::Fail(_) => "fail",
            Transition::Cancel => "cancel",
        }
    }
}

/// A transition that is not legal from the job's current status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RejectedTransition {
    pub(crate) from: JobStatus,
    pub(crate) transition: &'static str,
}

/// The unit of work tracked by the dispatcher.
///
/// Values handed out by the store are snapshots; mutating them has no effect
/// on the stored job.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub input: JobInput,
    pub backend_class: BackendClass,
    pub status: JobStatus,
    pub attempt_count: u32,
    #[serde(flatten)]
    pub policy: JobPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        kind: JobKind,
        input: JobInput,
        backend_class: BackendClass,
        policy: JobPolicy,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            kind,
            input,
            backend_class,
            status: JobStatus::Pending,
            attempt_count: 0,
            policy,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    pub fn timeout(&self) -> Duration {
        self.policy.timeout
    }

    /// Whether another attempt may start after the current one.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt_count < self.policy.max_attempts
    }

    /// Apply `transition` in place. On error the job is left untouched.
    pub(crate) fn apply(
        &mut self,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<(), RejectedTransition> {
        use JobStatus::*;

        let rejected = RejectedTransition {
            from: self.status,
            transition: transition.name(),
        };
        match (self.status, transition) {
            (Pending, Transition::Start) if self.has_attempts_left() => {
                self.status = Running;
                self.attempt_count += 1;
                self.started_at = Some(now);
            }
            (Running, Transition::Retry) if self.has_attempts_left() => {
                self.status = Pending;
            }
            (Running, Transition::Succeed(result)) => {
                self.status = Succeeded;
                self.result = Some(result);
                self.finished_at = Some(now);
            }
            (Pending | Running, Transition::Fail(error)) => {
                self.status = Failed;
                self.error = Some(error);
                self.finished_at = Some(now);
            }
            (Pending | Running, Transition::Cancel) => {
                self.status = Cancelled;
                self.finished_at = Some(now);
            }
            _ => return Err(rejected),
        }

        self.updated_at = now;
        Ok(())
    }
}
