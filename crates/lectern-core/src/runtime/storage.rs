use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::runtime::job::{Job, Transition};
use crate::runtime::types::{BackendClass, JobId, JobKind, JobStatus, StoreError};

/// Default retention of terminal jobs before eviction.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);

/// The in-memory record for a single job.
#[derive(Debug)]
pub(crate) struct JobRecord {
    job: Job,
    /// Flipped to `true` when the job is cancelled; the worker running it
    /// (or its pending retry) watches this.
    cancel_tx: watch::Sender<bool>,
}

/// Criteria for [`JobStore::list`]. Unset fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub status: Option<JobStatus>,
    pub backend_class: Option<BackendClass>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.kind.is_none_or(|kind| kind == job.kind)
            && self.status.is_none_or(|status| status == job.status)
            && self
                .backend_class
                .as_ref()
                .is_none_or(|class| class == &job.backend_class)
    }
}

/// Centralized, thread-safe registry of job state.
///
/// Uses a `tokio::sync::RwLock<HashMap>` so many readers can poll jobs
/// concurrently. Writers go through [`Self::update_status`], which only
/// applies a transition when the job is still in the state the caller
/// observed.
#[derive(Debug, Clone, Default)]
pub struct JobStore {
    inner: Arc<RwLock<HashMap<JobId, JobRecord>>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly created job.
    ///
    /// Returns the receiver that flips to `true` when the job is cancelled.
    /// It is created under the same write lock as the record, so a caller
    /// that holds the job has its cancellation signal without a second await.
    pub async fn put(&self, job: Job) -> Result<watch::Receiver<bool>, StoreError> {
        let mut guard = self.inner.write().await;
        if guard.contains_key(&job.id) {
            return Err(StoreError::DuplicateId { id: job.id });
        }
        let (cancel_tx, cancel_rx) = watch::channel(false);
        guard.insert(job.id, JobRecord { job, cancel_tx });
        Ok(cancel_rx)
    }

    /// Return a snapshot of the job.
    pub async fn get(&self, id: &JobId) -> Result<Job, StoreError> {
        self.inner
            .read()
            .await
            .get(id)
            .map(|record| record.job.clone())
            .ok_or(StoreError::NotFound { id: *id })
    }

    /// Apply `transition` if the job is currently in `expected`.
    ///
    /// Returns the updated snapshot. A job that moved on since the caller
    /// read it yields [`StoreError::StaleTransition`]; a transition that is
    /// never legal from `expected` yields [`StoreError::IllegalTransition`].
    pub async fn update_status(
        &self,
        id: &JobId,
        expected: JobStatus,
        transition: Transition,
    ) -> Result<Job, StoreError> {
        let mut guard = self.inner.write().await;
        let record = guard.get_mut(id).ok_or(StoreError::NotFound { id: *id })?;

        if record.job.status != expected {
            return Err(StoreError::StaleTransition {
                id: *id,
                expected,
                actual: record.job.status,
            });
        }

        let cancelling = matches!(transition, Transition::Cancel);
        record
            .job
            .apply(transition, Utc::now())
            .map_err(|rejected| StoreError::IllegalTransition {
                id: *id,
                from: rejected.from,
                transition: rejected.transition,
            })?;

        if cancelling {
            record.cancel_tx.send_replace(true);
        }

        Ok(record.job.clone())
    }

    /// Snapshots of all jobs matching `filter`, oldest first.
    pub async fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .inner
            .read()
            .await
            .values()
            .filter(|record| filter.matches(&record.job))
            .map(|record| record.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Remove a terminal job on the caller's request.
    pub async fn acknowledge(&self, id: &JobId) -> Result<Job, StoreError> {
        let mut guard = self.inner.write().await;
        let record = guard.get(id).ok_or(StoreError::NotFound { id: *id })?;
        if !record.job.status.is_terminal() {
            return Err(StoreError::IllegalTransition {
                id: *id,
                from: record.job.status,
                transition: "acknowledge",
            });
        }
        guard
            .remove(id)
            .map(|record| record.job)
            .ok_or(StoreError::NotFound { id: *id })
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Drop terminal jobs that finished more than `retention` ago.
    ///
    /// Returns the number of evicted jobs.
    pub async fn evict_expired(&self, retention: Duration) -> usize {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(retention)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.evict_finished_before(cutoff).await
    }

    pub(crate) async fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut guard = self.inner.write().await;
        let before = guard.len();
        guard.retain(|_, record| {
            !(record.job.status.is_terminal()
                && record.job.finished_at.is_some_and(|at| at < cutoff))
        });
        before - guard.len()
    }

    /// Spawn the periodic eviction pass.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    pub fn spawn_eviction(&self, interval: Duration, retention: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = store.evict_expired(retention).await;
                if evicted > 0 {
                    info!(evicted, "evicted expired jobs");
                } else {
                    debug!("eviction pass found nothing to evict");
                }
            }
        })
    }

    /// Drop a job regardless of its state. Used to roll back an admission.
    pub(crate) async fn remove(&self, id: &JobId) -> Option<Job> {
        self.inner.write().await.remove(id).map(|record| record.job)
    }

    /// Hold a read lock so writers queue up behind it.
    #[cfg(test)]
    pub(crate) async fn freeze(&self) -> tokio::sync::RwLockReadGuard<'_, HashMap<JobId, JobRecord>> {
        self.inner.read().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::backend::protocol::BackendFailure;
    use crate::runtime::job::JobPolicy;
    use crate::runtime::types::{JobInput, JobResult, Transcript};

    fn transcription_job() -> Job {
        Job::new(
            JobKind::Transcription,
            JobInput::Media("clip.mp4".into()),
            BackendClass::from("transcription"),
            JobPolicy::for_kind(JobKind::Transcription),
        )
    }

    #[tokio::test]
    async fn put_then_get_returns_snapshot() {
        let store = JobStore::new();
        let job = transcription_job();
        let id = job.id;
        store.put(job).await.unwrap();

        let snapshot = store.get(&id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Pending);
        assert_eq!(snapshot.attempt_count, 0);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let store = JobStore::new();
        let job = transcription_job();
        store.put(job.clone()).await.unwrap();
        assert_eq!(
            store.put(job.clone()).await.unwrap_err(),
            StoreError::DuplicateId { id: job.id }
        );
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = JobStore::new();
        let id = JobId::new();
        assert_eq!(store.get(&id).await.unwrap_err(), StoreError::NotFound { id });
    }

    #[tokio::test]
    async fn stale_expected_state_is_rejected() {
        let store = JobStore::new();
        let job = transcription_job();
        let id = job.id;
        store.put(job).await.unwrap();

        store
            .update_status(&id, JobStatus::Pending, Transition::Start)
            .await
            .unwrap();

        let err = store
            .update_status(&id, JobStatus::Pending, Transition::Cancel)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            StoreError::StaleTransition {
                id,
                expected: JobStatus::Pending,
                actual: JobStatus::Running,
            }
        );
        // The job is untouched by the failed request.
        assert_eq!(store.get(&id).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let store = JobStore::new();
        let job = transcription_job();
        let id = job.id;
        store.put(job).await.unwrap();

        let err = store
            .update_status(
                &id,
                JobStatus::Pending,
                Transition::Succeed(JobResult::Transcript(Transcript::default())),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn cancel_transition_signals_watchers() {
        let store = JobStore::new();
        let job = transcription_job();
        let id = job.id;
        let mut rx = store.put(job).await.unwrap();
        assert!(!*rx.borrow());

        store
            .update_status(&id, JobStatus::Pending, Transition::Cancel)
            .await
            .unwrap();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn list_applies_filter() {
        let store = JobStore::new();
        let pending = transcription_job();
        let failed = transcription_job();
        let failed_id = failed.id;
        store.put(pending).await.unwrap();
        store.put(failed).await.unwrap();
        store
            .update_status(
                &failed_id,
                JobStatus::Pending,
                Transition::Fail(BackendFailure::unavailable("gone").into()),
            )
            .await
            .unwrap();

        assert_eq!(store.list(&JobFilter::default()).await.len(), 2);

        let only_failed = store
            .list(&JobFilter {
                status: Some(JobStatus::Failed),
                ..Default::default()
            })
            .await;
        assert_eq!(only_failed.len(), 1);
        assert_eq!(only_failed[0].id, failed_id);

        let generation = store
            .list(&JobFilter {
                kind: Some(JobKind::Generation),
                ..Default::default()
            })
            .await;
        assert!(generation.is_empty());
    }

    #[tokio::test]
    async fn acknowledge_only_removes_terminal_jobs() {
        let store = JobStore::new();
        let job = transcription_job();
        let id = job.id;
        store.put(job).await.unwrap();

        assert!(matches!(
            store.acknowledge(&id).await,
            Err(StoreError::IllegalTransition { .. })
        ));

        store
            .update_status(&id, JobStatus::Pending, Transition::Cancel)
            .await
            .unwrap();
        let removed = store.acknowledge(&id).await.unwrap();
        assert_eq!(removed.status, JobStatus::Cancelled);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn eviction_only_touches_old_terminal_jobs() {
        let store = JobStore::new();
        let running = transcription_job();
        let finished = transcription_job();
        let (running_id, finished_id) = (running.id, finished.id);
        store.put(running).await.unwrap();
        store.put(finished).await.unwrap();
        store
            .update_status(&finished_id, JobStatus::Pending, Transition::Cancel)
            .await
            .unwrap();

        // Nothing is old enough yet.
        assert_eq!(store.evict_expired(DEFAULT_RETENTION).await, 0);

        let future = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.evict_finished_before(future).await, 1);
        assert!(store.get(&running_id).await.is_ok());
        assert!(store.get(&finished_id).await.is_err());
    }

    #[tokio::test]
    async fn background_eviction_runs_periodically() {
        let store = JobStore::new();
        let job = transcription_job();
        let id = job.id;
        store.put(job).await.unwrap();
        store
            .update_status(&id, JobStatus::Pending, Transition::Cancel)
            .await
            .unwrap();

        let handle = store.spawn_eviction(Duration::from_millis(20), Duration::ZERO);
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.get(&id).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("terminal job should be evicted by the background pass");
        handle.abort();
    }
}
