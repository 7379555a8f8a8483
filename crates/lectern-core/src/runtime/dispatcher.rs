use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::runtime::backend::admission::{Admission, JobQueue, PoolConfig, QueuedJob};
use crate::runtime::backend::protocol::{
    BackendAdapter, BackendFailure, BackendOutput, BackendRequest,
};
use crate::runtime::extract::{ResultExtractor, SchemaValidator};
use crate::runtime::job::{Job, JobPolicy, Transition};
use crate::runtime::storage::{JobFilter, JobStore, DEFAULT_RETENTION};
use crate::runtime::types::{
    BackendClass, DispatchError, JobError, JobId, JobInput, JobKind, JobResult, JobStatus,
    MediaRef, StoreError,
};

/// Dispatcher-wide settings.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// How long terminal jobs are kept before eviction.
    pub retention: Duration,
    /// Period of the background eviction pass.
    pub eviction_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            eviction_interval: Duration::from_secs(60),
        }
    }
}

/// A request to run one job.
#[derive(Clone)]
pub struct Submission {
    kind: JobKind,
    input: JobInput,
    backend_class: Option<BackendClass>,
    policy: Option<JobPolicy>,
    validator: Option<SchemaValidator>,
}

impl std::fmt::Debug for Submission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Submission")
            .field("kind", &self.kind)
            .field("input", &self.input)
            .field("backend_class", &self.backend_class)
            .field("policy", &self.policy)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl Submission {
    pub fn new(kind: JobKind, input: JobInput) -> Self {
        Self {
            kind,
            input,
            backend_class: None,
            policy: None,
            validator: None,
        }
    }

    pub fn transcription(media: impl Into<MediaRef>) -> Self {
        Self::new(JobKind::Transcription, JobInput::Media(media.into()))
    }

    pub fn generation(prompt: impl Into<String>) -> Self {
        Self::new(JobKind::Generation, JobInput::Prompt(prompt.into()))
    }

    /// Run on a specific backend class instead of the kind's default one.
    pub fn backend_class(mut self, class: impl Into<BackendClass>) -> Self {
        self.backend_class = Some(class.into());
        self
    }

    /// Override the kind's default [`JobPolicy`].
    pub fn policy(mut self, policy: JobPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Schema check for the extracted payload of a generation job.
    pub fn validator(
        mut self,
        validator: impl Fn(&serde_json::Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    fn validate_input(&self) -> Result<(), DispatchError> {
        if self.input.kind() != self.kind {
            return Err(DispatchError::invalid(format!(
                "{} job cannot take {} input",
                self.kind,
                self.input.kind()
            )));
        }
        match &self.input {
            JobInput::Prompt(prompt) if prompt.trim().is_empty() => {
                Err(DispatchError::invalid("prompt is empty"))
            }
            JobInput::Media(media) if media.path.as_os_str().is_empty() => {
                Err(DispatchError::invalid("media path is empty"))
            }
            _ => Ok(()),
        }
    }
}

/// One backend class: its adapter, admission slots, queue and sizing.
struct Pool {
    class: BackendClass,
    adapter: Arc<dyn BackendAdapter>,
    config: PoolConfig,
    admission: Admission,
    queue: Arc<JobQueue>,
    /// Jobs sleeping out their retry backoff.
    backoffs: Mutex<JoinSet<()>>,
    /// Raised on shutdown to cut backoff sleeps short.
    closing: watch::Sender<bool>,
}

impl Pool {
    fn new(class: BackendClass, config: PoolConfig, adapter: Arc<dyn BackendAdapter>) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            admission: Admission::new(class.clone(), config.capacity()),
            queue: Arc::new(JobQueue::new()),
            backoffs: Mutex::new(JoinSet::new()),
            closing,
            class,
            adapter,
            config,
        }
    }

    fn backoffs(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.backoffs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Inner {
    store: JobStore,
    pools: HashMap<BackendClass, Arc<Pool>>,
    /// Registration order; the first class able to run a kind is its default.
    order: Vec<BackendClass>,
    config: DispatcherConfig,
    workers: Mutex<Vec<JoinHandle<()>>>,
    eviction: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for pool in self.pools.values() {
            pool.queue.close();
        }
        let eviction = self
            .eviction
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = eviction {
            handle.abort();
        }
    }
}

/// Admits jobs, runs them on per-class worker pools and records outcomes.
///
/// Cheap to clone; all clones share the same pools and job store.
///
/// ```rust,ignore
/// let dispatcher = Dispatcher::builder()
///     .backend("transcription", PoolConfig::local_compute(), Arc::new(whisper))
///     .backend("generation", PoolConfig::network(), Arc::new(ollama))
///     .start()?;
/// let id = dispatcher.submit(Submission::generation("Write a quiz")).await?;
/// let job = dispatcher.poll(&id).await?;
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("classes", &self.inner.order)
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Builder for [`Dispatcher`].
#[derive(Default)]
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    backends: Vec<(BackendClass, PoolConfig, Arc<dyn BackendAdapter>)>,
    extractor: ResultExtractor,
    store: Option<JobStore>,
}

impl DispatcherBuilder {
    /// Register a backend class served by `adapter`.
    pub fn backend(
        mut self,
        class: impl Into<BackendClass>,
        pool: PoolConfig,
        adapter: Arc<dyn BackendAdapter>,
    ) -> Self {
        self.backends.push((class.into(), pool, adapter));
        self
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Extractor applied to generation output; its validator is the default
    /// for submissions that bring none.
    pub fn extractor(mut self, extractor: ResultExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn store(mut self, store: JobStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Spawn the worker pools and the eviction pass.
    ///
    /// # Panics
    /// Panics if called outside a Tokio runtime.
    pub fn start(self) -> Result<Dispatcher, DispatchError> {
        if self.backends.is_empty() {
            return Err(DispatchError::InvalidConfig {
                reason: "at least one backend class is required".into(),
            });
        }
        if self.config.eviction_interval.is_zero() {
            return Err(DispatchError::InvalidConfig {
                reason: "eviction interval must be non-zero".into(),
            });
        }

        let store = self.store.unwrap_or_default();
        let mut pools = HashMap::new();
        let mut order = Vec::new();

        for (class, config, adapter) in self.backends {
            if config.workers == 0 {
                return Err(DispatchError::InvalidConfig {
                    reason: format!("backend class '{class}' needs at least one worker"),
                });
            }
            if pools.contains_key(&class) {
                return Err(DispatchError::InvalidConfig {
                    reason: format!("backend class '{class}' registered twice"),
                });
            }
            let pool = Arc::new(Pool::new(class.clone(), config, adapter));
            order.push(class.clone());
            pools.insert(class, pool);
        }

        let mut workers = Vec::new();
        for class in &order {
            let pool = &pools[class];
            for slot in 0..pool.config.workers {
                let worker = Worker {
                    store: store.clone(),
                    pool: Arc::clone(pool),
                    extractor: self.extractor.clone(),
                };
                let span = info_span!("worker", backend_class = %class, slot);
                workers.push(tokio::spawn(worker.run().instrument(span)));
            }
            info!(
                backend_class = %class,
                backend = pool.adapter.name(),
                capability = %pool.adapter.capability(),
                workers = pool.config.workers,
                queue_depth = pool.config.queue_depth,
                "backend class registered"
            );
        }

        let eviction = store.spawn_eviction(self.config.eviction_interval, self.config.retention);

        Ok(Dispatcher {
            inner: Arc::new(Inner {
                store,
                pools,
                order,
                config: self.config,
                workers: Mutex::new(workers),
                eviction: Mutex::new(Some(eviction)),
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Admit a job.
    ///
    /// Never waits for a worker: the job is either queued or rejected with
    /// [`DispatchError::Overloaded`], in which case no job is created.
    pub async fn submit(&self, submission: Submission) -> Result<JobId, DispatchError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(DispatchError::Shutdown);
        }
        submission.validate_input()?;

        let pool = self.resolve_pool(submission.kind, submission.backend_class.as_ref())?;
        let policy = submission
            .policy
            .unwrap_or_else(|| JobPolicy::for_kind(submission.kind));
        policy.validate()?;

        let permit = pool.admission.try_acquire().inspect_err(|_| {
            warn!(backend_class = %pool.class, "admission rejected: backend class overloaded");
        })?;

        let job = Job::new(submission.kind, submission.input, pool.class.clone(), policy);
        let id = job.id;
        // No await between storing the job and queueing it: a submit future
        // dropped after `put` must not leave a pending job nobody will run.
        let cancel_rx = self.inner.store.put(job).await?;

        let entry = QueuedJob {
            id,
            permit,
            cancel_rx,
            validator: submission.validator,
        };
        if pool.queue.push(entry).is_err() {
            let store = self.inner.store.clone();
            tokio::spawn(async move {
                store.remove(&id).await;
            });
            return Err(DispatchError::Shutdown);
        }

        info!(
            job_id = %id,
            kind = %submission.kind,
            backend_class = %pool.class,
            max_attempts = policy.max_attempts,
            "job admitted"
        );
        Ok(id)
    }

    /// Snapshot of a job.
    pub async fn poll(&self, id: &JobId) -> Result<Job, DispatchError> {
        Ok(self.inner.store.get(id).await?)
    }

    /// Cancel a job that has not reached a terminal state.
    ///
    /// A pending job is pulled out of its queue; a running job has its
    /// backend call interrupted on a best-effort basis. Cancelling a job that
    /// is already terminal is a no-op returning its snapshot.
    pub async fn cancel(&self, id: &JobId) -> Result<Job, DispatchError> {
        loop {
            let current = self.inner.store.get(id).await?;
            if current.status.is_terminal() {
                return Ok(current);
            }

            match self
                .inner
                .store
                .update_status(id, current.status, Transition::Cancel)
                .await
            {
                Ok(job) => {
                    let dequeued = self
                        .inner
                        .pools
                        .get(&job.backend_class)
                        .and_then(|pool| pool.queue.remove(id))
                        .is_some();
                    info!(job_id = %id, from = %current.status, dequeued, "job cancelled");
                    return Ok(job);
                }
                // The job moved on between the read and the write; look again.
                Err(StoreError::StaleTransition { .. }) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Evict a terminal job now instead of waiting for the retention window.
    pub async fn acknowledge(&self, id: &JobId) -> Result<Job, DispatchError> {
        Ok(self.inner.store.acknowledge(id).await?)
    }

    pub async fn list(&self, filter: &JobFilter) -> Vec<Job> {
        self.inner.store.list(filter).await
    }

    pub fn store(&self) -> &JobStore {
        &self.inner.store
    }

    /// Registered backend classes, in registration order.
    pub fn backend_classes(&self) -> &[BackendClass] {
        &self.inner.order
    }

    /// Sizing of `class`.
    pub fn pool_config(&self, class: &str) -> Option<PoolConfig> {
        self.inner.pools.get(class).map(|pool| pool.config)
    }

    /// Number of jobs waiting in the queue of `class`.
    pub fn queued(&self, class: &str) -> Option<usize> {
        self.inner.pools.get(class).map(|pool| pool.queue.len())
    }

    /// Number of admission slots of `class` currently held.
    pub fn in_flight(&self, class: &str) -> Option<usize> {
        self.inner.pools.get(class).map(|pool| pool.admission.in_flight())
    }

    /// Whether [`Self::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Whether `id` is currently waiting in a queue.
    pub fn is_queued(&self, id: &JobId) -> bool {
        self.inner.pools.values().any(|pool| pool.queue.contains(id))
    }

    /// Stop accepting work, fail queued and backing-off jobs, let running
    /// attempts finish, then tear down every backend adapter. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("dispatcher shutting down");

        for class in &self.inner.order {
            let pool = &self.inner.pools[class];
            for entry in pool.queue.close() {
                let failure = BackendFailure::unavailable("dispatcher shut down before dispatch");
                if let Err(err) = self
                    .inner
                    .store
                    .update_status(&entry.id, JobStatus::Pending, Transition::Fail(failure.into()))
                    .await
                {
                    debug!(job_id = %entry.id, error = %err, "queued job already settled");
                }
            }
            pool.closing.send_replace(true);
        }

        let workers = std::mem::take(
            &mut *self
                .inner
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for result in join_all(workers).await {
            if let Err(err) = result {
                warn!(error = %err, "worker task ended abnormally");
            }
        }

        // Workers are gone, so no new backoff can start.
        for class in &self.inner.order {
            let mut backoffs = std::mem::take(&mut *self.inner.pools[class].backoffs());
            while let Some(result) = backoffs.join_next().await {
                if let Err(err) = result {
                    warn!(backend_class = %class, error = %err, "retry task ended abnormally");
                }
            }
        }

        let eviction = self
            .inner
            .eviction
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = eviction {
            handle.abort();
        }

        for class in &self.inner.order {
            let pool = &self.inner.pools[class];
            pool.adapter.shutdown().await;
            debug!(backend_class = %class, backend = pool.adapter.name(), "backend shut down");
        }
        info!("dispatcher stopped");
    }

    fn resolve_pool(
        &self,
        kind: JobKind,
        requested: Option<&BackendClass>,
    ) -> Result<&Arc<Pool>, DispatchError> {
        match requested {
            Some(class) => {
                let pool = self.inner.pools.get(class).ok_or_else(|| {
                    DispatchError::UnknownBackendClass {
                        backend_class: class.clone(),
                    }
                })?;
                if pool.adapter.capability() != kind {
                    return Err(DispatchError::invalid(format!(
                        "backend class '{class}' cannot run {kind} jobs"
                    )));
                }
                Ok(pool)
            }
            None => self
                .inner
                .order
                .iter()
                .map(|class| &self.inner.pools[class])
                .find(|pool| pool.adapter.capability() == kind)
                .ok_or(DispatchError::NoBackendForKind { kind }),
        }
    }
}

/// Resolves once the cancellation flag is raised. Never resolves if the
/// job record (and with it the sender) is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let sender_gone = rx.wait_for(|flag| *flag).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}

/// One worker slot of a pool.
struct Worker {
    store: JobStore,
    pool: Arc<Pool>,
    extractor: ResultExtractor,
}

impl Worker {
    async fn run(self) {
        while let Some(entry) = self.pool.queue.pop().await {
            self.run_attempt(entry).await;
        }
        debug!("queue closed; worker exiting");
    }

    async fn run_attempt(&self, mut entry: QueuedJob) {
        let job = match self
            .store
            .update_status(&entry.id, JobStatus::Pending, Transition::Start)
            .await
        {
            Ok(job) => job,
            Err(err) => {
                debug!(job_id = %entry.id, error = %err, "skipping job that is no longer pending");
                return;
            }
        };

        let span = info_span!("attempt", job_id = %job.id, attempt = job.attempt_count);
        async move {
            let request = BackendRequest {
                job_id: job.id,
                input: job.input.clone(),
                timeout: job.timeout(),
                attempt: job.attempt_count,
            };
            let started = Instant::now();

            let outcome = tokio::select! {
                biased;
                _ = cancelled(&mut entry.cancel_rx) => None,
                result = tokio::time::timeout(job.timeout(), self.pool.adapter.invoke(request)) => {
                    Some(result.unwrap_or_else(|_| {
                        Err(BackendFailure::timeout(format!(
                            "no response within {:?}",
                            job.timeout()
                        )))
                    }))
                }
            };
            let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            let Some(outcome) = outcome else {
                info!(elapsed_ms, "attempt abandoned: job cancelled");
                return;
            };

            match outcome {
                Ok(output) => {
                    let transition = match self.finish(&job, output, entry.validator.as_ref()) {
                        Ok(result) => Transition::Succeed(result),
                        Err(error) => Transition::Fail(error),
                    };
                    self.settle(&job, transition, elapsed_ms).await;
                }
                Err(failure) if failure.is_retryable() && job.has_attempts_left() => {
                    let delay = job.policy.backoff_delay(job.attempt_count - 1);
                    match self
                        .store
                        .update_status(&job.id, JobStatus::Running, Transition::Retry)
                        .await
                    {
                        Ok(_) => {
                            warn!(
                                error = %failure,
                                elapsed_ms,
                                retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                                "attempt failed; retrying"
                            );
                            self.requeue_after(entry, delay);
                        }
                        Err(err) => debug!(error = %err, "retry discarded"),
                    }
                }
                Err(failure) => {
                    self.settle(&job, Transition::Fail(failure.into()), elapsed_ms)
                        .await;
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Turn raw backend output into the job's result.
    fn finish(
        &self,
        job: &Job,
        output: BackendOutput,
        validator: Option<&SchemaValidator>,
    ) -> Result<JobResult, JobError> {
        match (job.kind, output) {
            (JobKind::Transcription, BackendOutput::Transcript(transcript)) => {
                Ok(JobResult::Transcript(transcript))
            }
            (JobKind::Generation, BackendOutput::Text(raw)) => self
                .extractor
                .extract_with(&raw, validator)
                .map(JobResult::Structured)
                .map_err(JobError::from),
            (kind, _) => Err(BackendFailure::internal(format!(
                "backend '{}' returned output that does not fit a {kind} job",
                self.pool.adapter.name()
            ))
            .into()),
        }
    }

    /// Record a terminal outcome; dropped silently if the job was cancelled
    /// in the meantime.
    async fn settle(&self, job: &Job, transition: Transition, elapsed_ms: u64) {
        match self
            .store
            .update_status(&job.id, JobStatus::Running, transition)
            .await
        {
            Ok(settled) => match &settled.error {
                None => info!(elapsed_ms, status = %settled.status, "job finished"),
                Some(error) => warn!(elapsed_ms, status = %settled.status, %error, "job finished"),
            },
            Err(err) => debug!(error = %err, "outcome discarded"),
        }
    }

    /// Put the job back at the end of its queue once `delay` has passed,
    /// unless it gets cancelled first. Shutdown ends the wait early and the
    /// job is failed instead, since the closed queue refuses it.
    fn requeue_after(&self, mut entry: QueuedJob, delay: Duration) {
        let queue = Arc::clone(&self.pool.queue);
        let store = self.store.clone();
        let mut closing = self.pool.closing.subscribe();
        let task = async move {
            tokio::select! {
                biased;
                _ = cancelled(&mut entry.cancel_rx) => return,
                _ = closing.wait_for(|closed| *closed) => {}
                _ = tokio::time::sleep(delay) => {}
            }
            if let Err(entry) = queue.push(entry) {
                let failure = BackendFailure::unavailable("dispatcher shut down during retry backoff");
                if let Err(err) = store
                    .update_status(&entry.id, JobStatus::Pending, Transition::Fail(failure.into()))
                    .await
                {
                    debug!(job_id = %entry.id, error = %err, "job already settled");
                }
            }
        };

        let mut backoffs = self.pool.backoffs();
        while backoffs.try_join_next().is_some() {}
        backoffs.spawn(task.in_current_span());
    }
}
