use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};

use crate::runtime::extract::SchemaValidator;
use crate::runtime::types::{BackendClass, DispatchError, JobId};

/// Sizing of one backend class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of jobs executed concurrently.
    pub workers: usize,
    /// Number of admitted jobs allowed to wait for a worker.
    pub queue_depth: usize,
}

impl PoolConfig {
    pub fn new(workers: usize, queue_depth: usize) -> Self {
        Self {
            workers,
            queue_depth,
        }
    }

    /// Small pool for backends that saturate local CPU/GPU.
    pub fn local_compute() -> Self {
        Self::new(2, 16)
    }

    /// Wider pool for backends that mostly wait on the network.
    pub fn network() -> Self {
        Self::new(8, 64)
    }

    /// Maximum number of in-flight (queued, backing off or running) jobs.
    pub fn capacity(&self) -> usize {
        self.workers + self.queue_depth
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::local_compute()
    }
}

/// RAII guard that frees an admission slot when dropped.
///
/// Travels with the job from admission until it reaches a terminal state.
pub struct Permit {
    /// Owned permit; dropping this struct releases it back to the semaphore.
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit").finish()
    }
}

/// Admission control for one backend class.
///
/// Acquisition never waits: when all slots are taken the caller gets
/// [`DispatchError::Overloaded`] immediately.
#[derive(Debug, Clone)]
pub struct Admission {
    class: BackendClass,
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl Admission {
    pub fn new(class: BackendClass, capacity: usize) -> Self {
        Self {
            class,
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn try_acquire(&self) -> Result<Permit, DispatchError> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map(|permit| Permit { permit })
            .map_err(|_| DispatchError::Overloaded {
                backend_class: self.class.clone(),
                capacity: self.capacity,
            })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of admission slots currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }
}

/// An admitted job waiting in (or travelling through) a class queue.
pub(crate) struct QueuedJob {
    pub(crate) id: JobId,
    pub(crate) permit: Permit,
    pub(crate) cancel_rx: watch::Receiver<bool>,
    pub(crate) validator: Option<SchemaValidator>,
}

impl std::fmt::Debug for QueuedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedJob")
            .field("id", &self.id)
            .field("permit", &self.permit)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<QueuedJob>,
    closed: bool,
}

/// FIFO of admitted jobs for one backend class, drained by its workers.
#[derive(Debug, Default)]
pub(crate) struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl JobQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append at the back. Hands the entry back if the queue is closed.
    pub(crate) fn push(&self, entry: QueuedJob) -> Result<(), QueuedJob> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(entry);
            }
            state.entries.push_back(entry);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next entry. Returns `None` once the queue is closed.
    pub(crate) async fn pop(&self) -> Option<QueuedJob> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent `close` cannot be missed.
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(entry) = state.entries.pop_front() {
                    return Some(entry);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Remove a waiting entry, e.g. on cancellation.
    pub(crate) fn remove(&self, id: &JobId) -> Option<QueuedJob> {
        let mut state = self.lock();
        let index = state.entries.iter().position(|entry| &entry.id == id)?;
        state.entries.remove(index)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub(crate) fn contains(&self, id: &JobId) -> bool {
        self.lock().entries.iter().any(|entry| &entry.id == id)
    }

    /// Close the queue, returning whatever was still waiting.
    pub(crate) fn close(&self) -> Vec<QueuedJob> {
        let drained = {
            let mut state = self.lock();
            state.closed = true;
            state.entries.drain(..).collect()
        };
        self.notify.notify_waiters();
        drained
    }
}
