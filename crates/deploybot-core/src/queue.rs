//! In-memory multi-queue of pending jobs, partitioned by target host.
//!
//! The queue is a rebuildable cache: the store's idempotency index and job
//! rows are the source of truth, and `rebuild` reconstructs the partitions
//! from recovery output at startup. One mutex guards the partition map and
//! the in-memory idempotency index together; it is never held across a
//! store call.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DeployError, Result};
use crate::job::{IdemKey, Job, JobCreate};
use crate::store::{Recovery, Store};

struct Inner {
    partitions: HashMap<String, VecDeque<(Uuid, DateTime<Utc>)>>,
    index: HashMap<IdemKey, Uuid>,
}

pub struct JobQueue {
    store: Arc<Store>,
    inner: Mutex<Inner>,
}

impl JobQueue {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            inner: Mutex::new(Inner {
                partitions: HashMap::new(),
                index: HashMap::new(),
            }),
        }
    }

    /// Repopulate partitions and index from startup recovery. `pending` is
    /// already in `created_at` order; running jobs hold their idempotency
    /// key but sit in no partition.
    pub fn rebuild(&self, recovery: &Recovery) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.partitions.clear();
        inner.index.clear();
        for job in &recovery.pending {
            inner.index.insert(job.idem_key(), job.id);
            inner
                .partitions
                .entry(job.host.clone())
                .or_default()
                .push_back((job.id, job.created_at));
        }
        for job in &recovery.running {
            inner.index.insert(job.idem_key(), job.id);
        }
    }

    /// Create and enqueue a new pending job. The in-memory index gives a
    /// fast-path rejection; the store's insert transaction is the
    /// authoritative duplicate check.
    pub fn enqueue(&self, create: JobCreate, now: DateTime<Utc>) -> Result<Job> {
        let key = create.idem_key();
        {
            let inner = self.inner.lock().expect("queue lock poisoned");
            if inner.index.contains_key(&key) {
                return Err(DeployError::DuplicateIdempotency(key.to_string()));
            }
        }

        let job = Job::new(create, now);
        self.store.insert_job(&job)?;

        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.index.insert(key, job.id);
        inner
            .partitions
            .entry(job.host.clone())
            .or_default()
            .push_back((job.id, job.created_at));
        Ok(job)
    }

    /// Pop the head of `host`'s partition and claim it for `agent_id`.
    ///
    /// The store's claim CAS linearizes racing callers: a head that lost its
    /// pending status under us (cancelled, or claimed through a rebuilt
    /// partition) is skipped and the next head is tried. Returns `None` when
    /// the partition is empty.
    pub fn try_claim(
        &self,
        host: &str,
        agent_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        loop {
            let head = {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                inner.partitions.get_mut(host).and_then(|p| p.pop_front())
            };
            let Some((job_id, created_at)) = head else {
                return Ok(None);
            };
            match self.store.claim_job(job_id, agent_id, now) {
                Ok(job) => return Ok(Some(job)),
                Err(DeployError::NotClaimable(_)) | Err(DeployError::JobNotFound(_)) => {
                    debug!(job = %job_id, host, "skipping stale queue head");
                    continue;
                }
                Err(e) => {
                    // Transient store failure: the job is still pending, put
                    // it back where it was.
                    let mut inner = self.inner.lock().expect("queue lock poisoned");
                    inner
                        .partitions
                        .entry(host.to_string())
                        .or_default()
                        .push_front((job_id, created_at));
                    return Err(e);
                }
            }
        }
    }

    /// Drop a terminalized job from the partition and release its
    /// idempotency key. Idempotent.
    pub fn on_terminal(&self, job: &Job) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let key = job.idem_key();
        if inner.index.get(&key) == Some(&job.id) {
            inner.index.remove(&key);
        }
        if let Some(partition) = inner.partitions.get_mut(&job.host) {
            partition.retain(|(id, _)| *id != job.id);
        }
    }

    pub fn cancel(&self, job: &Job) {
        self.on_terminal(job);
    }

    /// Reinsert a released job, preserving FIFO by `created_at` within its
    /// host partition. Used by orphan reclaim.
    pub fn requeue(&self, job: &Job) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.index.insert(job.idem_key(), job.id);
        let partition = inner.partitions.entry(job.host.clone()).or_default();
        if partition.iter().any(|(id, _)| *id == job.id) {
            return;
        }
        let at = partition
            .iter()
            .position(|(_, created)| *created > job.created_at)
            .unwrap_or(partition.len());
        partition.insert(at, (job.id, job.created_at));
    }

    pub fn pending_count(&self, host: &str) -> usize {
        let inner = self.inner.lock().expect("queue lock poisoned");
        inner.partitions.get(host).map_or(0, |p| p.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
