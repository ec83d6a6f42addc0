//! Matches heartbeats to pending jobs and drives every job state
//! transition: claim on offer, terminal on worker ack or admin cancel, and
//! the orphan reclaim that returns work whose agent went dark.

use chrono::Duration;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::Result;
use crate::job::Job;
use crate::logbroker::LogBroker;
use crate::queue::JobQueue;
use crate::registry::AgentRegistry;
use crate::store::Store;
use crate::types::{AgentStatus, JobStatus};

pub const DEFAULT_ORPHAN_TIMEOUT_SECS: i64 = 3600;

pub struct Dispatcher {
    store: Arc<Store>,
    queue: Arc<JobQueue>,
    broker: Arc<LogBroker>,
    registry: Arc<AgentRegistry>,
    clock: Arc<dyn Clock>,
    orphan_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<JobQueue>,
        broker: Arc<LogBroker>,
        registry: Arc<AgentRegistry>,
        clock: Arc<dyn Clock>,
        orphan_timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            broker,
            registry,
            clock,
            orphan_timeout,
        }
    }

    /// Called per heartbeat: at most one job is handed to the agent, claimed
    /// atomically through the store.
    pub fn offer(&self, hostname: &str, agent_id: Uuid) -> Result<Option<Job>> {
        let job = self.queue.try_claim(hostname, agent_id, self.clock.now())?;
        if let Some(job) = &job {
            info!(job = %job.id, agent = %agent_id, hostname, "job assigned");
        }
        Ok(job)
    }

    /// Worker ack of a terminal outcome. The store verifies the job is
    /// running and assigned to `agent_id`; an identical re-ack is a no-op.
    pub fn on_complete(
        &self,
        agent_id: Uuid,
        job_id: Uuid,
        terminal: JobStatus,
        detail: Option<serde_json::Value>,
    ) -> Result<Job> {
        let job = self
            .store
            .complete_job(job_id, terminal, detail, Some(agent_id), self.clock.now())?;
        self.queue.on_terminal(&job);
        self.broker.close(job.id);
        info!(job = %job.id, status = %job.status, agent = %agent_id, "job completed");
        Ok(job)
    }

    /// Admin cancel. Works from pending or running; a running worker is not
    /// preempted, its eventual ack sees `AlreadyTerminal`.
    pub fn cancel(&self, job_id: Uuid) -> Result<Job> {
        let job = self.store.cancel_job(job_id, self.clock.now())?;
        self.queue.cancel(&job);
        self.broker.close(job.id);
        info!(job = %job.id, "job cancelled");
        Ok(job)
    }

    /// Return running jobs whose worker is presumed dead to pending: the
    /// assignment must be older than the orphan timeout AND the assigned
    /// agent derived offline. Released jobs re-enter their host partition in
    /// `created_at` order.
    pub fn reclaim_orphans(&self) -> Result<Vec<Job>> {
        let now = self.clock.now();
        let mut reclaimed = Vec::new();
        for job in self.store.list_jobs(Some(JobStatus::Running))? {
            let expired = job
                .assigned_at
                .map(|at| now - at > self.orphan_timeout)
                .unwrap_or(true);
            if !expired {
                continue;
            }
            let agent_alive = match job.assigned_agent_id {
                Some(agent_id) => self
                    .registry
                    .get(agent_id)?
                    .map(|a| self.registry.status_of(&a) != AgentStatus::Offline)
                    .unwrap_or(false),
                None => false,
            };
            if agent_alive {
                continue;
            }
            warn!(
                job = %job.id,
                host = %job.host,
                agent = ?job.assigned_agent_id,
                "reclaiming orphaned job"
            );
            let released = self.store.release_job(job.id)?;
            self.queue.requeue(&released);
            reclaimed.push(released);
        }
        Ok(reclaimed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
