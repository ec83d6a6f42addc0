//! Durable persistence for agents, jobs, log chunks, and chat sessions
//! using redb.
//!
//! # Table design
//!
//! Entities are JSON-encoded values under byte keys:
//!
//! - `agents`, `jobs`, `chat_sessions`: 16-byte uuid keys.
//! - `job_index`: `repo \0 ref \0 host` → job uuid. Holds exactly the
//!   non-terminal jobs, so a single point lookup enforces the
//!   one-non-terminal-job-per-key invariant inside the insert transaction.
//! - `logs`: 24-byte composite key `[ job uuid (16) | sequence u64 BE (8) ]`.
//!   Byte ordering equals sequence ordering within a job, so
//!   `read_logs(job, from)` is one range scan with no post-filtering.
//! - `chat_messages`: 40-byte composite `[ session uuid | millis BE | msg uuid ]`
//!   for per-session chronological range scans.
//!
//! Every mutating operation is a single write transaction; redb serializes
//! write transactions, which is what linearizes racing `claim_job` calls.
//! Commits are durable before the call returns.

use chrono::{DateTime, Duration, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use uuid::Uuid;

use crate::agent::Agent;
use crate::error::{DeployError, Result};
use crate::job::{IdemKey, Job};
use crate::chat::{ChatMessage, ChatSession};
use crate::logbroker::LogChunk;
use crate::types::JobStatus;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const AGENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("agents");
const JOBS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("jobs");
const JOB_INDEX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("job_index");
const LOGS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("logs");
const CHAT_SESSIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("chat_sessions");
const CHAT_MESSAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("chat_messages");

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn index_key(key: &IdemKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.repo.len() + key.git_ref.len() + key.host.len() + 2);
    out.extend_from_slice(key.repo.as_bytes());
    out.push(0);
    out.extend_from_slice(key.git_ref.as_bytes());
    out.push(0);
    out.extend_from_slice(key.host.as_bytes());
    out
}

fn log_key(job_id: Uuid, sequence: u64) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..16].copy_from_slice(job_id.as_bytes());
    key[16..].copy_from_slice(&sequence.to_be_bytes());
    key
}

fn message_key(session_id: Uuid, ts: DateTime<Utc>, message_id: Uuid) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..16].copy_from_slice(session_id.as_bytes());
    let ms = ts.timestamp_millis().max(0) as u64;
    key[16..24].copy_from_slice(&ms.to_be_bytes());
    key[24..].copy_from_slice(message_id.as_bytes());
    key
}

fn store_err(e: impl std::fmt::Display) -> DeployError {
    DeployError::Store(e.to_string())
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// The non-terminal jobs found at startup. `pending` is in `created_at`
/// order and includes jobs released from orphaned assignments; `running`
/// keeps its assignment and remains claimable only by the original agent's
/// eventual ack.
#[derive(Debug, Default)]
pub struct Recovery {
    pub pending: Vec<Job>,
    pub running: Vec<Job>,
    pub reassigned: usize,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct Store {
    db: Database,
}

impl Store {
    /// Open or create the database at `path`, ensuring all tables exist
    /// before any reads.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(store_err)?;
        let wt = db.begin_write().map_err(store_err)?;
        wt.open_table(AGENTS).map_err(store_err)?;
        wt.open_table(JOBS).map_err(store_err)?;
        wt.open_table(JOB_INDEX).map_err(store_err)?;
        wt.open_table(LOGS).map_err(store_err)?;
        wt.open_table(CHAT_SESSIONS).map_err(store_err)?;
        wt.open_table(CHAT_MESSAGES).map_err(store_err)?;
        wt.commit().map_err(store_err)?;
        Ok(Self { db })
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    pub fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        let value = serde_json::to_vec(agent)?;
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(AGENTS).map_err(store_err)?;
            table
                .insert(agent.id.as_bytes().as_slice(), value.as_slice())
                .map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    pub fn get_agent(&self, id: Uuid) -> Result<Option<Agent>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(AGENTS).map_err(store_err)?;
        match table.get(id.as_bytes().as_slice()).map_err(store_err)? {
            Some(raw) => Ok(Some(serde_json::from_slice(raw.value())?)),
            None => Ok(None),
        }
    }

    /// Update `last_heartbeat_at` (and capabilities when supplied) for one
    /// agent. Returns the updated agent, or `AgentUnknown` so the worker
    /// knows to re-register.
    pub fn touch_heartbeat(
        &self,
        id: Uuid,
        ts: DateTime<Utc>,
        capabilities: Option<serde_json::Value>,
    ) -> Result<Agent> {
        let wt = self.db.begin_write().map_err(store_err)?;
        let agent = {
            let mut table = wt.open_table(AGENTS).map_err(store_err)?;
            let mut agent: Agent = match table.get(id.as_bytes().as_slice()).map_err(store_err)? {
                Some(raw) => serde_json::from_slice(raw.value())?,
                None => return Err(DeployError::AgentUnknown(id.to_string())),
            };
            agent.last_heartbeat_at = ts;
            if let Some(caps) = capabilities {
                agent.capabilities = caps;
            }
            let value = serde_json::to_vec(&agent)?;
            table
                .insert(id.as_bytes().as_slice(), value.as_slice())
                .map_err(store_err)?;
            agent
        };
        wt.commit().map_err(store_err)?;
        Ok(agent)
    }

    pub fn list_agents(&self) -> Result<Vec<Agent>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(AGENTS).map_err(store_err)?;
        let mut agents = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (_, raw) = entry.map_err(store_err)?;
            agents.push(serde_json::from_slice(raw.value())?);
        }
        Ok(agents)
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Insert a new pending job. Fails with `DuplicateIdempotency` if a
    /// non-terminal job with the same (repo, ref, host) exists; the check and
    /// the insert share one write transaction.
    pub fn insert_job(&self, job: &Job) -> Result<()> {
        let key = index_key(&job.idem_key());
        let value = serde_json::to_vec(job)?;
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut jobs = wt.open_table(JOBS).map_err(store_err)?;
            let mut index = wt.open_table(JOB_INDEX).map_err(store_err)?;

            let existing = match index.get(key.as_slice()).map_err(store_err)? {
                Some(raw) => Some(Uuid::from_slice(raw.value()).map_err(store_err)?),
                None => None,
            };
            if let Some(existing_id) = existing {
                let active = match jobs
                    .get(existing_id.as_bytes().as_slice())
                    .map_err(store_err)?
                {
                    Some(raw) => {
                        let existing: Job = serde_json::from_slice(raw.value())?;
                        !existing.status.is_terminal()
                    }
                    None => false,
                };
                if active {
                    return Err(DeployError::DuplicateIdempotency(job.idem_key().to_string()));
                }
            }

            jobs.insert(job.id.as_bytes().as_slice(), value.as_slice())
                .map_err(store_err)?;
            index
                .insert(key.as_slice(), job.id.as_bytes().as_slice())
                .map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    pub fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(JOBS).map_err(store_err)?;
        match table.get(id.as_bytes().as_slice()).map_err(store_err)? {
            Some(raw) => Ok(Some(serde_json::from_slice(raw.value())?)),
            None => Ok(None),
        }
    }

    /// All jobs, oldest first, optionally filtered by status.
    pub fn list_jobs(&self, filter: Option<JobStatus>) -> Result<Vec<Job>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(JOBS).map_err(store_err)?;
        let mut jobs: Vec<Job> = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (_, raw) = entry.map_err(store_err)?;
            let job: Job = serde_json::from_slice(raw.value())?;
            if filter.is_none_or(|f| job.status == f) {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    /// Conditional pending→running transition. Exactly one of any set of
    /// racing callers succeeds; the rest see `NotClaimable`.
    pub fn claim_job(&self, job_id: Uuid, agent_id: Uuid, ts: DateTime<Utc>) -> Result<Job> {
        let wt = self.db.begin_write().map_err(store_err)?;
        let job = {
            let mut jobs = wt.open_table(JOBS).map_err(store_err)?;
            let mut job: Job = match jobs.get(job_id.as_bytes().as_slice()).map_err(store_err)? {
                Some(raw) => serde_json::from_slice(raw.value())?,
                None => return Err(DeployError::JobNotFound(job_id.to_string())),
            };
            if job.status != JobStatus::Pending {
                return Err(DeployError::NotClaimable(job_id.to_string()));
            }
            job.status = JobStatus::Running;
            job.assigned_agent_id = Some(agent_id);
            job.assigned_at = Some(ts);
            let value = serde_json::to_vec(&job)?;
            jobs.insert(job_id.as_bytes().as_slice(), value.as_slice())
                .map_err(store_err)?;
            job
        };
        wt.commit().map_err(store_err)?;
        Ok(job)
    }

    /// Conditional running→{success,failed} transition.
    ///
    /// When `expected_agent` is set, the stored assignment must match or the
    /// call fails with `NotAssignedToYou`. Re-acking an identical
    /// (status, detail) pair is a no-op returning the stored job; any other
    /// ack of a terminal job fails with `AlreadyTerminal`.
    pub fn complete_job(
        &self,
        job_id: Uuid,
        terminal: JobStatus,
        detail: Option<serde_json::Value>,
        expected_agent: Option<Uuid>,
        ts: DateTime<Utc>,
    ) -> Result<Job> {
        if !matches!(terminal, JobStatus::Success | JobStatus::Failed) {
            return Err(DeployError::InvalidStatus(terminal.to_string()));
        }
        let wt = self.db.begin_write().map_err(store_err)?;
        let job = {
            let mut jobs = wt.open_table(JOBS).map_err(store_err)?;
            let mut index = wt.open_table(JOB_INDEX).map_err(store_err)?;
            let mut job: Job = match jobs.get(job_id.as_bytes().as_slice()).map_err(store_err)? {
                Some(raw) => serde_json::from_slice(raw.value())?,
                None => return Err(DeployError::JobNotFound(job_id.to_string())),
            };
            if job.status.is_terminal() {
                if job.status == terminal && job.result == detail {
                    // Idempotent re-ack.
                    return Ok(job);
                }
                return Err(DeployError::AlreadyTerminal(job_id.to_string()));
            }
            if job.status != JobStatus::Running {
                return Err(DeployError::NotClaimable(job_id.to_string()));
            }
            if let Some(expected) = expected_agent {
                if job.assigned_agent_id != Some(expected) {
                    return Err(DeployError::NotAssignedToYou {
                        job: job_id.to_string(),
                        agent: expected.to_string(),
                    });
                }
            }
            job.status = terminal;
            job.completed_at = Some(ts);
            job.error = if terminal == JobStatus::Failed {
                detail.as_ref().map(detail_text)
            } else {
                None
            };
            job.result = detail;
            let value = serde_json::to_vec(&job)?;
            jobs.insert(job_id.as_bytes().as_slice(), value.as_slice())
                .map_err(store_err)?;
            remove_index_entry(&mut index, &job)?;
            job
        };
        wt.commit().map_err(store_err)?;
        Ok(job)
    }

    /// Cancel from pending or running. Terminal jobs fail with
    /// `AlreadyTerminal`.
    pub fn cancel_job(&self, job_id: Uuid, ts: DateTime<Utc>) -> Result<Job> {
        let wt = self.db.begin_write().map_err(store_err)?;
        let job = {
            let mut jobs = wt.open_table(JOBS).map_err(store_err)?;
            let mut index = wt.open_table(JOB_INDEX).map_err(store_err)?;
            let mut job: Job = match jobs.get(job_id.as_bytes().as_slice()).map_err(store_err)? {
                Some(raw) => serde_json::from_slice(raw.value())?,
                None => return Err(DeployError::JobNotFound(job_id.to_string())),
            };
            if job.status.is_terminal() {
                return Err(DeployError::AlreadyTerminal(job_id.to_string()));
            }
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(ts);
            let value = serde_json::to_vec(&job)?;
            jobs.insert(job_id.as_bytes().as_slice(), value.as_slice())
                .map_err(store_err)?;
            remove_index_entry(&mut index, &job)?;
            job
        };
        wt.commit().map_err(store_err)?;
        Ok(job)
    }

    /// Return a running job to pending with a cleared assignment. Used by
    /// orphan reclaim; the idempotency index entry stays (the job is still
    /// non-terminal).
    pub fn release_job(&self, job_id: Uuid) -> Result<Job> {
        let wt = self.db.begin_write().map_err(store_err)?;
        let job = {
            let mut jobs = wt.open_table(JOBS).map_err(store_err)?;
            let mut job: Job = match jobs.get(job_id.as_bytes().as_slice()).map_err(store_err)? {
                Some(raw) => serde_json::from_slice(raw.value())?,
                None => return Err(DeployError::JobNotFound(job_id.to_string())),
            };
            if job.status != JobStatus::Running {
                return Err(DeployError::NotClaimable(job_id.to_string()));
            }
            job.status = JobStatus::Pending;
            job.assigned_agent_id = None;
            job.assigned_at = None;
            let value = serde_json::to_vec(&job)?;
            jobs.insert(job_id.as_bytes().as_slice(), value.as_slice())
                .map_err(store_err)?;
            job
        };
        wt.commit().map_err(store_err)?;
        Ok(job)
    }

    /// Enumerate non-terminal jobs at startup. Running jobs whose assignment
    /// is older than `orphan_timeout` are released back to pending here;
    /// heartbeat history did not survive the restart, so age alone decides.
    pub fn recover(&self, orphan_timeout: Duration, now: DateTime<Utc>) -> Result<Recovery> {
        let mut recovery = Recovery::default();
        for job in self.list_jobs(None)? {
            match job.status {
                JobStatus::Pending => recovery.pending.push(job),
                JobStatus::Running => {
                    let orphaned = job
                        .assigned_at
                        .map(|at| now - at > orphan_timeout)
                        .unwrap_or(true);
                    if orphaned {
                        tracing::warn!(
                            job = %job.id,
                            host = %job.host,
                            agent = ?job.assigned_agent_id,
                            "reassigning orphaned running job to pending"
                        );
                        let released = self.release_job(job.id)?;
                        recovery.reassigned += 1;
                        recovery.pending.push(released);
                    } else {
                        recovery.running.push(job);
                    }
                }
                _ => {}
            }
        }
        recovery
            .pending
            .sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(recovery)
    }

    // -----------------------------------------------------------------------
    // Logs
    // -----------------------------------------------------------------------

    pub fn append_log(&self, chunk: &LogChunk) -> Result<()> {
        let key = log_key(chunk.job_id, chunk.sequence);
        let value = serde_json::to_vec(chunk)?;
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(LOGS).map_err(store_err)?;
            table
                .insert(key.as_slice(), value.as_slice())
                .map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    /// Persisted chunks for `job_id` with sequence >= `from_sequence`, in
    /// sequence order.
    pub fn read_logs(&self, job_id: Uuid, from_sequence: u64) -> Result<Vec<LogChunk>> {
        let lo = log_key(job_id, from_sequence);
        let hi = log_key(job_id, u64::MAX);
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(LOGS).map_err(store_err)?;
        let mut chunks = Vec::new();
        for entry in table
            .range::<&[u8]>(lo.as_slice()..=hi.as_slice())
            .map_err(store_err)?
        {
            let (_, raw) = entry.map_err(store_err)?;
            chunks.push(serde_json::from_slice(raw.value())?);
        }
        Ok(chunks)
    }

    // -----------------------------------------------------------------------
    // Chat sessions (opaque to the dispatch plane)
    // -----------------------------------------------------------------------

    pub fn upsert_chat_session(&self, session: &ChatSession) -> Result<()> {
        let value = serde_json::to_vec(session)?;
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(CHAT_SESSIONS).map_err(store_err)?;
            table
                .insert(session.id.as_bytes().as_slice(), value.as_slice())
                .map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    pub fn get_chat_session(&self, id: Uuid) -> Result<Option<ChatSession>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(CHAT_SESSIONS).map_err(store_err)?;
        match table.get(id.as_bytes().as_slice()).map_err(store_err)? {
            Some(raw) => Ok(Some(serde_json::from_slice(raw.value())?)),
            None => Ok(None),
        }
    }

    /// One user's sessions, newest-activity first.
    pub fn list_chat_sessions(
        &self,
        user_id: &str,
        include_archived: bool,
    ) -> Result<Vec<ChatSession>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(CHAT_SESSIONS).map_err(store_err)?;
        let mut sessions: Vec<ChatSession> = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (_, raw) = entry.map_err(store_err)?;
            let session: ChatSession = serde_json::from_slice(raw.value())?;
            if session.user_id == user_id && (include_archived || !session.archived) {
                sessions.push(session);
            }
        }
        sessions.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(sessions)
    }

    /// Archive stamps `archived_at`; unarchive clears it.
    pub fn set_chat_archived(
        &self,
        id: Uuid,
        archived: bool,
        ts: DateTime<Utc>,
    ) -> Result<ChatSession> {
        let wt = self.db.begin_write().map_err(store_err)?;
        let session = {
            let mut table = wt.open_table(CHAT_SESSIONS).map_err(store_err)?;
            let mut session: ChatSession =
                match table.get(id.as_bytes().as_slice()).map_err(store_err)? {
                    Some(raw) => serde_json::from_slice(raw.value())?,
                    None => return Err(DeployError::SessionNotFound(id.to_string())),
                };
            session.archived = archived;
            session.archived_at = if archived { Some(ts) } else { None };
            let value = serde_json::to_vec(&session)?;
            table
                .insert(id.as_bytes().as_slice(), value.as_slice())
                .map_err(store_err)?;
            session
        };
        wt.commit().map_err(store_err)?;
        Ok(session)
    }

    /// Delete a session and all of its messages.
    pub fn delete_chat_session(&self, id: Uuid) -> Result<()> {
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut sessions = wt.open_table(CHAT_SESSIONS).map_err(store_err)?;
            if sessions
                .remove(id.as_bytes().as_slice())
                .map_err(store_err)?
                .is_none()
            {
                return Err(DeployError::SessionNotFound(id.to_string()));
            }
            let mut messages = wt.open_table(CHAT_MESSAGES).map_err(store_err)?;
            let (lo, hi) = session_message_bounds(id);
            let keys: Vec<Vec<u8>> = messages
                .range::<&[u8]>(lo.as_slice()..=hi.as_slice())
                .map_err(store_err)?
                .map(|entry| entry.map(|(k, _)| k.value().to_vec()).map_err(store_err))
                .collect::<Result<_>>()?;
            for key in keys {
                messages.remove(key.as_slice()).map_err(store_err)?;
            }
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    /// Append a message and bump the session's activity timestamp in the
    /// same transaction.
    pub fn append_chat_message(&self, message: &ChatMessage) -> Result<()> {
        let key = message_key(message.session_id, message.created_at, message.id);
        let value = serde_json::to_vec(message)?;
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut sessions = wt.open_table(CHAT_SESSIONS).map_err(store_err)?;
            let mut session: ChatSession = match sessions
                .get(message.session_id.as_bytes().as_slice())
                .map_err(store_err)?
            {
                Some(raw) => serde_json::from_slice(raw.value())?,
                None => {
                    return Err(DeployError::SessionNotFound(message.session_id.to_string()))
                }
            };
            session.last_activity_at = message.created_at;
            let session_value = serde_json::to_vec(&session)?;
            sessions
                .insert(
                    message.session_id.as_bytes().as_slice(),
                    session_value.as_slice(),
                )
                .map_err(store_err)?;

            let mut messages = wt.open_table(CHAT_MESSAGES).map_err(store_err)?;
            messages
                .insert(key.as_slice(), value.as_slice())
                .map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    /// Messages for one session in chronological order.
    pub fn list_chat_messages(&self, session_id: Uuid) -> Result<Vec<ChatMessage>> {
        let (lo, hi) = session_message_bounds(session_id);
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(CHAT_MESSAGES).map_err(store_err)?;
        let mut messages = Vec::new();
        for entry in table
            .range::<&[u8]>(lo.as_slice()..=hi.as_slice())
            .map_err(store_err)?
        {
            let (_, raw) = entry.map_err(store_err)?;
            messages.push(serde_json::from_slice(raw.value())?);
        }
        Ok(messages)
    }
}

/// Inclusive range bounds covering every message key for a session.
fn session_message_bounds(session_id: Uuid) -> ([u8; 40], [u8; 40]) {
    let mut lo = [0u8; 40];
    lo[..16].copy_from_slice(session_id.as_bytes());
    let mut hi = [0xffu8; 40];
    hi[..16].copy_from_slice(session_id.as_bytes());
    (lo, hi)
}

fn detail_text(detail: &serde_json::Value) -> String {
    match detail {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn remove_index_entry(
    index: &mut redb::Table<'_, &'static [u8], &'static [u8]>,
    job: &Job,
) -> Result<()> {
    let key = index_key(&job.idem_key());
    let owned = match index.get(key.as_slice()).map_err(store_err)? {
        Some(raw) => raw.value() == job.id.as_bytes().as_slice(),
        None => false,
    };
    if owned {
        index.remove(key.as_slice()).map_err(store_err)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
