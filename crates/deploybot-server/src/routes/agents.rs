use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use deploybot_core::agent::StatusReport;
use deploybot_core::job::Job;
use deploybot_core::logbroker::LogChunk;
use deploybot_core::types::{ChunkStream, JobStatus};
use deploybot_core::DeployError;

use crate::error::AppError;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// POST /v1/agents/register
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub hostname: String,
    #[serde(default)]
    pub capabilities: serde_json::Value,
}

pub async fn register(
    State(app): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let agent = app.registry.register(&req.hostname, req.capabilities)?;
    Ok(Json(serde_json::json!({
        "agent_id": agent.id,
        "agent_token": agent.token,
    })))
}

// ---------------------------------------------------------------------------
// POST /v1/agents/{agent_id}/heartbeat
// ---------------------------------------------------------------------------

/// What the heartbeat response embeds when a job was claimed.
#[derive(Debug, Serialize)]
pub struct JobOffer {
    pub id: Uuid,
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub payload: serde_json::Value,
    pub assigned_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobOffer {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            repo: job.repo,
            git_ref: job.git_ref,
            payload: job.payload,
            assigned_at: job.assigned_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub acknowledged: bool,
    pub job: Option<JobOffer>,
}

/// Record the heartbeat, then try to claim at most one job for the agent's
/// hostname. The claim attempt runs under the configured deadline; past it
/// the agent gets `job: null` and a late-landing claim is released so the
/// job stays claimable by the next heartbeat.
pub async fn heartbeat(
    State(app): State<AppState>,
    Path(agent_id): Path<Uuid>,
    Json(report): Json<StatusReport>,
) -> Result<Json<HeartbeatResponse>, AppError> {
    let agent = app.registry.heartbeat(agent_id, &report)?;

    let dispatcher = app.dispatcher.clone();
    let hostname = agent.hostname.clone();
    let mut claim =
        tokio::task::spawn_blocking(move || dispatcher.offer(&hostname, agent_id));
    let deadline = std::time::Duration::from_secs(app.config.heartbeat_deadline_secs);

    let job = match tokio::time::timeout(deadline, &mut claim).await {
        Ok(joined) => joined
            .map_err(|e| AppError(anyhow::anyhow!("claim task failed: {e}")))?
            .map_err(AppError::from)?,
        Err(_) => {
            warn!(agent = %agent_id, "heartbeat deadline elapsed; responding without a job");
            let store = app.store.clone();
            let queue = app.queue.clone();
            tokio::spawn(async move {
                if let Ok(Ok(Some(job))) = claim.await {
                    match store.release_job(job.id) {
                        Ok(released) => {
                            queue.requeue(&released);
                            warn!(job = %released.id, "released job claimed past the heartbeat deadline");
                        }
                        Err(e) => warn!(job = %job.id, error = %e, "failed to release late claim"),
                    }
                }
            });
            None
        }
    };

    Ok(Json(HeartbeatResponse {
        acknowledged: true,
        job: job.map(JobOffer::from),
    }))
}

// ---------------------------------------------------------------------------
// POST /v1/agents/{agent_id}/jobs/{job_id} — worker ack
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub status: String,
    #[serde(default)]
    pub detail: Option<serde_json::Value>,
}

/// Worker posts the job outcome. Acking a job that already reached a
/// terminal state is a harmless no-op: 200 with `already_terminal: true`
/// and the stored status.
pub async fn ack(
    State(app): State<AppState>,
    Path((agent_id, job_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<AckRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let terminal = match req.status.as_str() {
        "success" | "succeeded" => JobStatus::Success,
        "failed" | "failure" => JobStatus::Failed,
        other => {
            return Err(AppError::bad_request(format!(
                "unknown ack status '{other}': expected succeeded or failed"
            )))
        }
    };

    match app
        .dispatcher
        .on_complete(agent_id, job_id, terminal, req.detail)
    {
        Ok(job) => Ok(Json(serde_json::json!({
            "ok": true,
            "status": job.status,
            "already_terminal": false,
        }))),
        Err(DeployError::AlreadyTerminal(_)) => {
            let job = app
                .store
                .get_job(job_id)?
                .ok_or_else(|| AppError::not_found(format!("job '{job_id}' not found")))?;
            Ok(Json(serde_json::json!({
                "ok": true,
                "status": job.status,
                "already_terminal": true,
            })))
        }
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/agents/{agent_id}/jobs/{job_id}/logs — chunk ingest
// ---------------------------------------------------------------------------

/// One newline-delimited JSON line of the log ingest body.
#[derive(Debug, Deserialize)]
struct ChunkIngest {
    sequence: u64,
    #[serde(default = "default_stream")]
    stream: ChunkStream,
    data: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

fn default_stream() -> ChunkStream {
    ChunkStream::Stdout
}

pub async fn post_logs(
    State(app): State<AppState>,
    Path((agent_id, job_id)): Path<(Uuid, Uuid)>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let now = app.clock.now();
    let mut chunks = Vec::new();
    for line in body.split(|b| *b == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let ingest: ChunkIngest = serde_json::from_slice(line)
            .map_err(|e| AppError::bad_request(format!("malformed log chunk: {e}")))?;
        chunks.push(LogChunk {
            job_id,
            sequence: ingest.sequence,
            timestamp: ingest.timestamp.unwrap_or(now),
            stream: ingest.stream,
            data: ingest.data,
        });
    }
    debug!(agent = %agent_id, job = %job_id, chunks = chunks.len(), "log chunks received");
    let received = app.broker.publish(job_id, chunks)?;
    Ok(Json(serde_json::json!({ "received": received })))
}
