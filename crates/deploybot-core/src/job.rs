use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::types::JobStatus;

// ---------------------------------------------------------------------------
// IdemKey
// ---------------------------------------------------------------------------

/// The idempotency key: at most one non-terminal job may exist per
/// (repo, ref, host) triple at any time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdemKey {
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub host: String,
}

impl fmt::Display for IdemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.repo, self.git_ref, self.host)
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A single deployment job: what to deploy (repo, ref) and where (host).
/// `payload` is opaque to the dispatch plane; it is stored and forwarded to
/// the worker verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub host: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub status: JobStatus,
    #[serde(default)]
    pub assigned_agent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Completion detail reported by the worker (or admin cancel reason).
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    pub fn new(create: JobCreate, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            repo: create.repo,
            git_ref: create.git_ref,
            host: create.host,
            payload: create.payload,
            status: JobStatus::Pending,
            assigned_agent_id: None,
            created_at: now,
            assigned_at: None,
            completed_at: None,
            result: None,
            error: None,
        }
    }

    pub fn idem_key(&self) -> IdemKey {
        IdemKey {
            repo: self.repo.clone(),
            git_ref: self.git_ref.clone(),
            host: self.host.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// JobCreate
// ---------------------------------------------------------------------------

/// Request shape for creating a job, from the direct API or webhook fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCreate {
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub host: String,
    #[serde(default = "default_payload")]
    pub payload: serde_json::Value,
}

fn default_payload() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl JobCreate {
    pub fn idem_key(&self) -> IdemKey {
        IdemKey {
            repo: self.repo.clone(),
            git_ref: self.git_ref.clone(),
            host: self.host.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn create() -> JobCreate {
        JobCreate {
            repo: "myorg/web".into(),
            git_ref: "abc123".into(),
            host: "web-01".into(),
            payload: serde_json::json!({ "branch": "main" }),
        }
    }

    #[test]
    fn new_job_is_pending_and_unassigned() {
        let job = Job::new(create(), Utc::now());
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.assigned_agent_id.is_none());
        assert!(job.assigned_at.is_none());
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn idem_key_is_repo_ref_host() {
        let job = Job::new(create(), Utc::now());
        let key = job.idem_key();
        assert_eq!(key.repo, "myorg/web");
        assert_eq!(key.git_ref, "abc123");
        assert_eq!(key.host, "web-01");
    }

    #[test]
    fn job_serde_uses_ref_field_name() {
        let job = Job::new(create(), Utc::now());
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["ref"], "abc123");
        assert!(json.get("git_ref").is_none());
        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back.git_ref, "abc123");
    }

    #[test]
    fn payload_round_trips_verbatim() {
        let payload = serde_json::json!({
            "image": "nginx:1.27",
            "env": { "PORT": "8080" },
            "nested": [1, 2, { "deep": true }],
        });
        let mut c = create();
        c.payload = payload.clone();
        let job = Job::new(c, Utc::now());
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.payload, payload);
    }

    #[test]
    fn job_create_defaults_payload_to_empty_object() {
        let raw = r#"{ "repo": "a/b", "ref": "main", "host": "h1" }"#;
        let c: JobCreate = serde_json::from_str(raw).unwrap();
        assert_eq!(c.payload, serde_json::json!({}));
    }
}
