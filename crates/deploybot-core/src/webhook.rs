//! GitHub push ingress: verify the HMAC signature, expand the push into one
//! job per bound host, and absorb idempotency collisions silently. Repeated
//! deliveries of the same push are the webhook contract's normal case.

use ring::hmac;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::bindings::ConfigLoader;
use crate::clock::Clock;
use crate::error::{DeployError, Result};
use crate::job::JobCreate;
use crate::queue::JobQueue;

// ---------------------------------------------------------------------------
// Signature verification
// ---------------------------------------------------------------------------

/// Verify a `sha256=<hex>` signature header over the raw body.
/// `ring::hmac::verify` compares in constant time; no byte of the digest
/// short-circuits the check.
pub fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> Result<()> {
    let header = header.ok_or(DeployError::SignatureInvalid)?;
    let digest = header
        .strip_prefix("sha256=")
        .ok_or(DeployError::SignatureInvalid)?;
    let provided = hex::decode(digest).map_err(|_| DeployError::SignatureInvalid)?;
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hmac::verify(&key, body, &provided).map_err(|_| DeployError::SignatureInvalid)
}

/// Produce the signature header value GitHub would send for `body`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let tag = hmac::sign(&key, body);
    format!("sha256={}", hex::encode(tag.as_ref()))
}

/// `refs/heads/main` → `main`; anything else passes through.
pub fn branch_from_ref(git_ref: &str) -> &str {
    git_ref.strip_prefix("refs/heads/").unwrap_or(git_ref)
}

// ---------------------------------------------------------------------------
// Push event payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PushRepository {
    pub full_name: String,
    #[serde(default)]
    pub clone_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushCommit {
    pub id: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub repository: PushRepository,
    /// The pushed commit sha; jobs deploy this exact commit.
    pub after: String,
    #[serde(default)]
    pub head_commit: Option<PushCommit>,
}

// ---------------------------------------------------------------------------
// WebhookTranslator
// ---------------------------------------------------------------------------

pub struct WebhookTranslator {
    secret: String,
    bindings: Arc<ConfigLoader>,
    queue: Arc<JobQueue>,
    clock: Arc<dyn Clock>,
}

impl WebhookTranslator {
    pub fn new(
        secret: String,
        bindings: Arc<ConfigLoader>,
        queue: Arc<JobQueue>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            secret,
            bindings,
            queue,
            clock,
        }
    }

    /// Turn one webhook delivery into jobs.
    ///
    /// Signature failure aborts with no side effects. Non-push events are
    /// acknowledged with an empty id list. Hosts are deduplicated within the
    /// call; duplicates across deliveries fall to the idempotency guard and
    /// are skipped silently. Returns the ids actually created.
    pub fn ingest(
        &self,
        body: &[u8],
        signature_header: Option<&str>,
        event_type: Option<&str>,
    ) -> Result<Vec<Uuid>> {
        verify_signature(&self.secret, body, signature_header)?;

        if event_type.is_some_and(|t| t != "push") {
            debug!(event = event_type.unwrap_or(""), "ignoring non-push event");
            return Ok(Vec::new());
        }
        let event: PushEvent = serde_json::from_slice(body)?;
        let repo = event.repository.full_name.as_str();
        let branch = branch_from_ref(&event.git_ref);

        let mut created = Vec::new();
        let mut seen_hosts: HashSet<String> = HashSet::new();
        for binding in self.bindings.matching(repo, branch) {
            for host in binding.hosts {
                if !seen_hosts.insert(host.clone()) {
                    continue;
                }
                let payload = serde_json::json!({
                    "branch": branch,
                    "commit_message": event
                        .head_commit
                        .as_ref()
                        .map(|c| c.message.as_str())
                        .unwrap_or(""),
                    "clone_url": event.repository.clone_url,
                    "trigger": "github_webhook",
                });
                let create = JobCreate {
                    repo: repo.to_string(),
                    git_ref: event.after.clone(),
                    host,
                    payload,
                };
                match self.queue.enqueue(create, self.clock.now()) {
                    Ok(job) => created.push(job.id),
                    Err(DeployError::DuplicateIdempotency(key)) => {
                        debug!(%key, "push already enqueued; skipping");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        info!(repo, branch, jobs = created.len(), "webhook processed");
        Ok(created)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
