//! Agent lifecycle: registration, heartbeat bookkeeping, derived liveness.
//!
//! No status machine is persisted. Liveness derives from `last_heartbeat_at`
//! at read time, which keeps heartbeats to a single timestamp write. The
//! sweep only logs transitions so operators can see agents going dark.

use chrono::Duration;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::agent::{Agent, StatusReport};
use crate::clock::Clock;
use crate::error::Result;
use crate::store::Store;
use crate::types::AgentStatus;

pub const DEFAULT_STALE_AFTER_SECS: i64 = 30;
pub const DEFAULT_OFFLINE_AFTER_SECS: i64 = 120;

/// One row of the hosts listing: the newest registration per hostname.
#[derive(Debug, Clone, Serialize)]
pub struct HostSummary {
    pub hostname: String,
    pub agent_id: Uuid,
    pub status: AgentStatus,
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

pub struct AgentRegistry {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
    offline_after: Duration,
    last_statuses: Mutex<HashMap<Uuid, AgentStatus>>,
}

impl AgentRegistry {
    pub fn new(
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        stale_after: Duration,
        offline_after: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            stale_after,
            offline_after,
            last_statuses: Mutex::new(HashMap::new()),
        }
    }

    /// Register always issues a fresh agent id and bearer token. Older
    /// agents on the same hostname are left alone; their heartbeats age out.
    pub fn register(&self, hostname: &str, capabilities: serde_json::Value) -> Result<Agent> {
        let now = self.clock.now();
        let agent = Agent {
            id: Uuid::new_v4(),
            hostname: hostname.to_string(),
            capabilities,
            registered_at: now,
            last_heartbeat_at: now,
            token: Some(Uuid::new_v4().simple().to_string()),
        };
        self.store.upsert_agent(&agent)?;
        info!(agent = %agent.id, hostname, "agent registered");
        Ok(agent)
    }

    /// Record a heartbeat. Unknown agents surface `AgentUnknown` so the
    /// worker re-registers (e.g. after the store was wiped).
    pub fn heartbeat(&self, agent_id: Uuid, report: &StatusReport) -> Result<Agent> {
        let agent =
            self.store
                .touch_heartbeat(agent_id, self.clock.now(), report.capabilities.clone())?;
        debug!(agent = %agent_id, hostname = %agent.hostname, "heartbeat");
        Ok(agent)
    }

    pub fn get(&self, agent_id: Uuid) -> Result<Option<Agent>> {
        self.store.get_agent(agent_id)
    }

    pub fn status_of(&self, agent: &Agent) -> AgentStatus {
        agent.status(self.clock.now(), self.stale_after, self.offline_after)
    }

    pub fn list(&self) -> Result<Vec<(Agent, AgentStatus)>> {
        let now = self.clock.now();
        let mut agents: Vec<(Agent, AgentStatus)> = self
            .store
            .list_agents()?
            .into_iter()
            .map(|a| {
                let status = a.status(now, self.stale_after, self.offline_after);
                (a, status)
            })
            .collect();
        agents.sort_by(|a, b| a.0.hostname.cmp(&b.0.hostname));
        Ok(agents)
    }

    /// One summary per hostname; the newest registration wins the row.
    pub fn hosts(&self) -> Result<Vec<HostSummary>> {
        let now = self.clock.now();
        let mut latest: HashMap<String, Agent> = HashMap::new();
        for agent in self.store.list_agents()? {
            match latest.get(&agent.hostname) {
                Some(existing) if existing.registered_at >= agent.registered_at => {}
                _ => {
                    latest.insert(agent.hostname.clone(), agent);
                }
            }
        }
        let mut hosts: Vec<HostSummary> = latest
            .into_values()
            .map(|a| HostSummary {
                status: a.status(now, self.stale_after, self.offline_after),
                hostname: a.hostname,
                agent_id: a.id,
                last_seen: a.last_heartbeat_at,
            })
            .collect();
        hosts.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        Ok(hosts)
    }

    /// Liveness sweep: log agents whose derived status changed since the
    /// last pass.
    pub fn sweep(&self) -> Result<()> {
        let now = self.clock.now();
        let mut last = self.last_statuses.lock().expect("registry lock poisoned");
        for agent in self.store.list_agents()? {
            let status = agent.status(now, self.stale_after, self.offline_after);
            let previous = last.insert(agent.id, status);
            if let Some(previous) = previous {
                if previous != status {
                    info!(
                        agent = %agent.id,
                        hostname = %agent.hostname,
                        from = %previous,
                        to = %status,
                        "agent liveness changed"
                    );
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;
    use tempfile::TempDir;

    fn make_registry(dir: &TempDir) -> (AgentRegistry, ManualClock) {
        let store = Arc::new(Store::open(&dir.path().join("registry.redb")).unwrap());
        let clock = ManualClock::new(Utc::now());
        let registry = AgentRegistry::new(
            store,
            Arc::new(clock.clone()),
            Duration::seconds(DEFAULT_STALE_AFTER_SECS),
            Duration::seconds(DEFAULT_OFFLINE_AFTER_SECS),
        );
        (registry, clock)
    }

    #[test]
    fn register_issues_fresh_id_and_token() {
        let dir = TempDir::new().unwrap();
        let (registry, _) = make_registry(&dir);
        let a = registry.register("web-01", serde_json::json!({})).unwrap();
        let b = registry.register("web-01", serde_json::json!({})).unwrap();
        assert_ne!(a.id, b.id);
        assert!(a.token.is_some());
        // Both registrations remain; neither is deleted.
        assert_eq!(registry.list().unwrap().len(), 2);
    }

    #[test]
    fn heartbeat_unknown_agent() {
        let dir = TempDir::new().unwrap();
        let (registry, _) = make_registry(&dir);
        let err = registry
            .heartbeat(Uuid::new_v4(), &StatusReport::default())
            .unwrap_err();
        assert!(matches!(err, crate::DeployError::AgentUnknown(_)));
    }

    #[test]
    fn status_derives_from_heartbeat_age() {
        let dir = TempDir::new().unwrap();
        let (registry, clock) = make_registry(&dir);
        let agent = registry.register("web-01", serde_json::json!({})).unwrap();

        assert_eq!(registry.status_of(&agent), AgentStatus::Online);
        clock.advance(Duration::seconds(31));
        assert_eq!(registry.status_of(&agent), AgentStatus::Stale);
        clock.advance(Duration::seconds(100));
        assert_eq!(registry.status_of(&agent), AgentStatus::Offline);

        // A heartbeat brings it back.
        let agent = registry.heartbeat(agent.id, &StatusReport::default()).unwrap();
        assert_eq!(registry.status_of(&agent), AgentStatus::Online);
    }

    #[test]
    fn hosts_reports_newest_registration_per_hostname() {
        let dir = TempDir::new().unwrap();
        let (registry, clock) = make_registry(&dir);
        let _old = registry.register("web-01", serde_json::json!({})).unwrap();
        clock.advance(Duration::seconds(5));
        let new = registry.register("web-01", serde_json::json!({})).unwrap();
        registry.register("web-02", serde_json::json!({})).unwrap();

        let hosts = registry.hosts().unwrap();
        assert_eq!(hosts.len(), 2);
        let web01 = hosts.iter().find(|h| h.hostname == "web-01").unwrap();
        assert_eq!(web01.agent_id, new.id);
    }

    #[test]
    fn sweep_tracks_transitions_without_error() {
        let dir = TempDir::new().unwrap();
        let (registry, clock) = make_registry(&dir);
        registry.register("web-01", serde_json::json!({})).unwrap();
        registry.sweep().unwrap();
        clock.advance(Duration::seconds(200));
        registry.sweep().unwrap();
    }
}
