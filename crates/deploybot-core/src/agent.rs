use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::AgentStatus;

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// A registered worker. Agents are never deleted; an agent whose heartbeats
/// stop simply derives to stale and then offline. Hostname uniqueness is
/// advisory: re-registration issues a fresh id and the newest registration
/// wins ownership of new assignments by winning the claim race.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub hostname: String,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Agent {
    /// Derive liveness from the last heartbeat. No status machine is stored;
    /// this is computed on every read.
    pub fn status(&self, now: DateTime<Utc>, stale_after: Duration, offline_after: Duration) -> AgentStatus {
        let age = now - self.last_heartbeat_at;
        if age <= stale_after {
            AgentStatus::Online
        } else if age <= offline_after {
            AgentStatus::Stale
        } else {
            AgentStatus::Offline
        }
    }
}

// ---------------------------------------------------------------------------
// Heartbeat shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostMetrics {
    #[serde(default)]
    pub cpu_percent: Option<f64>,
    #[serde(default)]
    pub mem_percent: Option<f64>,
    #[serde(default)]
    pub disk_free_gb: Option<f64>,
}

/// One running container/process in the agent's inventory report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryResource {
    pub name: String,
    #[serde(default)]
    pub image: String,
    pub status: String,
    #[serde(default)]
    pub health: Option<String>,
}

/// The worker status report carried by every heartbeat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(default)]
    pub metrics: Option<HostMetrics>,
    #[serde(default)]
    pub inventory: Option<Vec<InventoryResource>>,
    /// When present, replaces the agent's stored capabilities.
    #[serde(default)]
    pub capabilities: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(heartbeat_age_secs: i64) -> (Agent, DateTime<Utc>) {
        let now = Utc::now();
        let agent = Agent {
            id: Uuid::new_v4(),
            hostname: "web-01".into(),
            capabilities: serde_json::json!({ "docker": true }),
            registered_at: now - Duration::hours(1),
            last_heartbeat_at: now - Duration::seconds(heartbeat_age_secs),
            token: None,
        };
        (agent, now)
    }

    fn status_at(age_secs: i64) -> AgentStatus {
        let (a, now) = agent(age_secs);
        a.status(now, Duration::seconds(30), Duration::seconds(120))
    }

    #[test]
    fn fresh_heartbeat_is_online() {
        assert_eq!(status_at(5), AgentStatus::Online);
    }

    #[test]
    fn boundary_heartbeat_is_still_online() {
        assert_eq!(status_at(30), AgentStatus::Online);
    }

    #[test]
    fn aging_heartbeat_is_stale() {
        assert_eq!(status_at(31), AgentStatus::Stale);
        assert_eq!(status_at(120), AgentStatus::Stale);
    }

    #[test]
    fn dead_heartbeat_is_offline() {
        assert_eq!(status_at(121), AgentStatus::Offline);
    }

    #[test]
    fn status_report_all_fields_optional() {
        let report: StatusReport = serde_json::from_str("{}").unwrap();
        assert!(report.metrics.is_none());
        assert!(report.inventory.is_none());
        assert!(report.capabilities.is_none());
    }
}
