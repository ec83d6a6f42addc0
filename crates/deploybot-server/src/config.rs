use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Controller runtime configuration, loaded from YAML with env overrides.
/// Every field has a default so a bare `deploybot` start works against the
/// current directory; the webhook secret is the one thing that must come
/// from the file or `DEPLOYBOT_WEBHOOK_SECRET`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_bindings_path")]
    pub bindings_path: PathBuf,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: i64,
    #[serde(default = "default_offline_after")]
    pub offline_after_secs: i64,
    #[serde(default = "default_orphan_timeout")]
    pub orphan_timeout_secs: i64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_heartbeat_deadline")]
    pub heartbeat_deadline_secs: u64,
    #[serde(default = "default_ring_capacity")]
    pub log_ring_capacity: usize,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_port() -> u16 {
    8111
}

fn default_db_path() -> PathBuf {
    PathBuf::from("deploybot.redb")
}

fn default_bindings_path() -> PathBuf {
    PathBuf::from("apps.yaml")
}

fn default_stale_after() -> i64 {
    30
}

fn default_offline_after() -> i64 {
    120
}

fn default_orphan_timeout() -> i64 {
    3600
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_heartbeat_deadline() -> u64 {
    15
}

fn default_ring_capacity() -> usize {
    4096
}

fn default_subscriber_buffer() -> usize {
    1024
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            db_path: default_db_path(),
            bindings_path: default_bindings_path(),
            webhook_secret: None,
            stale_after_secs: default_stale_after(),
            offline_after_secs: default_offline_after(),
            orphan_timeout_secs: default_orphan_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            heartbeat_deadline_secs: default_heartbeat_deadline(),
            log_ring_capacity: default_ring_capacity(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

impl ControllerConfig {
    /// Load from `path` (defaults when absent), then apply the
    /// `DEPLOYBOT_WEBHOOK_SECRET` env override.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| anyhow::anyhow!("config unreadable at {}: {e}", p.display()))?;
                serde_yaml::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("malformed config at {}: {e}", p.display()))?
            }
            None => Self::default(),
        };
        if let Ok(secret) = std::env::var("DEPLOYBOT_WEBHOOK_SECRET") {
            if !secret.is_empty() {
                config.webhook_secret = Some(secret);
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.port, 8111);
        assert_eq!(cfg.stale_after_secs, 30);
        assert_eq!(cfg.offline_after_secs, 120);
        assert_eq!(cfg.orphan_timeout_secs, 3600);
        assert_eq!(cfg.sweep_interval_secs, 10);
        assert_eq!(cfg.heartbeat_deadline_secs, 15);
        assert_eq!(cfg.log_ring_capacity, 4096);
        assert_eq!(cfg.subscriber_buffer, 1024);
        assert!(cfg.webhook_secret.is_none());
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let cfg: ControllerConfig =
            serde_yaml::from_str("port: 9000\nwebhook_secret: s3cret\n").unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.webhook_secret.as_deref(), Some("s3cret"));
        assert_eq!(cfg.orphan_timeout_secs, 3600);
    }

    #[test]
    fn roundtrip() {
        let cfg = ControllerConfig::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: ControllerConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.port, cfg.port);
        assert_eq!(back.db_path, cfg.db_path);
    }
}
