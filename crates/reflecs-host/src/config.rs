//! Bridge configuration.
//!
//! Loaded from JSON, then overridden by environment variables:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `REFLECS_WORLD` | `world_name` |
//! | `REFLECS_ROLE` | `role` (`server` / `client`) |
//! | `REFLECS_WORKERS` | `scheduler.worker_threads` |
//! | `REFLECS_PARALLEL` | `scheduler.parallel` |

use reflecs_net::{AuthorityMode, NetRole};
use reflecs_tick::SchedulerConfig;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub world_name: String,
    pub scheduler: SchedulerConfig,
    pub authority: AuthorityMode,
    pub role: NetRole,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            world_name: "reflecs".to_owned(),
            scheduler: SchedulerConfig::default(),
            authority: AuthorityMode::default(),
            role: NetRole::default(),
        }
    }
}

impl BridgeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Defaults overridden by the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`. Unparseable values are ignored.
    #[must_use]
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(name) = lookup("REFLECS_WORLD").filter(|n| !n.trim().is_empty()) {
            self.world_name = name;
        }
        if let Some(role) = lookup("REFLECS_ROLE").and_then(|r| NetRole::parse(&r)) {
            self.role = role;
        }
        self.scheduler = self.scheduler.with_env(&lookup);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.world_name, "reflecs");
        assert_eq!(config.role, NetRole::Server);
        assert_eq!(config.authority, AuthorityMode::ServerAuthoritative);
        assert!(config.scheduler.parallel);
    }

    #[test]
    fn test_partial_json() {
        let config = BridgeConfig::from_json(
            r#"{"role": "client", "authority": "prefer_local", "scheduler": {"worker_threads": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.role, NetRole::Client);
        assert_eq!(config.authority, AuthorityMode::PreferLocal);
        assert_eq!(config.scheduler.worker_threads, 2);
        assert!(config.scheduler.parallel);
        assert_eq!(config.world_name, "reflecs");
    }

    #[test]
    fn test_bad_json() {
        assert!(BridgeConfig::from_json(r#"{"role": "peer"}"#).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let config = BridgeConfig::default().with_env(|key| match key {
            "REFLECS_WORLD" => Some("arena".into()),
            "REFLECS_ROLE" => Some("CLIENT".into()),
            "REFLECS_WORKERS" => Some("4".into()),
            "REFLECS_PARALLEL" => Some("0".into()),
            _ => None,
        });
        assert_eq!(config.world_name, "arena");
        assert_eq!(config.role, NetRole::Client);
        assert_eq!(config.scheduler.worker_threads, 4);
        assert!(!config.scheduler.parallel);
    }

    #[test]
    fn test_bad_env_ignored() {
        let config = BridgeConfig::default().with_env(|key| match key {
            "REFLECS_ROLE" => Some("observer".into()),
            "REFLECS_WORLD" => Some("  ".into()),
            _ => None,
        });
        assert_eq!(config, BridgeConfig::default());
    }
}
