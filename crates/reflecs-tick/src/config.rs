//! Scheduler configuration.

use serde::{Deserialize, Serialize};

/// Worker pool settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads for parallel stages. `0` lets rayon pick.
    pub worker_threads: usize,
    /// When false every system runs serially on the calling thread.
    pub parallel: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            parallel: true,
        }
    }
}

impl SchedulerConfig {
    /// Defaults overridden by `REFLECS_WORKERS` and `REFLECS_PARALLEL`.
    /// Unparseable values are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`.
    #[must_use]
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(workers) = lookup("REFLECS_WORKERS").and_then(|v| v.parse().ok()) {
            self.worker_threads = workers;
        }
        if let Some(parallel) = lookup("REFLECS_PARALLEL").and_then(|v| parse_bool(&v)) {
            self.parallel = parallel;
        }
        self
    }
}

/// Accepts `1/0`, `true/false`, `yes/no` and `on/off`.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_overrides() {
        let config = SchedulerConfig::default().with_env(|key| match key {
            "REFLECS_WORKERS" => Some("3".into()),
            "REFLECS_PARALLEL" => Some("off".into()),
            _ => None,
        });
        assert_eq!(config.worker_threads, 3);
        assert!(!config.parallel);
    }

    #[test]
    fn test_bad_env_values_ignored() {
        let config = SchedulerConfig::default().with_env(|key| match key {
            "REFLECS_WORKERS" => Some("many".into()),
            _ => None,
        });
        assert_eq!(config, SchedulerConfig::default());
    }

    #[test]
    fn test_partial_json() {
        let config: SchedulerConfig = serde_json::from_str(r#"{"worker_threads": 2}"#).unwrap();
        assert_eq!(config.worker_threads, 2);
        assert!(config.parallel);
    }
}
