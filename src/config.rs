//! Process configuration.
//!
//! Loaded once at start-up and handed to the engine by value. Call sites read
//! a snapshot through [`Settings::current`]; a write goes through
//! [`Settings::replace`] and is visible to the next reader.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::limits::{DEFAULT_RETRY_ATTEMPTS, MAX_GROUP_DEPTH};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub data_dir: PathBuf,
    pub wal_file: String,
    /// Appends since the last compaction before the compactor rewrites the WAL.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// Attempts made by the optimistic-retry wrapper before giving up.
    pub retry_attempts: u32,
    /// Deepest group nesting resolution will follow.
    pub max_group_depth: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            wal_file: "xronos.wal".into(),
            compact_threshold: 1000,
            metrics_port: None,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            max_group_depth: 32,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl SchedulerConfig {
    /// Read `XRONOS_*` variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("XRONOS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            wal_file: std::env::var("XRONOS_WAL_FILE").unwrap_or(defaults.wal_file),
            compact_threshold: env_parse("XRONOS_COMPACT_THRESHOLD")
                .unwrap_or(defaults.compact_threshold),
            metrics_port: env_parse("XRONOS_METRICS_PORT"),
            retry_attempts: env_parse("XRONOS_RETRY_ATTEMPTS")
                .unwrap_or(defaults.retry_attempts),
            max_group_depth: env_parse("XRONOS_MAX_GROUP_DEPTH")
                .unwrap_or(defaults.max_group_depth),
        }
        .normalized()
    }

    /// Clamp values into the ranges the engine accepts.
    pub fn normalized(mut self) -> Self {
        self.retry_attempts = self.retry_attempts.max(1);
        self.max_group_depth = self.max_group_depth.clamp(1, MAX_GROUP_DEPTH);
        self
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(&self.wal_file)
    }
}

/// Shared, explicitly invalidated handle on the active configuration.
#[derive(Debug)]
pub struct Settings {
    current: RwLock<Arc<SchedulerConfig>>,
}

impl Settings {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config.normalized())),
        }
    }

    pub fn current(&self) -> Arc<SchedulerConfig> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Swap in a new configuration. Snapshots already handed out are unaffected.
    pub fn replace(&self, config: SchedulerConfig) {
        let config = Arc::new(config.normalized());
        match self.current.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
        tracing::info!("settings replaced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_clamps_bounds() {
        let cfg = SchedulerConfig {
            retry_attempts: 0,
            max_group_depth: 10_000,
            ..Default::default()
        }
        .normalized();
        assert_eq!(cfg.retry_attempts, 1);
        assert_eq!(cfg.max_group_depth, MAX_GROUP_DEPTH);
    }

    #[test]
    fn replace_is_seen_by_next_reader() {
        let settings = Settings::new(SchedulerConfig::default());
        let before = settings.current();
        settings.replace(SchedulerConfig {
            retry_attempts: 9,
            ..Default::default()
        });
        assert_eq!(before.retry_attempts, DEFAULT_RETRY_ATTEMPTS);
        assert_eq!(settings.current().retry_attempts, 9);
    }

    #[test]
    fn wal_path_joins_dir_and_file() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.wal_path(), PathBuf::from("./data").join("xronos.wal"));
    }
}
