//! Configuration for the replay engine.
//!
//! Configuration is passed to [`ReplayEngine::new()`](crate::ReplayEngine::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use replay_engine::config::{ReplayConfig, ProcessingGroupConfig};
//!
//! let config = ReplayConfig {
//!     processing_groups: vec![
//!         ProcessingGroupConfig::switching("organizations", 2),
//!     ],
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplayConfig
//! ├── processing_groups: Vec<ProcessingGroupConfig>
//! │   ├── name
//! │   ├── segment_count              # pull-mode parallelism
//! │   └── processor_type             # switching | push | pull
//! ├── settings: ReplaySettings
//! │   ├── pull: PullConfig           # batch size, poll interval
//! │   └── push: PushConfig
//! └── token_store: TokenStoreConfig  # SQLite segment tokens
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! processing_groups:
//!   - name: "organizations"
//!     segment_count: 2
//!   - name: "audit"
//!     processor_type: push
//!
//! settings:
//!   pull:
//!     batch_size: 100
//!     poll_interval: "100ms"
//!     shutdown_timeout: "10s"
//!
//! token_store:
//!   sqlite_path: "/var/lib/app/segment_tokens.db"
//! ```

use crate::error::{ReplayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed to ReplayEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplayEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplayConfig {
    /// Processing groups run by the engine.
    #[serde(default)]
    pub processing_groups: Vec<ProcessingGroupConfig>,

    /// Tunables for push and pull processing.
    #[serde(default)]
    pub settings: ReplaySettings,

    /// Segment token persistence.
    #[serde(default)]
    pub token_store: TokenStoreConfig,
}

impl ReplayConfig {
    /// Create a minimal config for testing (in-memory token store, fast polling).
    pub fn for_testing(groups: Vec<ProcessingGroupConfig>) -> Self {
        Self {
            processing_groups: groups,
            settings: ReplaySettings {
                pull: PullConfig {
                    batch_size: 16,
                    poll_interval: "5ms".to_string(),
                    shutdown_timeout: "2s".to_string(),
                },
                push: PushConfig {
                    shutdown_timeout: "2s".to_string(),
                },
            },
            token_store: TokenStoreConfig::in_memory(),
        }
    }

    /// Look up a group by name.
    pub fn group(&self, name: &str) -> Option<&ProcessingGroupConfig> {
        self.processing_groups.iter().find(|g| g.name == name)
    }

    /// Check the configuration for errors the engine cannot recover from.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for group in &self.processing_groups {
            if group.name.trim().is_empty() {
                return Err(ReplayError::Config("processing group name must not be empty".to_string()));
            }
            if !seen.insert(group.name.as_str()) {
                return Err(ReplayError::Config(format!(
                    "duplicate processing group: {}",
                    group.name
                )));
            }
            if group.segment_count == 0 {
                return Err(ReplayError::Config(format!(
                    "processing group {} must have at least one segment",
                    group.name
                )));
            }
        }
        if self.settings.pull.batch_size == 0 {
            return Err(ReplayError::Config("pull batch_size must be positive".to_string()));
        }
        parse_duration_field("pull.poll_interval", &self.settings.pull.poll_interval)?;
        parse_duration_field("pull.shutdown_timeout", &self.settings.pull.shutdown_timeout)?;
        parse_duration_field("push.shutdown_timeout", &self.settings.push.shutdown_timeout)?;
        if self.token_store.sqlite_path.trim().is_empty() {
            return Err(ReplayError::Config("token_store.sqlite_path must not be empty".to_string()));
        }
        Ok(())
    }
}

fn parse_duration_field(field: &str, raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw)
        .map_err(|e| ReplayError::Config(format!("invalid duration for {}: {:?} ({})", field, raw, e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// ProcessingGroupConfig: one entry per processing group
// ═══════════════════════════════════════════════════════════════════════════════

/// Which processor runs a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorType {
    /// Push by default, switches to pull for replays. Replay-capable.
    #[default]
    Switching,
    /// Push only.
    Push,
    /// Pull only.
    Pull,
}

/// Configuration for a single processing group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingGroupConfig {
    /// Unique group name.
    pub name: String,

    /// Number of pull segments (at least 1).
    #[serde(default = "default_segment_count")]
    pub segment_count: u32,

    #[serde(default)]
    pub processor_type: ProcessorType,
}

fn default_segment_count() -> u32 {
    1
}

impl ProcessingGroupConfig {
    /// A replay-capable group.
    pub fn switching(name: &str, segment_count: u32) -> Self {
        Self {
            name: name.to_string(),
            segment_count,
            processor_type: ProcessorType::Switching,
        }
    }

    /// A push-only group.
    pub fn push(name: &str) -> Self {
        Self {
            name: name.to_string(),
            segment_count: 1,
            processor_type: ProcessorType::Push,
        }
    }

    /// A pull-only group.
    pub fn pull(name: &str, segment_count: u32) -> Self {
        Self {
            name: name.to_string(),
            segment_count,
            processor_type: ProcessorType::Pull,
        }
    }

    /// Whether the coordinator can replay this group.
    pub fn is_replay_capable(&self) -> bool {
        self.processor_type == ProcessorType::Switching
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplaySettings: push and pull tunables
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunables for the two processing modes.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplaySettings {
    #[serde(default)]
    pub pull: PullConfig,
    #[serde(default)]
    pub push: PushConfig,
}

/// Pull (segmented, checkpointed) processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    /// Maximum events read per segment per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Idle sleep between empty reads, as a duration string (e.g., "100ms").
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// How long shutdown waits for each segment worker.
    #[serde(default = "default_pull_shutdown_timeout")]
    pub shutdown_timeout: String,
}

fn default_batch_size() -> usize {
    100
}

fn default_poll_interval() -> String {
    "100ms".to_string()
}

fn default_pull_shutdown_timeout() -> String {
    "10s".to_string()
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: "100ms".to_string(),
            shutdown_timeout: "10s".to_string(),
        }
    }
}

impl PullConfig {
    /// Parse the poll_interval string to a Duration.
    pub fn poll_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.poll_interval).unwrap_or(Duration::from_millis(100))
    }

    /// Parse the shutdown_timeout string to a Duration.
    pub fn shutdown_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.shutdown_timeout).unwrap_or(Duration::from_secs(10))
    }
}

/// Push (live subscription) processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// How long shutdown waits for the subscription task.
    #[serde(default = "default_push_shutdown_timeout")]
    pub shutdown_timeout: String,
}

fn default_push_shutdown_timeout() -> String {
    "5s".to_string()
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: "5s".to_string(),
        }
    }
}

impl PushConfig {
    /// Parse the shutdown_timeout string to a Duration.
    pub fn shutdown_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.shutdown_timeout).unwrap_or(Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TokenStoreConfig: segment token persistence
// ═══════════════════════════════════════════════════════════════════════════════

/// Segment token persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenStoreConfig {
    /// Path to SQLite database for segment tokens.
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TokenStoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "segment_tokens.db".to_string(),
            wal_mode: true,
        }
    }
}

impl TokenStoreConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_constructors() {
        let g = ProcessingGroupConfig::switching("orgs", 2);
        assert!(g.is_replay_capable());
        assert_eq!(g.segment_count, 2);

        assert!(!ProcessingGroupConfig::push("audit").is_replay_capable());
        assert!(!ProcessingGroupConfig::pull("reports", 4).is_replay_capable());
    }

    #[test]
    fn test_group_defaults_from_json() {
        let g: ProcessingGroupConfig = serde_json::from_str(r#"{"name":"orgs"}"#).unwrap();
        assert_eq!(g.segment_count, 1);
        assert_eq!(g.processor_type, ProcessorType::Switching);

        let g: ProcessingGroupConfig =
            serde_json::from_str(r#"{"name":"audit","processor_type":"push"}"#).unwrap();
        assert_eq!(g.processor_type, ProcessorType::Push);
    }

    #[test]
    fn test_pull_durations() {
        let config = PullConfig::default();
        assert_eq!(config.poll_interval_duration(), Duration::from_millis(100));
        assert_eq!(config.shutdown_timeout_duration(), Duration::from_secs(10));

        let config = PullConfig {
            poll_interval: "2s".to_string(),
            shutdown_timeout: "1m".to_string(),
            ..Default::default()
        };
        assert_eq!(config.poll_interval_duration(), Duration::from_secs(2));
        assert_eq!(config.shutdown_timeout_duration(), Duration::from_secs(60));
    }

    #[test]
    fn test_invalid_duration_fallback() {
        let config = PullConfig {
            poll_interval: "soon".to_string(),
            ..Default::default()
        };
        // Should fall back to 100ms
        assert_eq!(config.poll_interval_duration(), Duration::from_millis(100));

        let push = PushConfig {
            shutdown_timeout: "never".to_string(),
        };
        assert_eq!(push.shutdown_timeout_duration(), Duration::from_secs(5));
    }

    #[test]
    fn test_validate_accepts_default() {
        assert!(ReplayConfig::default().validate().is_ok());
        assert!(ReplayConfig::for_testing(vec![ProcessingGroupConfig::switching("a", 2)])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let config = ReplayConfig::for_testing(vec![
            ProcessingGroupConfig::switching("a", 1),
            ProcessingGroupConfig::push("a"),
        ]);
        assert!(matches!(config.validate(), Err(ReplayError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_segments() {
        let config = ReplayConfig::for_testing(vec![ProcessingGroupConfig::switching("a", 0)]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_duration() {
        let mut config = ReplayConfig::for_testing(vec![]);
        config.settings.pull.poll_interval = "fast".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pull.poll_interval"));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = ReplayConfig::for_testing(vec![]);
        config.settings.pull.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_token_store_config() {
        let config = TokenStoreConfig::default();
        assert_eq!(config.sqlite_path, "segment_tokens.db");
        assert!(config.wal_mode);
        assert!(!config.is_in_memory());

        let config = TokenStoreConfig::in_memory();
        assert!(config.is_in_memory());
        assert!(!config.wal_mode);
    }

    #[test]
    fn test_group_lookup() {
        let config = ReplayConfig::for_testing(vec![
            ProcessingGroupConfig::switching("a", 1),
            ProcessingGroupConfig::pull("b", 3),
        ]);
        assert_eq!(config.group("b").map(|g| g.segment_count), Some(3));
        assert!(config.group("c").is_none());
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = ReplayConfig::for_testing(vec![
            ProcessingGroupConfig::switching("orgs", 2),
            ProcessingGroupConfig::push("audit"),
        ]);

        let json = serde_json::to_string(&config).unwrap();
        let parsed: ReplayConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.processing_groups.len(), 2);
        assert_eq!(parsed.processing_groups[1].processor_type, ProcessorType::Push);
        assert_eq!(parsed.settings.pull.poll_interval, "5ms");
        assert!(parsed.token_store.is_in_memory());
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let parsed: ReplayConfig = serde_json::from_str("{}").unwrap();
        assert!(parsed.processing_groups.is_empty());
        assert_eq!(parsed.settings.pull.batch_size, 100);
        assert_eq!(parsed.token_store.sqlite_path, "segment_tokens.db");
    }
}
