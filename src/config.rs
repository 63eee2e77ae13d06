//! ShardSync Configuration
//!
//! Configuration structures for the follower-side shard synchronizer.
//! Every protocol constant is a default here rather than a literal in
//! the controller.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main ShardSync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardSyncConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Synchronization protocol tuning
    #[serde(default)]
    pub sync: SyncConfig,

    /// Leader RPC configuration
    #[serde(default)]
    pub rpc: RpcConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This server's id as known to the cluster metadata
    pub id: String,

    /// Reboot id, sent with lock requests so the leader can drop
    /// locks held by a previous incarnation of this server
    #[serde(default)]
    pub reboot_id: u64,
}

/// Synchronization protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Attempt timeout in seconds for revision-based syncs (0 = none)
    #[serde(default)]
    pub attempt_timeout_secs: u64,

    /// Poll interval while waiting for the leader to be ready
    #[serde(default = "default_readiness_poll_ms")]
    pub readiness_poll_ms: u64,

    /// Maximum number of soft-lock catch-up rounds
    #[serde(default = "default_soft_lock_max_rounds")]
    pub soft_lock_max_rounds: u32,

    /// Soft lock ttl in seconds
    #[serde(default = "default_soft_lock_timeout_secs")]
    pub soft_lock_timeout_secs: u64,

    /// Share of the soft lock ttl spent tailing under that lock
    #[serde(default = "default_soft_lock_duty_cycle")]
    pub soft_lock_duty_cycle: f64,

    /// Hard lock ttl in seconds
    #[serde(default = "default_hard_lock_timeout_secs")]
    pub hard_lock_timeout_secs: u64,

    /// Timeout for lock cancel requests
    #[serde(default = "default_short_rpc_secs")]
    pub cancel_lock_timeout_secs: u64,

    /// Timeout for the add-follower request
    #[serde(default = "default_short_rpc_secs")]
    pub add_follower_timeout_secs: u64,

    /// Timeout for reading the leader's document count
    #[serde(default = "default_short_rpc_secs")]
    pub leader_count_timeout_secs: u64,

    /// Timeout for a full recount on the leader
    #[serde(default = "default_leader_recount_timeout_secs")]
    pub leader_recount_timeout_secs: u64,

    /// Document count difference above which a job requeues itself
    #[serde(default = "default_requeue_doc_diff_threshold")]
    pub requeue_doc_diff_threshold: u64,

    /// Consecutive failures after which attempts are delayed
    #[serde(default = "default_backoff_failure_threshold")]
    pub backoff_failure_threshold: usize,

    /// Upper bound for the pre-attempt delay
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: f64,

    /// Sleep grain for the pre-attempt delay
    #[serde(default = "default_backoff_step_ms")]
    pub backoff_step_ms: u64,

    /// How long to wait for a cluster current-version bump
    #[serde(default = "default_current_version_wait_secs")]
    pub current_version_wait_secs: u64,

    /// Bulk syncs longer than this are logged at info
    #[serde(default = "default_long_bulk_sync_secs")]
    pub long_bulk_sync_secs: u64,
}

/// Leader RPC configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    /// TCP connect timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Timeout in seconds for one-off operator requests
    #[serde(default = "default_short_rpc_secs")]
    pub request_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_readiness_poll_ms() -> u64 {
    200
}

fn default_soft_lock_max_rounds() -> u32 {
    18
}

fn default_soft_lock_timeout_secs() -> u64 {
    300
}

fn default_soft_lock_duty_cycle() -> f64 {
    0.6
}

fn default_hard_lock_timeout_secs() -> u64 {
    600
}

fn default_short_rpc_secs() -> u64 {
    60
}

fn default_leader_recount_timeout_secs() -> u64 {
    900
}

fn default_requeue_doc_diff_threshold() -> u64 {
    10_000
}

fn default_backoff_failure_threshold() -> usize {
    4
}

fn default_backoff_max_secs() -> f64 {
    15.0
}

fn default_backoff_step_ms() -> u64 {
    500
}

fn default_current_version_wait_secs() -> u64 {
    600
}

fn default_long_bulk_sync_secs() -> u64 {
    5
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: 0,
            readiness_poll_ms: default_readiness_poll_ms(),
            soft_lock_max_rounds: default_soft_lock_max_rounds(),
            soft_lock_timeout_secs: default_soft_lock_timeout_secs(),
            soft_lock_duty_cycle: default_soft_lock_duty_cycle(),
            hard_lock_timeout_secs: default_hard_lock_timeout_secs(),
            cancel_lock_timeout_secs: default_short_rpc_secs(),
            add_follower_timeout_secs: default_short_rpc_secs(),
            leader_count_timeout_secs: default_short_rpc_secs(),
            leader_recount_timeout_secs: default_leader_recount_timeout_secs(),
            requeue_doc_diff_threshold: default_requeue_doc_diff_threshold(),
            backoff_failure_threshold: default_backoff_failure_threshold(),
            backoff_max_secs: default_backoff_max_secs(),
            backoff_step_ms: default_backoff_step_ms(),
            current_version_wait_secs: default_current_version_wait_secs(),
            long_bulk_sync_secs: default_long_bulk_sync_secs(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_secs: default_short_rpc_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ShardSyncConfig {
    /// Minimal configuration for a node, everything else defaulted
    pub fn for_node(id: impl Into<String>) -> Self {
        Self {
            node: NodeConfig { id: id.into(), reboot_id: 0 },
            sync: SyncConfig::default(),
            rpc: RpcConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ShardSyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        let duty = self.sync.soft_lock_duty_cycle;
        if !(duty > 0.0 && duty <= 1.0) {
            return Err(crate::Error::Config(format!(
                "sync.soft_lock_duty_cycle must be in (0, 1], got {}",
                duty
            )));
        }

        if self.sync.soft_lock_max_rounds == 0 {
            return Err(crate::Error::Config("sync.soft_lock_max_rounds must be at least 1".into()));
        }

        let max = self.sync.backoff_max_secs;
        if !(max.is_finite() && max >= 0.0) {
            return Err(crate::Error::Config(format!(
                "sync.backoff_max_secs must be a non-negative number of seconds, got {}",
                max
            )));
        }

        if self.sync.readiness_poll_ms == 0 {
            return Err(crate::Error::Config("sync.readiness_poll_ms must be positive".into()));
        }

        if self.sync.backoff_step_ms == 0 {
            return Err(crate::Error::Config("sync.backoff_step_ms must be positive".into()));
        }

        Ok(())
    }

    /// Resolved, Duration-typed settings for the synchronizer
    pub fn settings(&self) -> SyncSettings {
        let s = &self.sync;
        SyncSettings {
            attempt_timeout: (s.attempt_timeout_secs > 0)
                .then(|| Duration::from_secs(s.attempt_timeout_secs)),
            readiness_poll: Duration::from_millis(s.readiness_poll_ms),
            soft_lock_max_rounds: s.soft_lock_max_rounds,
            soft_lock_timeout: Duration::from_secs(s.soft_lock_timeout_secs),
            soft_lock_duty_cycle: s.soft_lock_duty_cycle,
            hard_lock_timeout: Duration::from_secs(s.hard_lock_timeout_secs),
            cancel_lock_timeout: Duration::from_secs(s.cancel_lock_timeout_secs),
            add_follower_timeout: Duration::from_secs(s.add_follower_timeout_secs),
            leader_count_timeout: Duration::from_secs(s.leader_count_timeout_secs),
            leader_recount_timeout: Duration::from_secs(s.leader_recount_timeout_secs),
            requeue_doc_diff_threshold: s.requeue_doc_diff_threshold,
            backoff_failure_threshold: s.backoff_failure_threshold,
            backoff_max: Duration::from_secs_f64(s.backoff_max_secs),
            backoff_step: Duration::from_millis(s.backoff_step_ms),
            current_version_wait: Duration::from_secs(s.current_version_wait_secs),
            long_bulk_sync: Duration::from_secs(s.long_bulk_sync_secs),
        }
    }

    /// RPC connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc.connect_timeout_ms)
    }

    /// RPC request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc.request_timeout_secs)
    }
}

/// Resolved synchronization settings
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub attempt_timeout: Option<Duration>,
    pub readiness_poll: Duration,
    pub soft_lock_max_rounds: u32,
    pub soft_lock_timeout: Duration,
    pub soft_lock_duty_cycle: f64,
    pub hard_lock_timeout: Duration,
    pub cancel_lock_timeout: Duration,
    pub add_follower_timeout: Duration,
    pub leader_count_timeout: Duration,
    pub leader_recount_timeout: Duration,
    pub requeue_doc_diff_threshold: u64,
    pub backoff_failure_threshold: usize,
    pub backoff_max: Duration,
    pub backoff_step: Duration,
    pub current_version_wait: Duration,
    pub long_bulk_sync: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        ShardSyncConfig::for_node("default").settings()
    }
}

impl SyncSettings {
    /// Time budget for tailing while a soft lock is held
    pub fn soft_catch_up_budget(&self) -> Duration {
        self.soft_lock_timeout.mul_f64(self.soft_lock_duty_cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "PRMR-0001"
reboot_id = 7

[sync]
attempt_timeout_secs = 900
requeue_doc_diff_threshold = 500

[logging]
level = "debug"
"#;

        let config = ShardSyncConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "PRMR-0001");
        assert_eq!(config.node.reboot_id, 7);

        let settings = config.settings();
        assert_eq!(settings.attempt_timeout, Some(Duration::from_secs(900)));
        assert_eq!(settings.requeue_doc_diff_threshold, 500);
        assert_eq!(settings.soft_lock_max_rounds, 18);
        assert_eq!(settings.readiness_poll, Duration::from_millis(200));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_defaults_match_protocol_constants() {
        let settings = SyncSettings::default();
        assert_eq!(settings.attempt_timeout, None);
        assert_eq!(settings.soft_lock_timeout, Duration::from_secs(300));
        assert_eq!(settings.soft_catch_up_budget(), Duration::from_secs(180));
        assert_eq!(settings.requeue_doc_diff_threshold, 10_000);
        assert_eq!(settings.backoff_failure_threshold, 4);
        assert_eq!(settings.current_version_wait, Duration::from_secs(600));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ShardSyncConfig::for_node("");
        assert!(config.validate().is_err());

        config.node.id = "PRMR-0001".into();
        config.sync.soft_lock_duty_cycle = 1.5;
        assert!(config.validate().is_err());

        config.sync.soft_lock_duty_cycle = 0.6;
        config.sync.soft_lock_max_rounds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_cap_must_be_a_duration() {
        for value in ["-1.0", "inf", "nan"] {
            let toml = format!("[node]\nid = \"PRMR-0001\"\n\n[sync]\nbackoff_max_secs = {}\n", value);
            let err = ShardSyncConfig::from_str(&toml).unwrap_err();
            assert!(err.to_string().contains("backoff_max_secs"), "{}: {}", value, err);
        }

        let toml = "[node]\nid = \"PRMR-0001\"\n\n[sync]\nbackoff_max_secs = 0.0\n";
        let config = ShardSyncConfig::from_str(toml).unwrap();
        assert_eq!(config.settings().backoff_max, Duration::ZERO);
    }

    #[test]
    fn test_readiness_poll_must_be_positive() {
        let mut config = ShardSyncConfig::for_node("PRMR-0001");
        config.sync.readiness_poll_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("readiness_poll_ms"));
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shardsync.toml");
        let config = ShardSyncConfig::for_node("PRMR-0002");
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = ShardSyncConfig::from_file(&path).unwrap();
        assert_eq!(loaded.node.id, "PRMR-0002");
        assert_eq!(loaded.sync.soft_lock_max_rounds, 18);
    }
}
