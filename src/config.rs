//! Engine and queue tuning knobs.

use serde::{Deserialize, Serialize};

/// Limits enforced by the engine at scheduling boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of node executions in a single run.
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    /// Wall-clock budget for the whole run, measured from run start.
    #[serde(default = "default_max_execution_time_secs")]
    pub max_execution_time_secs: u64,
}

fn default_max_steps() -> u64 {
    500
}

fn default_max_execution_time_secs() -> u64 {
    1200
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_execution_time_secs: default_max_execution_time_secs(),
        }
    }
}

/// Queue manager timings. TTLs bound how long ownership and stop flags
/// survive in the shared key-value store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Poll interval for the listen loop, in milliseconds. Sub-second so
    /// timeout and stop-flag checks never lag by more than one interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Interval between keep-alive pings while waiting for events.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Wall-clock budget observed by the listen loop.
    #[serde(default = "default_max_execution_time_secs")]
    pub max_execution_time_secs: u64,
    /// TTL on the task ownership record.
    #[serde(default = "default_belong_ttl_secs")]
    pub task_belong_ttl_secs: u64,
    /// TTL on the stop flag.
    #[serde(default = "default_stop_flag_ttl_secs")]
    pub stop_flag_ttl_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_ping_interval_secs() -> u64 {
    10
}

fn default_belong_ttl_secs() -> u64 {
    1800
}

fn default_stop_flag_ttl_secs() -> u64 {
    600
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            ping_interval_secs: default_ping_interval_secs(),
            max_execution_time_secs: default_max_execution_time_secs(),
            task_belong_ttl_secs: default_belong_ttl_secs(),
            stop_flag_ttl_secs: default_stop_flag_ttl_secs(),
        }
    }
}
