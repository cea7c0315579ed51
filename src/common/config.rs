//! Configuration for shardring components

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration bundling the pieces a node typically wires together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Ring read-side config
    pub ring: RingConfig,

    /// Instance lifecycler config (absent on read-only nodes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycler: Option<LifecyclerConfig>,

    /// Partition lifecycler config
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_lifecycler: Option<PartitionLifecyclerConfig>,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Ring read-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    /// KV key under which the ring descriptor is stored
    #[serde(default = "default_ring_key")]
    pub key: String,

    /// Number of replicas for each key
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,

    /// Treat zones as the unit of replication
    #[serde(default)]
    pub zone_awareness_enabled: bool,

    /// Zones excluded from all lookups
    #[serde(default)]
    pub excluded_zones: Vec<String>,

    /// Heartbeat age after which an instance is unhealthy (0 disables the check)
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// Disable the shuffle-shard subring cache
    #[serde(default)]
    pub subring_cache_disabled: bool,
}

fn default_ring_key() -> String {
    "ring".to_string()
}
fn default_replication_factor() -> usize {
    3
}
fn default_heartbeat_timeout() -> u64 {
    60
}

impl RingConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            key: default_ring_key(),
            replication_factor: default_replication_factor(),
            zone_awareness_enabled: false,
            excluded_zones: Vec::new(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            subring_cache_disabled: false,
        }
    }
}

/// Configuration for the basic instance lifecycler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecyclerConfig {
    /// Instance ID, unique within the ring
    pub id: String,

    /// Advertised address
    pub addr: String,

    /// Availability zone
    #[serde(default)]
    pub zone: String,

    /// Number of tokens to claim
    #[serde(default = "default_num_tokens")]
    pub num_tokens: usize,

    /// Heartbeat period
    #[serde(default = "default_heartbeat_period")]
    pub heartbeat_period_secs: u64,

    /// How long to observe the ring for token conflicts after registering
    /// before declaring tokens stable (0 skips the observe phase)
    #[serde(default)]
    pub tokens_observe_period_secs: u64,

    /// Re-verify token ownership on this period (0 disables)
    #[serde(default = "default_token_reverify_period")]
    pub tokens_reverify_period_secs: u64,

    /// Leave the instance registered (in LEFT or its final state) on shutdown
    #[serde(default)]
    pub keep_instance_in_ring_on_shutdown: bool,

    /// Persist claimed tokens to this file for faster restarts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_file_path: Option<PathBuf>,
}

fn default_num_tokens() -> usize {
    128
}
fn default_heartbeat_period() -> u64 {
    15
}
fn default_token_reverify_period() -> u64 {
    30
}

impl LifecyclerConfig {
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_secs)
    }

    pub fn tokens_observe_period(&self) -> Duration {
        Duration::from_secs(self.tokens_observe_period_secs)
    }

    pub fn tokens_reverify_period(&self) -> Duration {
        Duration::from_secs(self.tokens_reverify_period_secs)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.id.is_empty() {
            return Err(crate::Error::InvalidConfig("instance id cannot be empty".into()));
        }
        if self.num_tokens == 0 {
            return Err(crate::Error::InvalidConfig("num_tokens must be positive".into()));
        }
        if self.heartbeat_period_secs == 0 {
            return Err(crate::Error::InvalidConfig(
                "heartbeat period must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the spread-minimizing token generator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpreadMinimizingConfig {
    /// Instance name, must end with `-<ordinal>` (e.g. "ingester-zone-a-5")
    pub instance: String,

    /// Zone of this instance
    pub zone: String,

    /// All zones the ring spans, in any order (at most 8)
    pub zones: Vec<String>,

    /// Require the ordinal predecessor to hold tokens before joining
    #[serde(default)]
    pub can_join_enabled: bool,
}

/// Configuration for the partition instance lifecycler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionLifecyclerConfig {
    /// KV key under which the partition ring descriptor is stored
    #[serde(default = "default_partition_ring_key")]
    pub key: String,

    /// Partition owned by this lifecycler
    pub partition_id: i32,

    /// Owner (instance) ID
    pub instance_id: String,

    /// Reconcile interval
    #[serde(default = "default_reconcile_interval")]
    pub poll_interval_secs: u64,

    /// Minimum owner count before a pending partition can become active
    #[serde(default = "default_min_owners_count")]
    pub wait_owners_count_on_pending: usize,

    /// How long the owner count must be stable before activation
    #[serde(default = "default_min_owners_duration")]
    pub wait_owners_duration_on_pending_secs: u64,

    /// Remove inactive partitions with no owners after this long (0 disables)
    #[serde(default)]
    pub delete_inactive_partition_after_secs: u64,
}

fn default_partition_ring_key() -> String {
    "partition-ring".to_string()
}
fn default_reconcile_interval() -> u64 {
    10
}
fn default_min_owners_count() -> usize {
    1
}
fn default_min_owners_duration() -> u64 {
    10
}

impl PartitionLifecyclerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn wait_owners_duration_on_pending(&self) -> Duration {
        Duration::from_secs(self.wait_owners_duration_on_pending_secs)
    }

    pub fn delete_inactive_partition_after(&self) -> Option<Duration> {
        if self.delete_inactive_partition_after_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.delete_inactive_partition_after_secs))
        }
    }
}
