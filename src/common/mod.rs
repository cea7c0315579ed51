//! Common utilities and types shared across shardring

pub mod config;
pub mod error;
pub mod logging;
pub mod utils;

pub use config::{
    Config, LifecyclerConfig, PartitionLifecyclerConfig, RingConfig, SpreadMinimizingConfig,
};
pub use error::{Error, Result};
pub use logging::init_logging;
pub use utils::{hash_key, parse_duration, shuffle_shard_seed, timestamp_now, timestamp_now_millis};
