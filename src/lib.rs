//! # shardring
//!
//! A distributed membership and consistent-hashing ring:
//! - Token-based sharding on a 32-bit circular hash space
//! - Quorum-based replication sets with zone awareness
//! - Shuffle sharding with determinism and consistency guarantees
//! - Lifecycle managers driving instance registration and heartbeats
//!   against a shared key-value store (CAS + watch)
//! - A partition-oriented ring where the shard unit is a logical
//!   partition with multiple owners
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   CAS    ┌─────────────────────┐
//! │ BasicLifecycler  ├─────────►│   KV store (ring    │
//! │ (one instance)   │          │   descriptor key)   │
//! └──────────────────┘          └─────────┬───────────┘
//!                                         │ watch
//!                               ┌─────────▼───────────┐
//!                               │  Ring (read side)   │
//!                               │  tokens → instances │
//!                               └─────────┬───────────┘
//!                                         │ get / shuffle_shard
//!                               ┌─────────▼───────────┐
//!                               │ do_batch / trackers │
//!                               │ (quorum execution)  │
//!                               └─────────────────────┘
//! ```
//!
//! The KV store is an external collaborator: anything exposing
//! `get`, `cas` and `watch_key` works. An in-memory implementation is
//! bundled for tests and single-process embedders.

pub mod common;
pub mod kv;
pub mod lifecycler;
pub mod partition;
pub mod ring;
pub mod token;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use kv::{KvStore, MemoryKvStore};
pub use lifecycler::BasicLifecycler;
pub use ring::Ring;
pub use token::{Token, Tokens};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
