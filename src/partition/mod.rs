//! Partition ring: consistent hashing over logical partitions
//!
//! Unlike the instance ring, token ownership here belongs to partitions
//! with deterministic token sets, and instances merely register as owners
//! of a partition. Partitions survive instance churn and follow their own
//! lifecycle (`PENDING -> ACTIVE <-> INACTIVE -> DELETED`), driven by
//! [`PartitionInstanceLifecycler`] and observed through
//! [`PartitionRingWatcher`].

pub mod http;
pub mod lifecycler;
pub mod model;
pub mod ring;

pub use http::partition_ring_status_router;
pub use lifecycler::PartitionInstanceLifecycler;
pub use model::{
    partition_tokens, OwnerDesc, OwnerState, PartitionDesc, PartitionRingDesc, PartitionState,
};
pub use ring::{PartitionRing, PartitionRingWatcher};
