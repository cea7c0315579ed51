//! Instance ring: descriptor model, read side, replication sets and
//! quorum execution helpers.

pub mod batch;
pub mod http;
pub mod model;
pub mod replication;
#[allow(clippy::module_inception)]
pub mod ring;
pub mod shuffle;
pub mod tracker;

pub use batch::{do_batch, DoBatchOptions};
pub use http::ring_status_router;
pub use model::{InstanceDesc, InstanceState, RingDesc};
pub use replication::{Operation, ReplicationSet, READ, REPORTING, WRITE};
pub use ring::Ring;
pub use tracker::{do_until_quorum, DefaultResultTracker, ResultTracker, ZoneAwareResultTracker};
