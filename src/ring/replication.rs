//! Operations and replication sets
//!
//! An [`Operation`] describes which instance states a caller considers
//! healthy and which states force the ring walk to extend the replica set
//! by one extra instance. A [`ReplicationSet`] is the derived, per-request
//! answer: the instances to contact plus the error budget.

use crate::common::{Error, Result};
use crate::ring::model::{InstanceDesc, InstanceState};
use std::time::Duration;

/// A ring operation: bitmask of healthy states plus a bitmask of states
/// that extend the replica set when encountered during the ring walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    healthy: u8,
    extend: u8,
}

impl Operation {
    pub const fn new(healthy_states: &[InstanceState], extend_states: &[InstanceState]) -> Self {
        let mut healthy = 0u8;
        let mut i = 0;
        while i < healthy_states.len() {
            healthy |= healthy_states[i].bit();
            i += 1;
        }
        let mut extend = 0u8;
        let mut i = 0;
        while i < extend_states.len() {
            extend |= extend_states[i].bit();
            i += 1;
        }
        Self { healthy, extend }
    }

    pub fn is_healthy_state(&self, state: InstanceState) -> bool {
        self.healthy & state.bit() != 0
    }

    /// Should selecting an instance in `state` add one more replica slot?
    pub fn should_extend_replica_set(&self, state: InstanceState) -> bool {
        self.extend & state.bit() != 0
    }

    pub(crate) fn healthy_bits(&self) -> u8 {
        self.healthy
    }
}

/// Write path: only Active instances are stable targets; a Leaving or
/// Joining instance still occupies a replica slot but signals "pick one
/// more".
pub const WRITE: Operation = Operation::new(
    &[InstanceState::Active],
    &[InstanceState::Leaving, InstanceState::Joining],
);

/// Read path: data written while an instance was draining is still on it.
pub const READ: Operation = Operation::new(&[InstanceState::Active, InstanceState::Leaving], &[]);

/// Status/reporting: everything that has not left.
pub const REPORTING: Operation = Operation::new(
    &[
        InstanceState::Pending,
        InstanceState::Joining,
        InstanceState::Active,
        InstanceState::Leaving,
    ],
    &[],
);

/// The owners selected to serve one operation, with quorum thresholds.
/// Derived from the ring per request, never persisted.
#[derive(Debug, Clone, Default)]
pub struct ReplicationSet {
    pub instances: Vec<InstanceDesc>,
    /// Maximum number of failing instances the operation tolerates
    /// (zone-awareness disabled).
    pub max_errors: usize,
    /// Maximum number of fully failing zones tolerated (zone-awareness
    /// enabled; `max_errors` is zero in that mode).
    pub max_unavailable_zones: usize,
    pub zone_awareness_enabled: bool,
}

impl ReplicationSet {
    /// Distinct zones covered by this set, sorted.
    pub fn zones(&self) -> Vec<String> {
        let mut zones: Vec<String> = self.instances.iter().map(|i| i.zone.clone()).collect();
        zones.sort_unstable();
        zones.dedup();
        zones
    }

    pub fn instance_ids(&self) -> Vec<&str> {
        self.instances.iter().map(|i| i.id.as_str()).collect()
    }
}

/// Drop unhealthy instances and compute the error budget for a per-key
/// replica set. `replication_factor` is the configured RF, which the ring
/// walk may have extended.
pub fn filter_replica_set(
    instances: Vec<InstanceDesc>,
    op: Operation,
    replication_factor: usize,
    heartbeat_timeout: Duration,
    now: u64,
) -> Result<(Vec<InstanceDesc>, usize)> {
    let healthy: Vec<InstanceDesc> = instances
        .into_iter()
        .filter(|i| i.is_healthy_for(op.healthy_bits(), heartbeat_timeout, now))
        .collect();

    let min_success = replication_factor / 2 + 1;
    if healthy.len() < min_success {
        return Err(Error::NotEnoughHealthyInstances {
            required: min_success,
            found: healthy.len(),
        });
    }

    let max_errors = healthy.len() - min_success;
    Ok((healthy, max_errors))
}
