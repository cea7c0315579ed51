//! Partition ring descriptor model
//!
//! The partition ring tracks logical partitions instead of instances: a
//! partition has deterministic tokens (generated once at creation) and any
//! number of owners referencing it (N:1). Owners come and go with
//! instances; the partition itself has an independent lifecycle.

use crate::common::{Error, Result, SpreadMinimizingConfig};
use crate::token::{SpreadMinimizingTokenGenerator, Token};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Partition lifecycle state.
///
/// `Pending → Active ⇄ Inactive`; `Deleted` is a tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PartitionState {
    Pending,
    Active,
    Inactive,
    Deleted,
}

impl PartitionState {
    pub fn can_transition_to(self, to: PartitionState) -> bool {
        use PartitionState::*;
        if self == to {
            return true;
        }
        matches!(
            (self, to),
            (Pending, Active)
                | (Pending, Inactive)
                | (Pending, Deleted)
                | (Active, Inactive)
                | (Inactive, Active)
                | (Inactive, Deleted)
        )
    }
}

impl std::fmt::Display for PartitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionState::Pending => write!(f, "PENDING"),
            PartitionState::Active => write!(f, "ACTIVE"),
            PartitionState::Inactive => write!(f, "INACTIVE"),
            PartitionState::Deleted => write!(f, "DELETED"),
        }
    }
}

/// Owner registration state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OwnerState {
    Active,
    Deleted,
}

/// One partition's entry in the partition ring descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartitionDesc {
    pub id: i32,
    /// Deterministic tokens, generated once at creation
    pub tokens: Vec<Token>,
    pub state: PartitionState,
    /// When `state` last changed, Unix seconds
    pub state_timestamp: u64,
    /// Administrative lock blocking automatic state transitions
    #[serde(default)]
    pub state_change_locked: bool,
}

impl PartitionDesc {
    pub fn is_active(&self) -> bool {
        self.state == PartitionState::Active
    }

    /// Did the partition's state change after the lookback cutoff?
    pub fn state_changed_after(&self, cutoff: u64) -> bool {
        self.state_timestamp > cutoff
    }
}

/// One owner's entry: which partition it serves and when its registration
/// last changed (ownership changes only, not heartbeats).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OwnerDesc {
    pub owned_partition: i32,
    pub state: OwnerState,
    pub updated_timestamp: u64,
}

/// The deterministic token set of a partition: the spread-minimizing
/// generator keyed by the partition id, in a single synthetic zone, so
/// every process derives the same 512 tokens with no collisions across
/// partitions.
pub fn partition_tokens(partition_id: i32) -> Result<Vec<Token>> {
    let generator = SpreadMinimizingTokenGenerator::new(&SpreadMinimizingConfig {
        instance: format!("partition-{}", partition_id),
        zone: "partition".to_string(),
        zones: vec!["partition".to_string()],
        can_join_enabled: false,
    })?;
    generator.generate_all_tokens()
}

/// The full partition ring: partitions plus owner registrations.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PartitionRingDesc {
    #[serde(default)]
    pub partitions: BTreeMap<i32, PartitionDesc>,
    #[serde(default)]
    pub owners: BTreeMap<String, OwnerDesc>,
}

impl PartitionRingDesc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a partition with its deterministic tokens. No-op if it
    /// already exists.
    pub fn add_partition(&mut self, id: i32, state: PartitionState, now: u64) -> Result<bool> {
        if self.partitions.contains_key(&id) {
            return Ok(false);
        }
        self.partitions.insert(
            id,
            PartitionDesc {
                id,
                tokens: partition_tokens(id)?,
                state,
                state_timestamp: now,
                state_change_locked: false,
            },
        );
        Ok(true)
    }

    pub fn remove_partition(&mut self, id: i32) -> Option<PartitionDesc> {
        self.partitions.remove(&id)
    }

    /// Transition a partition's state with allow-list and lock checks.
    /// Returns false when the state was already `to`.
    pub fn set_partition_state(&mut self, id: i32, to: PartitionState, now: u64) -> Result<bool> {
        let partition = self
            .partitions
            .get_mut(&id)
            .ok_or(Error::PartitionNotFound(id))?;
        if partition.state == to {
            return Ok(false);
        }
        if partition.state_change_locked {
            return Err(Error::PartitionStateChangeLocked(id));
        }
        if !partition.state.can_transition_to(to) {
            return Err(Error::InvalidStateTransition {
                from: partition.state.to_string(),
                to: to.to_string(),
            });
        }
        partition.state = to;
        partition.state_timestamp = now;
        Ok(true)
    }

    pub fn set_partition_state_locked(&mut self, id: i32, locked: bool) -> Result<bool> {
        let partition = self
            .partitions
            .get_mut(&id)
            .ok_or(Error::PartitionNotFound(id))?;
        if partition.state_change_locked == locked {
            return Ok(false);
        }
        partition.state_change_locked = locked;
        Ok(true)
    }

    /// Register or update an owner. Returns true if anything changed;
    /// `updated_timestamp` only moves on actual changes.
    pub fn add_or_update_owner(&mut self, owner_id: &str, partition_id: i32, now: u64) -> bool {
        match self.owners.get_mut(owner_id) {
            Some(owner)
                if owner.owned_partition == partition_id && owner.state == OwnerState::Active =>
            {
                false
            }
            Some(owner) => {
                owner.owned_partition = partition_id;
                owner.state = OwnerState::Active;
                owner.updated_timestamp = now;
                true
            }
            None => {
                self.owners.insert(
                    owner_id.to_string(),
                    OwnerDesc {
                        owned_partition: partition_id,
                        state: OwnerState::Active,
                        updated_timestamp: now,
                    },
                );
                true
            }
        }
    }

    pub fn remove_owner(&mut self, owner_id: &str) -> bool {
        self.owners.remove(owner_id).is_some()
    }

    /// Active owners referencing the given partition, sorted by id.
    pub fn partition_owners(&self, partition_id: i32) -> Vec<&str> {
        self.owners
            .iter()
            .filter(|(_, o)| o.owned_partition == partition_id && o.state == OwnerState::Active)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    /// All (token, partition id) pairs of non-Deleted partitions, sorted.
    pub fn token_owners(&self) -> Vec<(Token, i32)> {
        let mut out: Vec<(Token, i32)> = Vec::new();
        for (&id, partition) in &self.partitions {
            if partition.state == PartitionState::Deleted {
                continue;
            }
            for &token in &partition.tokens {
                out.push((token, id));
            }
        }
        out.sort_unstable();
        out
    }

    pub fn active_partition_ids(&self) -> Vec<i32> {
        self.partitions
            .iter()
            .filter(|(_, p)| p.is_active())
            .map(|(&id, _)| id)
            .collect()
    }

    pub fn has_partition(&self, id: i32) -> bool {
        self.partitions.contains_key(&id)
    }
}
