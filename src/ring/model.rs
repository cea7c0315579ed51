//! Ring descriptor model
//!
//! The descriptor is the value stored under the ring's KV key:
//! - instance id → descriptor (address, zone, state, tokens, heartbeat)
//! - merged across replicas with newest-heartbeat-wins semantics
//! - token conflicts resolved so tokens stay globally unique
//!
//! The descriptor is immutable by convention once published to ring
//! readers; all mutation happens inside KV CAS transforms.

use crate::common::timestamp_now;
use crate::kv::Mergeable;
use crate::token::Token;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Instance lifecycle state.
///
/// `Pending → Joining → Active → Leaving → Left`; `Joining` is only used
/// when token stability must be observed before activation. `Left` is a
/// tombstone, reaped after a retention window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceState {
    Pending,
    Joining,
    Active,
    Leaving,
    Left,
}

impl InstanceState {
    /// Bit used by [`Operation`](crate::ring::Operation) masks.
    pub(crate) const fn bit(self) -> u8 {
        match self {
            InstanceState::Pending => 1 << 0,
            InstanceState::Joining => 1 << 1,
            InstanceState::Active => 1 << 2,
            InstanceState::Leaving => 1 << 3,
            InstanceState::Left => 1 << 4,
        }
    }

    /// Is `self → to` a legal transition? Same-state writes are allowed so
    /// heartbeats can re-assert the current state.
    pub fn can_transition_to(self, to: InstanceState) -> bool {
        use InstanceState::*;
        if self == to {
            return true;
        }
        matches!(
            (self, to),
            (Pending, Joining)
                | (Pending, Active)
                | (Pending, Left)
                | (Joining, Active)
                | (Joining, Pending)
                | (Joining, Left)
                | (Active, Leaving)
                | (Active, Left)
                | (Leaving, Left)
        )
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceState::Pending => write!(f, "PENDING"),
            InstanceState::Joining => write!(f, "JOINING"),
            InstanceState::Active => write!(f, "ACTIVE"),
            InstanceState::Leaving => write!(f, "LEAVING"),
            InstanceState::Left => write!(f, "LEFT"),
        }
    }
}

/// One instance's entry in the ring descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceDesc {
    pub id: String,
    pub addr: String,
    #[serde(default)]
    pub zone: String,
    pub state: InstanceState,
    /// Sorted, deduplicated tokens owned by this instance
    #[serde(default)]
    pub tokens: Vec<Token>,
    /// Heartbeat, Unix seconds
    pub timestamp: u64,
    /// When the instance first registered, Unix seconds
    #[serde(default)]
    pub registered_timestamp: u64,
    #[serde(default)]
    pub read_only: bool,
    /// When `read_only` last changed, Unix seconds (0 = never)
    #[serde(default)]
    pub read_only_updated_timestamp: u64,
}

impl InstanceDesc {
    /// Healthy for `op`: state accepted by the operation and heartbeat not
    /// older than the timeout (a zero timeout disables the age check).
    pub fn is_healthy_for(
        &self,
        healthy_states: u8,
        heartbeat_timeout: Duration,
        now: u64,
    ) -> bool {
        let state_ok = healthy_states & self.state.bit() != 0;
        let heartbeat_ok = heartbeat_timeout.is_zero()
            || self.timestamp + heartbeat_timeout.as_secs() >= now;
        state_ok && heartbeat_ok
    }

    /// Ready to serve: active with tokens claimed.
    pub fn is_ready(&self) -> bool {
        self.state == InstanceState::Active && !self.tokens.is_empty()
    }
}

/// The full ring: all registered instances.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RingDesc {
    #[serde(default)]
    pub instances: BTreeMap<String, InstanceDesc>,
}

impl RingDesc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an instance entry.
    #[allow(clippy::too_many_arguments)]
    pub fn add_instance(
        &mut self,
        id: &str,
        addr: &str,
        zone: &str,
        tokens: Vec<Token>,
        state: InstanceState,
        registered_timestamp: u64,
        read_only: bool,
        read_only_updated_timestamp: u64,
    ) -> &mut InstanceDesc {
        let mut tokens = tokens;
        tokens.sort_unstable();
        tokens.dedup();
        let desc = InstanceDesc {
            id: id.to_string(),
            addr: addr.to_string(),
            zone: zone.to_string(),
            state,
            tokens,
            timestamp: timestamp_now(),
            registered_timestamp,
            read_only,
            read_only_updated_timestamp,
        };
        self.instances.insert(id.to_string(), desc);
        self.instances.get_mut(id).unwrap()
    }

    pub fn remove_instance(&mut self, id: &str) -> Option<InstanceDesc> {
        self.instances.remove(id)
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// All (token, owner id) pairs of non-Left instances, sorted by token.
    pub fn token_owners(&self) -> Vec<(Token, &str)> {
        let mut out: Vec<(Token, &str)> = Vec::new();
        for (id, instance) in &self.instances {
            if instance.state == InstanceState::Left {
                continue;
            }
            for &token in &instance.tokens {
                out.push((token, id.as_str()));
            }
        }
        out.sort_unstable_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));
        out
    }

    /// Distinct zones of non-Left instances, sorted.
    pub fn zones(&self) -> Vec<String> {
        let mut zones: Vec<String> = self
            .instances
            .values()
            .filter(|i| i.state != InstanceState::Left)
            .map(|i| i.zone.clone())
            .collect();
        zones.sort_unstable();
        zones.dedup();
        zones
    }

    /// Does anything other than heartbeats/timestamps differ between the
    /// two descriptors? Used to decide whether subring caches must be
    /// dropped.
    pub fn topology_differs(&self, other: &RingDesc) -> bool {
        if self.instances.len() != other.instances.len() {
            return true;
        }
        for (id, a) in &self.instances {
            match other.instances.get(id) {
                None => return true,
                Some(b) => {
                    if a.state != b.state
                        || a.tokens != b.tokens
                        || a.zone != b.zone
                        || a.addr != b.addr
                        || a.read_only != b.read_only
                    {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Merge `other` into `self` (newest heartbeat wins; ties where exactly
    /// one side is Left resolve to Left). With `local_authoritative`, local
    /// entries missing from `other` are tombstoned — this breaks merge
    /// commutativity and is only for CAS callers working on their own
    /// authoritative snapshot.
    pub fn merge(&mut self, other: &RingDesc, local_authoritative: bool, now: u64) -> bool {
        let mut changed = false;

        for (id, remote) in &other.instances {
            match self.instances.get(id) {
                None => {
                    self.instances.insert(id.clone(), remote.clone());
                    changed = true;
                }
                Some(local) => {
                    let adopt = remote.timestamp > local.timestamp
                        || (remote.timestamp == local.timestamp
                            && remote.state == InstanceState::Left
                            && local.state != InstanceState::Left);
                    if adopt {
                        self.instances.insert(id.clone(), remote.clone());
                        changed = true;
                    }
                }
            }
        }

        if local_authoritative {
            for (id, local) in self.instances.iter_mut() {
                if !other.instances.contains_key(id) && local.state != InstanceState::Left {
                    local.state = InstanceState::Left;
                    local.timestamp = now;
                    changed = true;
                }
            }
        }

        if self.resolve_token_conflicts() {
            changed = true;
        }
        changed
    }

    /// Ensure no two instances share a token: an instance in Leaving state
    /// loses to one that is not, otherwise the lexicographically smaller id
    /// wins. The loser keeps its other, non-conflicting tokens.
    fn resolve_token_conflicts(&mut self) -> bool {
        let mut owners: HashMap<Token, Vec<(&str, InstanceState)>> = HashMap::new();
        for (id, instance) in &self.instances {
            if instance.state == InstanceState::Left {
                continue;
            }
            for &token in &instance.tokens {
                owners
                    .entry(token)
                    .or_default()
                    .push((id.as_str(), instance.state));
            }
        }

        let mut losers: HashMap<String, Vec<Token>> = HashMap::new();
        for (token, mut claimants) in owners {
            if claimants.len() < 2 {
                continue;
            }
            claimants.sort_by(|a, b| {
                let a_leaving = a.1 == InstanceState::Leaving;
                let b_leaving = b.1 == InstanceState::Leaving;
                a_leaving.cmp(&b_leaving).then_with(|| a.0.cmp(b.0))
            });
            // First claimant wins, the rest drop the token.
            for (id, _) in claimants.into_iter().skip(1) {
                losers.entry(id.to_string()).or_default().push(token);
            }
        }

        let changed = !losers.is_empty();
        for (id, lost) in losers {
            if let Some(instance) = self.instances.get_mut(&id) {
                instance.tokens.retain(|t| !lost.contains(t));
            }
        }
        changed
    }

    /// Delete Left entries with a heartbeat older than the cutoff.
    /// Returns (retained, removed) tombstone counts for observability.
    pub fn remove_tombstones(&mut self, older_than: u64) -> (usize, usize) {
        let before = self.instances.len();
        self.instances
            .retain(|_, i| i.state != InstanceState::Left || i.timestamp >= older_than);
        let removed = before - self.instances.len();
        let retained = self
            .instances
            .values()
            .filter(|i| i.state == InstanceState::Left)
            .count();
        (retained, removed)
    }
}

impl Mergeable for RingDesc {
    fn merge(&mut self, other: &Self, local_authoritative: bool) -> bool {
        RingDesc::merge(self, other, local_authoritative, timestamp_now())
    }

    fn remove_tombstones(&mut self, older_than: u64) -> (usize, usize) {
        RingDesc::remove_tombstones(self, older_than)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn desc(id: &str, state: InstanceState, tokens: Vec<Token>, timestamp: u64) -> InstanceDesc {
        InstanceDesc {
            id: id.to_string(),
            addr: format!("{}:9000", id),
            zone: String::new(),
            state,
            tokens,
            timestamp,
            registered_timestamp: timestamp,
            read_only: false,
            read_only_updated_timestamp: 0,
        }
    }

    fn ring_with(instances: Vec<InstanceDesc>) -> RingDesc {
        let mut ring = RingDesc::new();
        for i in instances {
            ring.instances.insert(i.id.clone(), i);
        }
        ring
    }

    #[test]
    fn test_state_transitions() {
        use InstanceState::*;
        assert!(Pending.can_transition_to(Joining));
        assert!(Joining.can_transition_to(Active));
        assert!(Active.can_transition_to(Leaving));
        assert!(Leaving.can_transition_to(Left));
        assert!(Active.can_transition_to(Active));

        assert!(!Active.can_transition_to(Pending));
        assert!(!Left.can_transition_to(Active));
        assert!(!Leaving.can_transition_to(Joining));
    }

    #[test]
    fn test_merge_newer_heartbeat_wins() {
        let mut local = ring_with(vec![desc("a", InstanceState::Active, vec![1], 100)]);
        let remote = ring_with(vec![desc("a", InstanceState::Leaving, vec![1], 200)]);

        assert!(local.merge(&remote, false, 300));
        assert_eq!(local.instances["a"].state, InstanceState::Leaving);
        assert_eq!(local.instances["a"].timestamp, 200);

        // Older remote copy is ignored.
        let stale = ring_with(vec![desc("a", InstanceState::Active, vec![1], 50)]);
        assert!(!local.merge(&stale, false, 300));
        assert_eq!(local.instances["a"].state, InstanceState::Leaving);
    }

    #[test]
    fn test_merge_left_wins_ties() {
        let mut local = ring_with(vec![desc("a", InstanceState::Active, vec![1], 100)]);
        let remote = ring_with(vec![desc("a", InstanceState::Left, vec![], 100)]);

        assert!(local.merge(&remote, false, 300));
        assert_eq!(local.instances["a"].state, InstanceState::Left);
    }

    #[test]
    fn test_merge_local_authoritative_tombstones_missing() {
        let mut local = ring_with(vec![
            desc("a", InstanceState::Active, vec![1], 100),
            desc("b", InstanceState::Active, vec![2], 100),
        ]);
        let remote = ring_with(vec![desc("a", InstanceState::Active, vec![1], 100)]);

        assert!(local.merge(&remote, true, 300));
        assert_eq!(local.instances["b"].state, InstanceState::Left);
        assert_eq!(local.instances["b"].timestamp, 300);

        // Without the authoritative flag, b is kept.
        let mut local = ring_with(vec![
            desc("a", InstanceState::Active, vec![1], 100),
            desc("b", InstanceState::Active, vec![2], 100),
        ]);
        assert!(!local.merge(&remote, false, 300));
        assert_eq!(local.instances["b"].state, InstanceState::Active);
    }

    #[test]
    fn test_merge_token_conflict_leaving_loses() {
        let mut local = ring_with(vec![desc("b", InstanceState::Leaving, vec![5, 7], 100)]);
        let remote = ring_with(vec![desc("a", InstanceState::Active, vec![5], 100)]);

        local.merge(&remote, false, 300);
        assert_eq!(local.instances["a"].tokens, vec![5]);
        // Leaving instance loses the conflicting token, keeps the other.
        assert_eq!(local.instances["b"].tokens, vec![7]);
    }

    #[test]
    fn test_merge_token_conflict_smaller_id_wins() {
        let mut local = ring_with(vec![desc("b", InstanceState::Active, vec![5], 100)]);
        let remote = ring_with(vec![desc("a", InstanceState::Active, vec![5], 100)]);

        local.merge(&remote, false, 300);
        assert_eq!(local.instances["a"].tokens, vec![5]);
        assert!(local.instances["b"].tokens.is_empty());
    }

    #[test]
    fn test_merge_preserves_token_uniqueness() {
        let mut local = ring_with(vec![
            desc("a", InstanceState::Active, vec![1, 5, 9], 100),
            desc("b", InstanceState::Active, vec![2, 5, 8], 100),
        ]);
        let remote = ring_with(vec![desc("c", InstanceState::Active, vec![5, 8, 11], 150)]);

        local.merge(&remote, false, 300);

        let mut seen = HashSet::new();
        for (token, _) in local.token_owners() {
            assert!(seen.insert(token), "token {} owned twice", token);
        }
    }

    #[test]
    fn test_remove_tombstones() {
        let mut ring = ring_with(vec![
            desc("a", InstanceState::Active, vec![1], 100),
            desc("b", InstanceState::Left, vec![], 100),
            desc("c", InstanceState::Left, vec![], 500),
        ]);

        let (retained, removed) = ring.remove_tombstones(200);
        assert_eq!(removed, 1);
        assert_eq!(retained, 1);
        assert!(!ring.instances.contains_key("b"));
        assert!(ring.instances.contains_key("c"));
    }

    #[test]
    fn test_healthy_predicate() {
        let i = desc("a", InstanceState::Active, vec![1], 100);
        let active_bit = InstanceState::Active.bit();

        assert!(i.is_healthy_for(active_bit, Duration::from_secs(60), 150));
        assert!(!i.is_healthy_for(active_bit, Duration::from_secs(60), 200));
        // Zero timeout disables the age check.
        assert!(i.is_healthy_for(active_bit, Duration::ZERO, 10_000));
        // State not accepted.
        assert!(!i.is_healthy_for(InstanceState::Leaving.bit(), Duration::ZERO, 150));
    }

    #[test]
    fn test_topology_differs_ignores_heartbeats() {
        let a = ring_with(vec![desc("a", InstanceState::Active, vec![1], 100)]);
        let mut b = a.clone();
        b.instances.get_mut("a").unwrap().timestamp = 999;
        assert!(!a.topology_differs(&b));

        b.instances.get_mut("a").unwrap().tokens = vec![1, 2];
        assert!(a.topology_differs(&b));

        let mut c = a.clone();
        c.instances.get_mut("a").unwrap().state = InstanceState::Leaving;
        assert!(a.topology_differs(&c));
    }
}
