//! Read-side ring
//!
//! An in-memory cache of the ring descriptor kept fresh via KV watch.
//! Every change notification rebuilds the derived indices (sorted token
//! array, token→instance map, per-zone token arrays) under a writer lock;
//! queries take a read lock and operate on an immutable snapshot.

use crate::common::{timestamp_now, Error, Result, RingConfig};
use crate::kv::KvStore;
use crate::ring::model::{InstanceDesc, InstanceState, RingDesc};
use crate::ring::replication::{filter_replica_set, Operation, ReplicationSet};
use crate::token::Token;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Immutable token indices shared between a snapshot and any subrings
/// derived from it.
pub(crate) struct RingIndex {
    /// All tokens of non-Left instances, sorted
    pub tokens: Vec<Token>,
    /// token → (instance id, zone)
    pub token_owners: HashMap<Token, TokenInfo>,
    /// zone → sorted tokens of that zone
    pub tokens_by_zone: BTreeMap<String, Vec<Token>>,
    /// Distinct zones, sorted
    pub zones: Vec<String>,
}

#[derive(Clone)]
pub(crate) struct TokenInfo {
    pub instance_id: String,
    pub zone: String,
}

impl RingIndex {
    pub(crate) fn build(desc: &RingDesc) -> RingIndex {
        let mut tokens = Vec::new();
        let mut token_owners = HashMap::new();
        let mut tokens_by_zone: BTreeMap<String, Vec<Token>> = BTreeMap::new();

        for (id, instance) in &desc.instances {
            if instance.state == InstanceState::Left {
                continue;
            }
            for &token in &instance.tokens {
                tokens.push(token);
                token_owners.insert(
                    token,
                    TokenInfo {
                        instance_id: id.clone(),
                        zone: instance.zone.clone(),
                    },
                );
                tokens_by_zone
                    .entry(instance.zone.clone())
                    .or_default()
                    .push(token);
            }
        }

        tokens.sort_unstable();
        for zone_tokens in tokens_by_zone.values_mut() {
            zone_tokens.sort_unstable();
        }
        let zones = desc.zones();

        RingIndex {
            tokens,
            token_owners,
            tokens_by_zone,
            zones,
        }
    }
}

/// One published version of the ring. Immutable once built.
pub(crate) struct RingSnapshot {
    pub desc: RingDesc,
    pub index: Arc<RingIndex>,
    /// Bumped only when topology (membership, tokens, zones, read-only
    /// flags) changes, not on heartbeat or state updates.
    pub topology_version: u64,
}

impl RingSnapshot {
    fn empty() -> Self {
        let desc = RingDesc::new();
        let index = Arc::new(RingIndex::build(&desc));
        RingSnapshot {
            desc,
            index,
            topology_version: 0,
        }
    }
}

/// Index of the first token >= `key`, wrapping to 0 past the end.
pub(crate) fn search_token(tokens: &[Token], key: u32) -> usize {
    let i = tokens.partition_point(|t| *t < key);
    if i == tokens.len() {
        0
    } else {
        i
    }
}

pub(crate) struct SubringCacheKey {
    pub identifier: String,
    pub size: usize,
    pub lookback_secs: u64,
}

impl std::hash::Hash for SubringCacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.identifier.hash(state);
        self.size.hash(state);
        self.lookback_secs.hash(state);
    }
}
impl PartialEq for SubringCacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.identifier == other.identifier
            && self.size == other.size
            && self.lookback_secs == other.lookback_secs
    }
}
impl Eq for SubringCacheKey {}

pub(crate) struct CachedSubring {
    pub member_ids: Vec<String>,
    pub index: Arc<RingIndex>,
    pub topology_version: u64,
    /// With lookback: the entry is stale once the lookback cutoff moves
    /// past this timestamp (an included event leaves the window).
    pub valid_until_cutoff: Option<u64>,
}

/// The read side of the instance ring.
pub struct Ring {
    pub(crate) cfg: RingConfig,
    pub(crate) state: RwLock<Arc<RingSnapshot>>,
    pub(crate) subring_cache: Mutex<HashMap<SubringCacheKey, CachedSubring>>,
}

impl Ring {
    pub fn new(cfg: RingConfig) -> Self {
        Self {
            cfg,
            state: RwLock::new(Arc::new(RingSnapshot::empty())),
            subring_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Build a ring directly from a descriptor (tests, subrings).
    pub fn from_desc(cfg: RingConfig, desc: RingDesc) -> Self {
        let ring = Ring::new(cfg);
        ring.update(desc);
        ring
    }

    pub(crate) fn snapshot(&self) -> Arc<RingSnapshot> {
        self.state.read().expect("ring lock poisoned").clone()
    }

    /// Publish a new descriptor. Topology changes bump the version and drop
    /// cached subrings; heartbeat/state-only changes keep both.
    pub fn update(&self, desc: RingDesc) {
        let mut state = self.state.write().expect("ring lock poisoned");
        let topology_changed = state.desc.topology_differs(&desc);

        let new_version = if topology_changed {
            state.topology_version + 1
        } else {
            state.topology_version
        };
        let index = if topology_changed {
            Arc::new(RingIndex::build(&desc))
        } else {
            state.index.clone()
        };

        *state = Arc::new(RingSnapshot {
            desc,
            index,
            topology_version: new_version,
        });
        drop(state);

        if topology_changed {
            self.subring_cache
                .lock()
                .expect("subring cache lock poisoned")
                .clear();
            tracing::debug!("ring topology changed, version now {}", new_version);
        }
    }

    /// Keep this ring fresh from the KV store. Runs until the store shuts
    /// down; watch errors are logged and retried with a fixed backoff.
    pub fn start_watching(
        self: &Arc<Self>,
        kv: Arc<dyn KvStore<RingDesc>>,
    ) -> tokio::task::JoinHandle<()> {
        let ring = Arc::clone(self);
        tokio::spawn(async move {
            let key = ring.cfg.key.clone();
            loop {
                let watcher_ring = Arc::clone(&ring);
                let result = kv
                    .watch_key(
                        &key,
                        Box::new(move |desc| {
                            watcher_ring.update(desc);
                            true
                        }),
                    )
                    .await;
                match result {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::warn!("ring watch on {:?} failed: {}, retrying", key, e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    }

    pub fn instances_count(&self) -> usize {
        self.snapshot()
            .desc
            .instances
            .values()
            .filter(|i| i.state != InstanceState::Left)
            .count()
    }

    pub fn zones_count(&self) -> usize {
        self.snapshot().index.zones.len()
    }

    pub fn topology_version(&self) -> u64 {
        self.snapshot().topology_version
    }

    pub fn get_instance(&self, id: &str) -> Option<InstanceDesc> {
        self.snapshot().desc.instances.get(id).cloned()
    }

    /// The current descriptor (for status pages and tests).
    pub fn descriptor(&self) -> RingDesc {
        self.snapshot().desc.clone()
    }

    /// Which instances own `key`: walk the token ring clockwise collecting
    /// distinct instances until the (possibly extended) replica count is
    /// reached, then filter unhealthy ones and compute the error budget.
    pub fn get(&self, key: u32, op: Operation) -> Result<ReplicationSet> {
        self.get_at(key, op, timestamp_now())
    }

    pub(crate) fn get_at(&self, key: u32, op: Operation, now: u64) -> Result<ReplicationSet> {
        let snapshot = self.snapshot();
        if snapshot.index.tokens.is_empty() {
            return Err(Error::EmptyRing);
        }

        let tokens = &snapshot.index.tokens;
        let mut n = self.cfg.replication_factor;
        let mut distinct_hosts: HashSet<&str> = HashSet::new();
        let mut distinct_zones: HashSet<&str> = HashSet::new();
        let mut hosts: Vec<InstanceDesc> = Vec::with_capacity(n);

        let start = search_token(tokens, key);
        for i in 0..tokens.len() {
            if hosts.len() >= n {
                break;
            }
            let token = tokens[(start + i) % tokens.len()];
            let info = snapshot
                .index
                .token_owners
                .get(&token)
                .ok_or(Error::InconsistentTokensInfo(token))?;

            if distinct_hosts.contains(info.instance_id.as_str()) {
                continue;
            }
            if self.cfg.excluded_zones.contains(&info.zone) {
                continue;
            }
            if self.cfg.zone_awareness_enabled
                && !info.zone.is_empty()
                && distinct_zones.contains(info.zone.as_str())
            {
                continue;
            }

            let instance = snapshot
                .desc
                .instances
                .get(&info.instance_id)
                .ok_or(Error::InconsistentTokensInfo(token))?;
            distinct_hosts.insert(instance.id.as_str());

            // An instance whose state extends the set still occupies a
            // replica slot but signals "also pick one more". Its zone is
            // not reserved, so the extra replica may come from it.
            if op.should_extend_replica_set(instance.state) {
                n += 1;
            } else if self.cfg.zone_awareness_enabled && !info.zone.is_empty() {
                distinct_zones.insert(instance.zone.as_str());
            }

            hosts.push(instance.clone());
        }

        let (healthy, max_errors) = filter_replica_set(
            hosts,
            op,
            self.cfg.replication_factor,
            self.cfg.heartbeat_timeout(),
            now,
        )?;

        if self.cfg.zone_awareness_enabled {
            Ok(ReplicationSet {
                instances: healthy,
                max_errors: 0,
                max_unavailable_zones: max_errors,
                zone_awareness_enabled: true,
            })
        } else {
            Ok(ReplicationSet {
                instances: healthy,
                max_errors,
                max_unavailable_zones: 0,
                zone_awareness_enabled: false,
            })
        }
    }

    /// All healthy instances for an operation spanning the whole ring
    /// (e.g. a scatter-gather read).
    pub fn replication_set_for_operation(&self, op: Operation) -> Result<ReplicationSet> {
        self.replication_set_for_operation_at(op, timestamp_now())
    }

    pub(crate) fn replication_set_for_operation_at(
        &self,
        op: Operation,
        now: u64,
    ) -> Result<ReplicationSet> {
        let snapshot = self.snapshot();
        if snapshot.desc.is_empty() {
            return Err(Error::EmptyRing);
        }

        let timeout = self.cfg.heartbeat_timeout();
        let mut healthy: Vec<InstanceDesc> = Vec::new();
        let mut zone_failures: HashSet<String> = HashSet::new();
        for instance in snapshot.desc.instances.values() {
            if instance.state == InstanceState::Left {
                continue;
            }
            if instance.is_healthy_for(op.healthy_bits(), timeout, now) {
                healthy.push(instance.clone());
            } else {
                zone_failures.insert(instance.zone.clone());
            }
        }

        if self.cfg.zone_awareness_enabled {
            // Data is replicated across zones, so whole zones are the unit
            // of failure here.
            let replicated_zones = snapshot.index.zones.len().min(self.cfg.replication_factor);
            let min_success_zones = replicated_zones / 2 + 1;
            let max_unavailable_zones = replicated_zones.saturating_sub(min_success_zones);

            if zone_failures.len() > max_unavailable_zones {
                return Err(Error::TooManyUnhealthy);
            }

            // Drop every instance in a failed zone: the zone as a whole is
            // no longer a viable replica target.
            healthy.retain(|i| !zone_failures.contains(&i.zone));
            Ok(ReplicationSet {
                instances: healthy,
                max_errors: 0,
                max_unavailable_zones: max_unavailable_zones - zone_failures.len(),
                zone_awareness_enabled: true,
            })
        } else {
            let total = snapshot
                .desc
                .instances
                .values()
                .filter(|i| i.state != InstanceState::Left)
                .count();
            let mut required = total.max(self.cfg.replication_factor);
            required -= self.cfg.replication_factor / 2;

            if healthy.len() < required {
                return Err(Error::TooManyUnhealthy);
            }
            Ok(ReplicationSet {
                max_errors: healthy.len() - required,
                instances: healthy,
                max_unavailable_zones: 0,
                zone_awareness_enabled: false,
            })
        }
    }
}
