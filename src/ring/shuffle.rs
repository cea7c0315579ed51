//! Shuffle sharding
//!
//! Selects a stable, identifier-seeded pseudo-random subset of instances:
//! - deterministic: the same identifier and ring always yield the same
//!   subset
//! - consistent: adding or removing one instance changes the subset by at
//!   most one instance
//! - shuffling: different identifiers get different, only partially
//!   overlapping subsets
//!
//! An optional lookback window keeps instances whose registration or
//! read-only state changed within the window in the shard, so data written
//! during the window is not lost. Subrings are cached per (identifier,
//! size, lookback) and invalidated on topology changes.

use crate::common::{shuffle_shard_seed, timestamp_now, RingConfig};
use crate::ring::model::{InstanceDesc, RingDesc};
use crate::ring::ring::{search_token, CachedSubring, Ring, RingIndex, SubringCacheKey};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

impl Ring {
    /// Deterministic subring of `size` instances for `identifier`
    /// (zone-balanced when zone awareness is enabled).
    pub fn shuffle_shard(&self, identifier: &str, size: usize) -> Ring {
        self.shuffle_shard_inner(identifier, size, None, timestamp_now())
    }

    /// Like [`shuffle_shard`](Ring::shuffle_shard), additionally including
    /// instances that registered or flipped read-only within `lookback`
    /// before `now`.
    pub fn shuffle_shard_with_lookback(
        &self,
        identifier: &str,
        size: usize,
        lookback: Duration,
        now: u64,
    ) -> Ring {
        self.shuffle_shard_inner(identifier, size, Some(lookback), now)
    }

    fn shuffle_shard_inner(
        &self,
        identifier: &str,
        size: usize,
        lookback: Option<Duration>,
        now: u64,
    ) -> Ring {
        let snapshot = self.snapshot();

        // Shard disabled or covering everything: share the whole snapshot.
        let total = snapshot
            .desc
            .instances
            .values()
            .filter(|i| i.state != crate::ring::model::InstanceState::Left)
            .count();
        if size == 0 || size >= total {
            return Ring {
                cfg: self.subring_config(),
                state: RwLock::new(snapshot),
                subring_cache: Mutex::new(Default::default()),
            };
        }

        let lookback_secs = lookback.map(|l| l.as_secs()).unwrap_or(0);
        let cache_key = SubringCacheKey {
            identifier: identifier.to_string(),
            size,
            lookback_secs,
        };
        let cutoff = lookback.map(|l| now.saturating_sub(l.as_secs()));

        if !self.cfg.subring_cache_disabled {
            if let Some(subring) = self.serve_cached_subring(&cache_key, &snapshot.desc, snapshot.topology_version, cutoff)
            {
                return subring;
            }
        }

        let (members, valid_until_cutoff) =
            select_shard(&self.cfg, &snapshot.index, &snapshot.desc, identifier, size, cutoff);

        let member_ids: Vec<String> = members.keys().cloned().collect();
        let mut sub_desc = RingDesc::new();
        for (id, instance) in members {
            sub_desc.instances.insert(id, instance);
        }
        let sub_index = Arc::new(RingIndex::build(&sub_desc));

        if !self.cfg.subring_cache_disabled {
            self.subring_cache
                .lock()
                .expect("subring cache lock poisoned")
                .insert(
                    cache_key,
                    CachedSubring {
                        member_ids,
                        index: sub_index.clone(),
                        topology_version: snapshot.topology_version,
                        valid_until_cutoff,
                    },
                );
        }

        self.build_subring(sub_desc, sub_index)
    }

    fn subring_config(&self) -> RingConfig {
        let mut cfg = self.cfg.clone();
        // Subrings never cache their own subrings.
        cfg.subring_cache_disabled = true;
        cfg
    }

    fn build_subring(&self, desc: RingDesc, index: Arc<RingIndex>) -> Ring {
        let version = self.snapshot().topology_version;
        Ring {
            cfg: self.subring_config(),
            state: RwLock::new(Arc::new(crate::ring::ring::RingSnapshot {
                desc,
                index,
                topology_version: version,
            })),
            subring_cache: Mutex::new(Default::default()),
        }
    }

    /// Serve a cached subring: reuse the immutable token index but take
    /// fresh per-instance state (heartbeat, state) from the parent.
    fn serve_cached_subring(
        &self,
        key: &SubringCacheKey,
        current_desc: &RingDesc,
        topology_version: u64,
        cutoff: Option<u64>,
    ) -> Option<Ring> {
        let cache = self
            .subring_cache
            .lock()
            .expect("subring cache lock poisoned");
        let entry = cache.get(key)?;

        if entry.topology_version != topology_version {
            return None;
        }
        if let (Some(cutoff), Some(valid_until)) = (cutoff, entry.valid_until_cutoff) {
            // An event the shard depends on has aged out of the window.
            if cutoff > valid_until {
                return None;
            }
        }

        let mut desc = RingDesc::new();
        for id in &entry.member_ids {
            let instance = current_desc.instances.get(id)?.clone();
            desc.instances.insert(id.clone(), instance);
        }
        let index = entry.index.clone();
        drop(cache);

        Some(self.build_subring(desc, index))
    }
}

/// Pick shard members zone by zone. Returns the selected instances and,
/// when a lookback cutoff is given, the earliest within-window event
/// timestamp the result depends on (cache validity bound).
fn select_shard(
    cfg: &RingConfig,
    index: &RingIndex,
    desc: &RingDesc,
    identifier: &str,
    size: usize,
    cutoff: Option<u64>,
) -> (BTreeMap<String, InstanceDesc>, Option<u64>) {
    let (per_zone, zones): (usize, Vec<String>) = if cfg.zone_awareness_enabled {
        let zones: Vec<String> = index
            .zones
            .iter()
            .filter(|z| !cfg.excluded_zones.contains(z))
            .cloned()
            .collect();
        let n = if zones.is_empty() {
            0
        } else {
            // Over-provision so every zone contributes equally.
            size.div_ceil(zones.len())
        };
        (n, zones)
    } else {
        (size, vec![String::new()])
    };

    let mut selected: BTreeMap<String, InstanceDesc> = BTreeMap::new();
    let mut valid_until: Option<u64> = None;

    for zone in &zones {
        let empty: Vec<u32> = Vec::new();
        let tokens: &Vec<u32> = if cfg.zone_awareness_enabled {
            index.tokens_by_zone.get(zone).unwrap_or(&empty)
        } else {
            &index.tokens
        };
        if tokens.is_empty() {
            continue;
        }

        let mut rng = StdRng::seed_from_u64(shuffle_shard_seed(identifier, zone));

        for _ in 0..per_zone {
            let start = search_token(tokens, rng.gen::<u32>());
            let mut found = false;

            for p in 0..tokens.len() {
                let token = tokens[(start + p) % tokens.len()];
                let info = match index.token_owners.get(&token) {
                    Some(info) => info,
                    None => continue,
                };
                if selected.contains_key(&info.instance_id) {
                    continue;
                }
                let instance = match desc.instances.get(&info.instance_id) {
                    Some(i) => i.clone(),
                    None => continue,
                };

                let within_lookback = cutoff.map(|cutoff| {
                    let mut events = Vec::new();
                    if instance.registered_timestamp > cutoff {
                        events.push(instance.registered_timestamp);
                    }
                    if instance.read_only_updated_timestamp > cutoff {
                        events.push(instance.read_only_updated_timestamp);
                    }
                    events.into_iter().min()
                });

                selected.insert(info.instance_id.clone(), instance);

                match within_lookback {
                    Some(Some(event_ts)) => {
                        // The instance only qualifies because of a recent
                        // event: keep it, but keep searching so the shard
                        // still reaches a full complement of stable
                        // instances.
                        valid_until = Some(valid_until.map_or(event_ts, |v: u64| v.min(event_ts)));
                        continue;
                    }
                    _ => {
                        found = true;
                        break;
                    }
                }
            }

            // This zone has no more selectable instances.
            if !found {
                break;
            }
        }
    }

    (selected, valid_until)
}
