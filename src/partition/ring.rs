//! Partition ring read side
//!
//! Answers "which partition owns this key" over the partition descriptor,
//! skipping partitions that are not Active, and supports shuffle sharding
//! where the shard unit is a partition. Unlike the instance ring, the
//! lookback variant may *extend* the requested shard size: as long as the
//! walk keeps meeting partitions whose state changed within the lookback
//! window, it keeps pulling more, so the shard covers every partition that
//! could still hold in-flight data.

use crate::common::{shuffle_shard_seed, Error, Result};
use crate::kv::KvStore;
use crate::partition::model::{PartitionDesc, PartitionRingDesc, PartitionState};
use crate::token::Token;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::warn;

/// Immutable read view over a partition ring descriptor.
pub struct PartitionRing {
    desc: PartitionRingDesc,
    /// Sorted tokens of all non-Deleted partitions
    tokens: Vec<Token>,
    partition_by_token: HashMap<Token, i32>,
}

impl PartitionRing {
    pub fn new(desc: PartitionRingDesc) -> Self {
        let owners = desc.token_owners();
        let tokens: Vec<Token> = owners.iter().map(|&(t, _)| t).collect();
        let partition_by_token: HashMap<Token, i32> = owners.into_iter().collect();
        Self {
            desc,
            tokens,
            partition_by_token,
        }
    }

    pub fn empty() -> Self {
        Self::new(PartitionRingDesc::new())
    }

    pub fn descriptor(&self) -> &PartitionRingDesc {
        &self.desc
    }

    pub fn partitions_count(&self) -> usize {
        self.desc.partitions.len()
    }

    pub fn active_partitions_count(&self) -> usize {
        self.desc.active_partition_ids().len()
    }

    pub fn partition(&self, id: i32) -> Option<&PartitionDesc> {
        self.desc.partitions.get(&id)
    }

    /// Index of the first token >= `key`, wrapping to the start.
    fn search_token(&self, key: u32) -> usize {
        let i = self.tokens.partition_point(|&t| t < key);
        if i == self.tokens.len() {
            0
        } else {
            i
        }
    }

    /// The Active partition owning `key`: walk the token ring clockwise,
    /// skipping partitions in any other state.
    pub fn active_partition_for_key(&self, key: u32) -> Result<&PartitionDesc> {
        if self.tokens.is_empty() {
            return Err(Error::EmptyRing);
        }
        let start = self.search_token(key);
        let mut visited = BTreeSet::new();
        for offset in 0..self.tokens.len() {
            let token = self.tokens[(start + offset) % self.tokens.len()];
            let id = *self
                .partition_by_token
                .get(&token)
                .ok_or(Error::InconsistentTokensInfo(token))?;
            if !visited.insert(id) {
                continue;
            }
            let partition = self
                .desc
                .partitions
                .get(&id)
                .ok_or(Error::InconsistentTokensInfo(token))?;
            if partition.is_active() {
                return Ok(partition);
            }
        }
        Err(Error::NoActivePartition)
    }

    /// Deterministic subring of `size` Active partitions for `identifier`.
    pub fn shuffle_shard(&self, identifier: &str, size: usize) -> Result<PartitionRing> {
        self.shuffle_shard_inner(identifier, size, None)
    }

    /// Like [`shuffle_shard`](Self::shuffle_shard), additionally including
    /// (and extending past) partitions whose state changed within
    /// `lookback` before `now`.
    pub fn shuffle_shard_with_lookback(
        &self,
        identifier: &str,
        size: usize,
        lookback: Duration,
        now: u64,
    ) -> Result<PartitionRing> {
        let cutoff = now.saturating_sub(lookback.as_secs());
        self.shuffle_shard_inner(identifier, size, Some(cutoff))
    }

    fn shuffle_shard_inner(
        &self,
        identifier: &str,
        size: usize,
        lookback_cutoff: Option<u64>,
    ) -> Result<PartitionRing> {
        if size == 0 || size >= self.desc.partitions.len() {
            return Ok(PartitionRing::new(self.desc.clone()));
        }
        if self.tokens.is_empty() {
            return Err(Error::EmptyRing);
        }

        let mut rng = StdRng::seed_from_u64(shuffle_shard_seed(identifier, ""));
        let mut selected: BTreeSet<i32> = BTreeSet::new();
        let mut remaining = size;

        'slots: while remaining > 0 {
            let start = self.search_token(rng.gen::<u32>());
            let mut progressed = false;
            for offset in 0..self.tokens.len() {
                let token = self.tokens[(start + offset) % self.tokens.len()];
                let id = *self
                    .partition_by_token
                    .get(&token)
                    .ok_or(Error::InconsistentTokensInfo(token))?;
                if selected.contains(&id) {
                    continue;
                }
                let partition = self
                    .desc
                    .partitions
                    .get(&id)
                    .ok_or(Error::InconsistentTokensInfo(token))?;

                // A within-lookback state change means the partition could
                // still hold in-flight data: include it without consuming
                // the slot and keep walking (shard extension).
                if let Some(cutoff) = lookback_cutoff {
                    if partition.state_changed_after(cutoff) {
                        selected.insert(id);
                        progressed = true;
                        continue;
                    }
                }
                if partition.is_active() {
                    selected.insert(id);
                    remaining -= 1;
                    continue 'slots;
                }
            }
            // A full lap found no selectable partition for this slot.
            if !progressed {
                break;
            }
        }

        let mut subset = PartitionRingDesc::new();
        for id in &selected {
            if let Some(partition) = self.desc.partitions.get(id) {
                subset.partitions.insert(*id, partition.clone());
            }
        }
        for (owner_id, owner) in &self.desc.owners {
            if selected.contains(&owner.owned_partition) {
                subset.owners.insert(owner_id.clone(), owner.clone());
            }
        }
        Ok(PartitionRing::new(subset))
    }
}

/// Keeps a [`PartitionRing`] fresh from the KV store, mirroring the
/// instance ring's watch loop.
pub struct PartitionRingWatcher {
    key: String,
    ring: RwLock<Arc<PartitionRing>>,
}

impl PartitionRingWatcher {
    pub fn new(key: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            ring: RwLock::new(Arc::new(PartitionRing::empty())),
        })
    }

    /// The latest published ring view.
    pub fn ring(&self) -> Arc<PartitionRing> {
        self.ring.read().unwrap().clone()
    }

    pub fn update(&self, desc: PartitionRingDesc) {
        *self.ring.write().unwrap() = Arc::new(PartitionRing::new(desc));
    }

    /// Watch the KV key until the store shuts down; errors are logged and
    /// retried with a fixed backoff.
    pub fn start_watching(
        self: &Arc<Self>,
        kv: Arc<dyn KvStore<PartitionRingDesc>>,
    ) -> tokio::task::JoinHandle<()> {
        let watcher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let update_target = Arc::clone(&watcher);
                let result = kv
                    .watch_key(
                        &watcher.key,
                        Box::new(move |desc| {
                            update_target.update(desc);
                            true
                        }),
                    )
                    .await;
                match result {
                    Ok(()) => return,
                    Err(e) => {
                        warn!("partition ring watch on {:?} failed: {}, retrying", watcher.key, e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    }
}
