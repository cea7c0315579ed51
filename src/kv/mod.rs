//! Key-value store boundary
//!
//! Everything in this crate talks to the shared store through [`KvStore`]:
//! - `get(key)` — read the current value
//! - `cas(key, f)` — optimistic compare-and-swap with an application
//!   transform, retried internally on conflict
//! - `watch_key(key, f)` — long-lived subscription, `f` returning `false`
//!   stops watching
//!
//! [`MemoryKvStore`] is a process-local implementation used by tests and
//! single-process embedders. Replicated backends that merge concurrent
//! writes (gossip-style) do so through the [`Mergeable`] trait, which the
//! ring descriptor implements.

pub mod memory;

pub use memory::MemoryKvStore;

use crate::common::Result;
use async_trait::async_trait;

/// Transform applied by a CAS operation.
///
/// Receives the current value (if any) and returns the new value to store,
/// or `None` to abort the CAS without error.
pub type CasFn<'a, V> = Box<dyn FnMut(Option<V>) -> Result<Option<V>> + Send + 'a>;

/// Watch callback. Invoked with the value on every change (and once with
/// the current value when the watch starts, if one exists). Returning
/// `false` stops the watch.
pub type WatchFn<V> = Box<dyn FnMut(V) -> bool + Send>;

/// The shared key-value store consumed by rings and lifecyclers.
#[async_trait]
pub trait KvStore<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    /// Read the current value for `key`.
    async fn get(&self, key: &str) -> Result<Option<V>>;

    /// Compare-and-swap: apply `f` to the current value and store the
    /// result. The store retries `f` internally when a concurrent write
    /// invalidates the read.
    async fn cas(&self, key: &str, f: CasFn<'_, V>) -> Result<()>;

    /// Watch `key` until `f` returns `false` or the store shuts down.
    async fn watch_key(&self, key: &str, f: WatchFn<V>) -> Result<()>;
}

/// Values that replicated backends can merge across concurrent writers.
pub trait Mergeable: Clone + Send + Sync {
    /// Merge `other` into `self`.
    ///
    /// `local_authoritative` marks the local copy as the source of truth:
    /// entries missing from `other` are tombstoned locally instead of kept.
    /// This intentionally breaks commutativity and must only be used by
    /// CAS callers working on their own authoritative snapshot.
    ///
    /// Returns `true` when the merge changed `self`.
    fn merge(&mut self, other: &Self, local_authoritative: bool) -> bool;

    /// Drop tombstoned entries older than the given Unix timestamp.
    /// Returns (retained, removed) tombstone counts.
    fn remove_tombstones(&mut self, older_than: u64) -> (usize, usize);
}
