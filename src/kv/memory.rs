//! In-memory KV store
//!
//! Process-local implementation of [`KvStore`], serialized through a mutex
//! with change notifications over a broadcast channel. Used by tests and by
//! embedders running every component in one process.

use crate::common::{Error, Result};
use crate::kv::{CasFn, KvStore, WatchFn};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

const CHANGE_CHANNEL_CAPACITY: usize = 128;

pub struct MemoryKvStore<V> {
    data: Mutex<HashMap<String, V>>,
    changes: broadcast::Sender<String>,
}

impl<V: Clone + Send + Sync + 'static> MemoryKvStore<V> {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            data: Mutex::new(HashMap::new()),
            changes,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, V>>> {
        self.data
            .lock()
            .map_err(|_| Error::Kv("memory store poisoned".into()))
    }
}

impl<V: Clone + Send + Sync + 'static> Default for MemoryKvStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> KvStore<V> for MemoryKvStore<V> {
    async fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn cas(&self, key: &str, mut f: CasFn<'_, V>) -> Result<()> {
        // The transform runs under the map lock, so there is never a
        // conflicting writer to retry against.
        let updated = {
            let mut data = self.lock()?;
            let current = data.get(key).cloned();
            match f(current)? {
                Some(new) => {
                    data.insert(key.to_string(), new);
                    true
                }
                None => false,
            }
        };

        if updated {
            // No receivers is fine: nobody is watching yet.
            let _ = self.changes.send(key.to_string());
        }
        Ok(())
    }

    async fn watch_key(&self, key: &str, mut f: WatchFn<V>) -> Result<()> {
        let mut rx = self.changes.subscribe();

        // Deliver the current value first so watchers never miss the state
        // that existed before they subscribed.
        if let Some(current) = self.lock()?.get(key).cloned() {
            if !f(current) {
                return Ok(());
            }
        }

        loop {
            match rx.recv().await {
                Ok(changed) if changed == key => {
                    let value = self.lock()?.get(key).cloned();
                    if let Some(value) = value {
                        if !f(value) {
                            return Ok(());
                        }
                    }
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("KV watcher lagged, skipped {} notifications", skipped);
                    // Re-read the current value; intermediate states are lost
                    // but the latest one is what matters.
                    let value = self.lock()?.get(key).cloned();
                    if let Some(value) = value {
                        if !f(value) {
                            return Ok(());
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}
