//! Batch execution against replication sets
//!
//! [`do_batch`] fans a set of keys out to the instances owning them, one
//! callback invocation per instance (batched across all keys routed to
//! it), and resolves per-key success/failure under quorum rules. Client-
//! and server-origin failures are tracked separately so a server-error
//! quorum cannot mask a genuine client rejection, and vice versa.

use crate::common::{Error, Result};
use crate::ring::model::InstanceDesc;
use crate::ring::replication::Operation;
use crate::ring::ring::Ring;
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Options for [`do_batch`].
pub struct DoBatchOptions {
    /// Classify an error as client-origin (true) or server-origin (false).
    pub is_client_error: fn(&Error) -> bool,
    /// Invoked exactly once after every in-flight callback has finished,
    /// regardless of how the batch resolved.
    pub cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl Default for DoBatchOptions {
    fn default() -> Self {
        Self {
            is_client_error: Error::is_client_error,
            cleanup: None,
        }
    }
}

struct ItemTracker {
    min_success: isize,
    max_failures: isize,
    succeeded: AtomicIsize,
    failed_client: AtomicIsize,
    failed_server: AtomicIsize,
    remaining: AtomicIsize,
}

struct BatchTracker {
    items: Vec<ItemTracker>,
    /// Keys that have not yet reached their success quorum
    rpcs_pending: AtomicIsize,
    /// Set once the first key fails terminally
    rpcs_failed: AtomicIsize,
    done_tx: mpsc::Sender<()>,
    err_tx: mpsc::Sender<Error>,
    last_err: Mutex<Option<String>>,
}

impl BatchTracker {
    fn record(&self, item_indexes: &[usize], err: Option<(&Error, bool)>) {
        match err {
            None => {
                for &i in item_indexes {
                    let item = &self.items[i];
                    if item.succeeded.fetch_add(1, Ordering::SeqCst) + 1 == item.min_success
                        && self.rpcs_pending.fetch_sub(1, Ordering::SeqCst) - 1 == 0
                    {
                        let _ = self.done_tx.try_send(());
                    }
                    if item.remaining.fetch_sub(1, Ordering::SeqCst) - 1 == 0
                        && item.succeeded.load(Ordering::SeqCst) < item.min_success
                    {
                        self.fail("ran out of instances before reaching quorum");
                    }
                }
            }
            Some((err, is_client)) => {
                *self.last_err.lock().expect("batch tracker lock poisoned") =
                    Some(err.to_string());
                for &i in item_indexes {
                    let item = &self.items[i];
                    let class_failures = if is_client {
                        item.failed_client.fetch_add(1, Ordering::SeqCst) + 1
                    } else {
                        item.failed_server.fetch_add(1, Ordering::SeqCst) + 1
                    };
                    // A key fails only once a single error class on its own
                    // exceeds the failure budget.
                    if class_failures > item.max_failures {
                        self.fail(&err.to_string());
                    }
                    if item.remaining.fetch_sub(1, Ordering::SeqCst) - 1 == 0
                        && item.succeeded.load(Ordering::SeqCst) < item.min_success
                    {
                        self.fail(&err.to_string());
                    }
                }
            }
        }
    }

    fn fail(&self, fallback: &str) {
        if self.rpcs_failed.fetch_add(1, Ordering::SeqCst) == 0 {
            let msg = self
                .last_err
                .lock()
                .expect("batch tracker lock poisoned")
                .clone()
                .unwrap_or_else(|| fallback.to_string());
            let _ = self.err_tx.try_send(Error::Other(msg));
        }
    }
}

/// Route every key to its replication set and invoke `callback` once per
/// target instance with the key indexes batched for it. Returns `Ok` once
/// every key reached its success quorum, or the last recorded failure once
/// any key terminally failed.
///
/// Callbacks still in flight when the result is decided keep running in
/// the background; `options.cleanup` runs exactly once after the last one
/// finishes.
pub async fn do_batch<F, Fut>(
    ring: &Ring,
    op: Operation,
    keys: &[u32],
    callback: F,
    options: DoBatchOptions,
) -> Result<()>
where
    F: Fn(InstanceDesc, Vec<usize>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    if keys.is_empty() {
        if let Some(cleanup) = options.cleanup {
            cleanup();
        }
        return Ok(());
    }

    // Resolve replication sets up front and group key indexes by instance.
    let mut items = Vec::with_capacity(keys.len());
    let mut per_instance: BTreeMap<String, (InstanceDesc, Vec<usize>)> = BTreeMap::new();
    for (i, &key) in keys.iter().enumerate() {
        let set = ring.get(key, op)?;
        items.push(ItemTracker {
            min_success: (set.instances.len() - set.max_errors) as isize,
            max_failures: set.max_errors as isize,
            succeeded: AtomicIsize::new(0),
            failed_client: AtomicIsize::new(0),
            failed_server: AtomicIsize::new(0),
            remaining: AtomicIsize::new(set.instances.len() as isize),
        });
        for instance in set.instances {
            per_instance
                .entry(instance.id.clone())
                .or_insert_with(|| (instance, Vec::new()))
                .1
                .push(i);
        }
    }

    let (done_tx, mut done_rx) = mpsc::channel(1);
    let (err_tx, mut err_rx) = mpsc::channel(1);
    let tracker = Arc::new(BatchTracker {
        rpcs_pending: AtomicIsize::new(items.len() as isize),
        rpcs_failed: AtomicIsize::new(0),
        items,
        done_tx,
        err_tx,
        last_err: Mutex::new(None),
    });

    let is_client_error = options.is_client_error;
    let mut handles = Vec::with_capacity(per_instance.len());
    for (_, (instance, indexes)) in per_instance {
        let tracker = tracker.clone();
        let callback = callback.clone();
        handles.push(tokio::spawn(async move {
            let result = callback(instance, indexes.clone()).await;
            match result {
                Ok(()) => tracker.record(&indexes, None),
                Err(e) => tracker.record(&indexes, Some((&e, is_client_error(&e)))),
            }
        }));
    }

    // Cleanup waits for every callback, detached from the result below so
    // it runs exactly once on every exit path.
    let cleanup = options.cleanup;
    tokio::spawn(async move {
        join_all(handles).await;
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    });

    tokio::select! {
        _ = done_rx.recv() => Ok(()),
        err = err_rx.recv() => Err(err.unwrap_or(Error::Cancelled)),
    }
}
