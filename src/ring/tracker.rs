//! Quorum-driven request execution
//!
//! [`do_until_quorum`] runs one callback per replication-set instance but
//! only releases the minimum number of requests needed for quorum, hedging
//! with one more whenever a released request fails. A [`ResultTracker`]
//! decides what "quorum" means: instance counting by default, whole zones
//! when zone-awareness is enabled.

use crate::common::{Error, Result};
use crate::ring::model::InstanceDesc;
use crate::ring::replication::ReplicationSet;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Whether a pending request slot has been released to run, or told it
/// will never be needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseState {
    Pending,
    Released,
    NotNeeded,
}

/// Tracks per-instance results for one replication-set operation and
/// gates which requests are allowed to start.
///
/// `done` is fed results one at a time from the driving task; the release
/// receivers are watched from the per-instance tasks. Once `succeeded` or
/// `failed` turns true the driver stops feeding results and releases
/// every still-pending slot as [`ReleaseState::NotNeeded`], so a slot
/// never waits forever even when quorum was satisfiable without it.
pub trait ResultTracker: Send {
    /// Record one finished request.
    fn done(&mut self, instance_id: &str, success: bool);
    fn succeeded(&self) -> bool;
    fn failed(&self) -> bool;
    /// Release only as many requests as quorum strictly needs.
    fn start_minimum_requests(&mut self);
    /// Release one more pending request, if any remain.
    fn start_additional_requests(&mut self);
    fn start_all_requests(&mut self);
    fn release_receiver(&self, instance_id: &str) -> watch::Receiver<ReleaseState>;
    /// Resolve every still-pending slot, released or not-needed.
    fn release_remaining(&mut self, needed: bool);
}

fn release_channels(set: &ReplicationSet) -> HashMap<String, watch::Sender<ReleaseState>> {
    set.instances
        .iter()
        .map(|i| (i.id.clone(), watch::channel(ReleaseState::Pending).0))
        .collect()
}

fn release(channels: &HashMap<String, watch::Sender<ReleaseState>>, id: &str, state: ReleaseState) {
    if let Some(tx) = channels.get(id) {
        let _ = tx.send(state);
    }
}

/// Instance-counting tracker: quorum is `instances - max_errors`
/// successes, failure is more than `max_errors` errors.
pub struct DefaultResultTracker {
    channels: HashMap<String, watch::Sender<ReleaseState>>,
    /// Not-yet-released instance ids in randomized order
    pending: Vec<String>,
    min_success: usize,
    max_errors: usize,
    num_succeeded: usize,
    num_errors: usize,
}

impl DefaultResultTracker {
    pub fn new(set: &ReplicationSet) -> Self {
        let mut pending: Vec<String> = set.instances.iter().map(|i| i.id.clone()).collect();
        pending.shuffle(&mut rand::thread_rng());
        Self {
            channels: release_channels(set),
            min_success: set.instances.len() - set.max_errors,
            max_errors: set.max_errors,
            pending,
            num_succeeded: 0,
            num_errors: 0,
        }
    }
}

impl ResultTracker for DefaultResultTracker {
    fn done(&mut self, instance_id: &str, success: bool) {
        if success {
            self.num_succeeded += 1;
        } else {
            self.num_errors += 1;
            debug!(instance = instance_id, "request failed, hedging with one more");
            self.start_additional_requests();
        }
    }

    fn succeeded(&self) -> bool {
        self.num_succeeded >= self.min_success
    }

    fn failed(&self) -> bool {
        self.num_errors > self.max_errors
    }

    fn start_minimum_requests(&mut self) {
        for _ in 0..self.min_success {
            self.start_additional_requests();
        }
    }

    fn start_additional_requests(&mut self) {
        if let Some(id) = self.pending.pop() {
            release(&self.channels, &id, ReleaseState::Released);
        }
    }

    fn start_all_requests(&mut self) {
        while let Some(id) = self.pending.pop() {
            release(&self.channels, &id, ReleaseState::Released);
        }
    }

    fn release_receiver(&self, instance_id: &str) -> watch::Receiver<ReleaseState> {
        self.channels
            .get(instance_id)
            .map(|tx| tx.subscribe())
            .unwrap_or_else(|| watch::channel(ReleaseState::NotNeeded).1)
    }

    fn release_remaining(&mut self, needed: bool) {
        let state = if needed {
            ReleaseState::Released
        } else {
            ReleaseState::NotNeeded
        };
        while let Some(id) = self.pending.pop() {
            release(&self.channels, &id, state);
        }
    }
}

struct ZoneEntry {
    instance_ids: Vec<String>,
    outstanding: usize,
    failed: bool,
}

/// Zone-counting tracker: a zone succeeds when every instance in it
/// succeeded, fails on its first instance failure. Quorum is
/// `zones - max_unavailable_zones` successful zones.
pub struct ZoneAwareResultTracker {
    channels: HashMap<String, watch::Sender<ReleaseState>>,
    zone_of: HashMap<String, String>,
    zones: HashMap<String, ZoneEntry>,
    /// Not-yet-released zones in randomized order
    pending_zones: Vec<String>,
    min_success_zones: usize,
    max_unavailable_zones: usize,
    succeeded_zones: usize,
    failed_zones: usize,
}

impl ZoneAwareResultTracker {
    pub fn new(set: &ReplicationSet) -> Self {
        let mut zones: HashMap<String, ZoneEntry> = HashMap::new();
        let mut zone_of = HashMap::new();
        for instance in &set.instances {
            zone_of.insert(instance.id.clone(), instance.zone.clone());
            let entry = zones.entry(instance.zone.clone()).or_insert(ZoneEntry {
                instance_ids: Vec::new(),
                outstanding: 0,
                failed: false,
            });
            entry.instance_ids.push(instance.id.clone());
            entry.outstanding += 1;
        }
        let mut pending_zones: Vec<String> = zones.keys().cloned().collect();
        pending_zones.shuffle(&mut rand::thread_rng());
        Self {
            channels: release_channels(set),
            zone_of,
            min_success_zones: zones.len().saturating_sub(set.max_unavailable_zones),
            max_unavailable_zones: set.max_unavailable_zones,
            zones,
            pending_zones,
            succeeded_zones: 0,
            failed_zones: 0,
        }
    }

    fn release_zone(&mut self, zone: &str) {
        if let Some(entry) = self.zones.get(zone) {
            for id in &entry.instance_ids {
                release(&self.channels, id, ReleaseState::Released);
            }
        }
    }
}

impl ResultTracker for ZoneAwareResultTracker {
    fn done(&mut self, instance_id: &str, success: bool) {
        let Some(zone) = self.zone_of.get(instance_id).cloned() else {
            return;
        };
        let Some(entry) = self.zones.get_mut(&zone) else {
            return;
        };
        if success {
            entry.outstanding -= 1;
            if entry.outstanding == 0 && !entry.failed {
                self.succeeded_zones += 1;
            }
        } else if !entry.failed {
            // First failure sinks the whole zone.
            entry.failed = true;
            self.failed_zones += 1;
            debug!(instance = instance_id, zone = %zone, "zone failed, hedging with one more zone");
            self.start_additional_requests();
        }
    }

    fn succeeded(&self) -> bool {
        self.succeeded_zones >= self.min_success_zones
    }

    fn failed(&self) -> bool {
        self.failed_zones > self.max_unavailable_zones
    }

    fn start_minimum_requests(&mut self) {
        for _ in 0..self.min_success_zones {
            self.start_additional_requests();
        }
    }

    fn start_additional_requests(&mut self) {
        if let Some(zone) = self.pending_zones.pop() {
            self.release_zone(&zone);
        }
    }

    fn start_all_requests(&mut self) {
        while let Some(zone) = self.pending_zones.pop() {
            self.release_zone(&zone);
        }
    }

    fn release_receiver(&self, instance_id: &str) -> watch::Receiver<ReleaseState> {
        self.channels
            .get(instance_id)
            .map(|tx| tx.subscribe())
            .unwrap_or_else(|| watch::channel(ReleaseState::NotNeeded).1)
    }

    fn release_remaining(&mut self, needed: bool) {
        let state = if needed {
            ReleaseState::Released
        } else {
            ReleaseState::NotNeeded
        };
        while let Some(zone) = self.pending_zones.pop() {
            if let Some(entry) = self.zones.get(&zone) {
                for id in &entry.instance_ids {
                    release(&self.channels, id, state);
                }
            }
        }
    }
}

async fn await_release(rx: &mut watch::Receiver<ReleaseState>) -> bool {
    loop {
        match *rx.borrow_and_update() {
            ReleaseState::Released => return true,
            ReleaseState::NotNeeded => return false,
            ReleaseState::Pending => {}
        }
        if rx.changed().await.is_err() {
            return false;
        }
    }
}

/// Run `f` against the replication set until quorum is reached.
///
/// With `minimize_requests` only the quorum-minimum number of requests is
/// started (chosen at random), one more being hedged in per failure.
/// Returns the successful results once the tracker reports quorum, or the
/// last error once failure is certain. Successful results that arrive
/// after the outcome is decided are passed to `cleanup`.
pub async fn do_until_quorum<F, Fut, T, C>(
    set: &ReplicationSet,
    minimize_requests: bool,
    f: F,
    cleanup: C,
) -> Result<Vec<T>>
where
    F: Fn(InstanceDesc) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
    C: Fn(T) + Send + 'static,
{
    let mut tracker: Box<dyn ResultTracker> = if set.zone_awareness_enabled {
        Box::new(ZoneAwareResultTracker::new(set))
    } else {
        Box::new(DefaultResultTracker::new(set))
    };

    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(String, Result<T>)>();
    for instance in set.instances.clone() {
        let mut rx = tracker.release_receiver(&instance.id);
        let f = f.clone();
        let result_tx = result_tx.clone();
        tokio::spawn(async move {
            if await_release(&mut rx).await {
                let id = instance.id.clone();
                let _ = result_tx.send((id, f(instance).await));
            }
        });
    }
    drop(result_tx);

    if minimize_requests {
        tracker.start_minimum_requests();
    } else {
        tracker.start_all_requests();
    }

    let mut results = Vec::new();
    let mut last_err: Option<Error> = None;
    let outcome = loop {
        if tracker.succeeded() {
            break Ok(());
        }
        if tracker.failed() {
            break Err(last_err.take().unwrap_or(Error::TooManyUnhealthy));
        }
        match result_rx.recv().await {
            Some((id, Ok(value))) => {
                results.push(value);
                tracker.done(&id, true);
            }
            Some((id, Err(e))) => {
                last_err = Some(e);
                tracker.done(&id, false);
            }
            None => break Err(last_err.take().unwrap_or(Error::TooManyUnhealthy)),
        }
    };

    tracker.release_remaining(false);
    // Late arrivals are drained off-path so their results are not leaked.
    tokio::spawn(async move {
        while let Some((_, result)) = result_rx.recv().await {
            if let Ok(value) = result {
                cleanup(value);
            }
        }
    });

    outcome.map(|_| results)
}
