//! Lifecycler delegates
//!
//! Policy hooks for [`BasicLifecycler`](crate::lifecycler::BasicLifecycler),
//! composed as decorators around an innermost delegate:
//! - [`DefaultDelegate`] restores the previous descriptor when one exists
//! - [`LeaveOnStoppingDelegate`] moves the instance to Leaving on shutdown
//! - [`TokensPersistencyDelegate`] saves tokens to a file and restores
//!   them on a clean restart
//! - [`AutoForgetDelegate`] drops ring entries whose heartbeat went stale

use crate::common::timestamp_now;
use crate::lifecycler::LifecyclerOps;
use crate::ring::model::{InstanceDesc, InstanceState, RingDesc};
use crate::token::Tokens;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Lifecycle hooks invoked by the lifecycler. All hooks except
/// `on_stopping` run inside KV CAS transforms and must stay synchronous.
#[async_trait]
pub trait Delegate: Send + Sync {
    /// Decide the state and tokens to register with. `existing` is this
    /// instance's previous descriptor when the ring remembers one.
    /// Returning `Pending` with too few tokens lets the lifecycler
    /// generate the deficit and auto-join.
    fn on_register(
        &self,
        ring: &RingDesc,
        existing: Option<InstanceDesc>,
    ) -> (InstanceState, Tokens);

    /// The instance's token set was (re)established.
    fn on_tokens_stable(&self, _tokens: &Tokens) {}

    /// Called on every heartbeat CAS, after our own timestamp was bumped.
    /// May mutate the descriptor (e.g. forget dead instances).
    fn on_heartbeat(&self, _ring: &mut RingDesc, _instance_id: &str) {}

    /// Called once when the lifecycler stops, before unregistering.
    /// Heartbeats keep running while this hook drains.
    async fn on_stopping(&self, _lifecycler: &dyn LifecyclerOps) {}
}

/// Innermost delegate: rejoin with the remembered state and tokens, or
/// start from scratch as Pending.
pub struct DefaultDelegate;

#[async_trait]
impl Delegate for DefaultDelegate {
    fn on_register(
        &self,
        _ring: &RingDesc,
        existing: Option<InstanceDesc>,
    ) -> (InstanceState, Tokens) {
        match existing {
            // A Left tombstone means this is effectively a fresh join;
            // the old tokens are still worth reclaiming.
            Some(i) if i.state == InstanceState::Left => {
                (InstanceState::Pending, Tokens::new(i.tokens))
            }
            Some(i) => (i.state, Tokens::new(i.tokens)),
            None => (InstanceState::Pending, Tokens::default()),
        }
    }
}

/// Moves the instance to Leaving when stopping, so readers keep routing
/// to it during the drain.
pub struct LeaveOnStoppingDelegate {
    inner: Arc<dyn Delegate>,
}

impl LeaveOnStoppingDelegate {
    pub fn new(inner: Arc<dyn Delegate>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Delegate for LeaveOnStoppingDelegate {
    fn on_register(
        &self,
        ring: &RingDesc,
        existing: Option<InstanceDesc>,
    ) -> (InstanceState, Tokens) {
        self.inner.on_register(ring, existing)
    }

    fn on_tokens_stable(&self, tokens: &Tokens) {
        self.inner.on_tokens_stable(tokens);
    }

    fn on_heartbeat(&self, ring: &mut RingDesc, instance_id: &str) {
        self.inner.on_heartbeat(ring, instance_id);
    }

    async fn on_stopping(&self, lifecycler: &dyn LifecyclerOps) {
        if let Err(e) = lifecycler.change_state(InstanceState::Leaving).await {
            warn!(
                id = lifecycler.instance_id(),
                error = %e,
                "failed to switch to LEAVING on shutdown"
            );
        }
        self.inner.on_stopping(lifecycler).await;
    }
}

/// Persists the token set to a file, restoring it on restart so a clean
/// restart comes back with the same tokens even if the ring forgot them.
pub struct TokensPersistencyDelegate {
    inner: Arc<dyn Delegate>,
    path: PathBuf,
}

impl TokensPersistencyDelegate {
    pub fn new(path: impl Into<PathBuf>, inner: Arc<dyn Delegate>) -> Self {
        Self {
            inner,
            path: path.into(),
        }
    }
}

#[async_trait]
impl Delegate for TokensPersistencyDelegate {
    fn on_register(
        &self,
        ring: &RingDesc,
        existing: Option<InstanceDesc>,
    ) -> (InstanceState, Tokens) {
        if existing.is_some() {
            return self.inner.on_register(ring, existing);
        }
        match Tokens::load(&self.path) {
            Ok(tokens) if !tokens.is_empty() => {
                info!(
                    path = %self.path.display(),
                    tokens = tokens.len(),
                    "restored tokens from file"
                );
                // Hand the restored tokens down as a synthetic previous
                // descriptor; an instance with its full token set rejoins
                // without re-observing.
                let synthetic = InstanceDesc {
                    id: String::new(),
                    addr: String::new(),
                    zone: String::new(),
                    state: InstanceState::Active,
                    tokens: tokens.into_iter().collect(),
                    timestamp: timestamp_now(),
                    registered_timestamp: 0,
                    read_only: false,
                    read_only_updated_timestamp: 0,
                };
                self.inner.on_register(ring, Some(synthetic))
            }
            Ok(_) => self.inner.on_register(ring, None),
            Err(e) => {
                // Missing file is the common first-boot case.
                if !self.path.exists() {
                    return self.inner.on_register(ring, None);
                }
                warn!(path = %self.path.display(), error = %e, "could not load tokens file");
                self.inner.on_register(ring, None)
            }
        }
    }

    fn on_tokens_stable(&self, tokens: &Tokens) {
        if let Err(e) = tokens.save(&self.path) {
            warn!(path = %self.path.display(), error = %e, "could not persist tokens file");
        }
        self.inner.on_tokens_stable(tokens);
    }

    fn on_heartbeat(&self, ring: &mut RingDesc, instance_id: &str) {
        self.inner.on_heartbeat(ring, instance_id);
    }

    async fn on_stopping(&self, lifecycler: &dyn LifecyclerOps) {
        // The tokens only stay meaningful if the instance stays in the ring.
        if !lifecycler.keep_instance_in_ring_on_shutdown() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if self.path.exists() {
                    warn!(path = %self.path.display(), error = %e, "could not remove tokens file");
                }
            }
        }
        self.inner.on_stopping(lifecycler).await;
    }
}

/// Forgets ring entries whose heartbeat is older than the forget period.
/// Runs on every heartbeat, never touching our own entry.
pub struct AutoForgetDelegate {
    inner: Arc<dyn Delegate>,
    forget_period: Duration,
}

impl AutoForgetDelegate {
    pub fn new(forget_period: Duration, inner: Arc<dyn Delegate>) -> Self {
        Self {
            inner,
            forget_period,
        }
    }
}

#[async_trait]
impl Delegate for AutoForgetDelegate {
    fn on_register(
        &self,
        ring: &RingDesc,
        existing: Option<InstanceDesc>,
    ) -> (InstanceState, Tokens) {
        self.inner.on_register(ring, existing)
    }

    fn on_tokens_stable(&self, tokens: &Tokens) {
        self.inner.on_tokens_stable(tokens);
    }

    fn on_heartbeat(&self, ring: &mut RingDesc, instance_id: &str) {
        let now = timestamp_now();
        let cutoff = now.saturating_sub(self.forget_period.as_secs());
        let stale: Vec<String> = ring
            .instances
            .iter()
            .filter(|(id, i)| id.as_str() != instance_id && i.timestamp < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            warn!(
                instance = %id,
                forget_after_secs = self.forget_period.as_secs(),
                "auto-forgetting unhealthy instance"
            );
            ring.remove_instance(&id);
        }
        self.inner.on_heartbeat(ring, instance_id);
    }

    async fn on_stopping(&self, lifecycler: &dyn LifecyclerOps) {
        self.inner.on_stopping(lifecycler).await;
    }
}
