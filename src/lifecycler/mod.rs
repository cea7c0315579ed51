//! Instance lifecycle management
//!
//! [`BasicLifecycler`] is the write side of the ring: a small actor that
//! registers one instance into the ring descriptor, heartbeats it, serves
//! ad-hoc state changes, re-verifies token ownership, and unregisters on
//! shutdown. All ring mutations go through KV CAS so concurrent
//! lifecyclers converge.
//!
//! Policy lives in a [`Delegate`] chain: the innermost delegate decides
//! the registration state and tokens, decorators add leave-on-stopping,
//! token-file persistence and auto-forget behavior on top.

pub mod delegates;

pub use delegates::{
    AutoForgetDelegate, DefaultDelegate, Delegate, LeaveOnStoppingDelegate,
    TokensPersistencyDelegate,
};

use crate::common::{timestamp_now, Error, LifecyclerConfig, Result};
use crate::kv::KvStore;
use crate::ring::model::{InstanceDesc, InstanceState, RingDesc};
use crate::token::{Token, TokenGenerator, Tokens};
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

/// The slice of the lifecycler a [`Delegate`] may use during `on_stopping`.
#[async_trait]
pub trait LifecyclerOps: Send + Sync {
    fn instance_id(&self) -> &str;
    fn state(&self) -> Option<InstanceState>;
    fn tokens(&self) -> Tokens;
    fn keep_instance_in_ring_on_shutdown(&self) -> bool;
    async fn change_state(&self, state: InstanceState) -> Result<()>;
}

enum Command {
    ChangeState(InstanceState, oneshot::Sender<Result<()>>),
    ChangeReadOnly(bool, oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<()>),
}

/// Registers and maintains one instance in the ring.
///
/// Construct with [`BasicLifecycler::new`], then drive it by spawning
/// [`run`](BasicLifecycler::run). Accessors and commands work from any
/// task holding the `Arc`.
pub struct BasicLifecycler {
    cfg: LifecyclerConfig,
    ring_key: String,
    store: Arc<dyn KvStore<RingDesc>>,
    delegate: Arc<dyn Delegate>,
    generator: Arc<dyn TokenGenerator>,
    /// Last descriptor this lifecycler wrote or observed for itself
    local: RwLock<Option<InstanceDesc>>,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: Mutex<Option<mpsc::Receiver<Command>>>,
}

impl BasicLifecycler {
    pub fn new(
        cfg: LifecyclerConfig,
        ring_key: impl Into<String>,
        store: Arc<dyn KvStore<RingDesc>>,
        delegate: Arc<dyn Delegate>,
        generator: Arc<dyn TokenGenerator>,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        Ok(Arc::new(Self {
            cfg,
            ring_key: ring_key.into(),
            store,
            delegate,
            generator,
            local: RwLock::new(None),
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
        }))
    }

    /// Our current descriptor, as last written or observed.
    pub fn instance(&self) -> Option<InstanceDesc> {
        self.local.read().unwrap().clone()
    }

    pub fn is_registered(&self) -> bool {
        self.local.read().unwrap().is_some()
    }

    /// Submit a state change to the running actor and wait for the result.
    pub async fn change_state(&self, state: InstanceState) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ChangeState(state, tx))
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Flip the read-only flag, stamping `read_only_updated_timestamp`.
    pub async fn change_read_only_state(&self, read_only: bool) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ChangeReadOnly(read_only, tx))
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    /// Stop the actor: run the stopping delegate (heartbeats continue
    /// during the drain), then unregister unless configured to stay.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// The actor loop. Registers the instance, then serves heartbeats,
    /// token re-verification and commands until [`stop`](Self::stop).
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut cmd_rx = self
            .cmd_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Other("lifecycler already running".into()))?;

        self.wait_can_join().await?;
        self.register().await?;

        // Auto-join: freshly generated tokens may need an observe window
        // before the instance activates.
        if self.instance().map(|i| i.state) == Some(InstanceState::Joining) {
            self.observe_tokens().await?;
        }
        if let Some(i) = self.instance() {
            if i.state == InstanceState::Active {
                self.delegate.on_tokens_stable(&Tokens::new(i.tokens));
            }
        }
        info!(id = %self.cfg.id, "lifecycler running");

        let mut heartbeat = tokio::time::interval(self.cfg.heartbeat_period());
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        heartbeat.tick().await; // immediate first tick

        let reverify_period = self.cfg.tokens_reverify_period();
        let mut reverify = tokio::time::interval(if reverify_period.is_zero() {
            // effectively never
            Duration::from_secs(365 * 24 * 3600)
        } else {
            reverify_period
        });
        reverify.tick().await;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(id = %self.cfg.id, error = %e, "heartbeat failed, will retry");
                    }
                }
                _ = reverify.tick(), if !reverify_period.is_zero() => {
                    if let Err(e) = self.verify_tokens().await {
                        warn!(id = %self.cfg.id, error = %e, "token verification failed");
                    }
                }
                Some(cmd) = cmd_rx.recv() => match cmd {
                    Command::ChangeState(state, ack) => {
                        let _ = ack.send(self.do_change_state(state).await);
                    }
                    Command::ChangeReadOnly(read_only, ack) => {
                        let _ = ack.send(self.do_change_read_only(read_only).await);
                    }
                    Command::Stop(ack) => {
                        self.stopping().await;
                        let _ = ack.send(());
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    async fn wait_can_join(&self) -> Result<()> {
        if !self.generator.can_join_enabled() {
            return Ok(());
        }
        loop {
            let desc = self.store.get(&self.ring_key).await?.unwrap_or_default();
            match self.generator.can_join(&desc) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!(id = %self.cfg.id, error = %e, "not allowed to join yet");
                    tokio::time::sleep(self.cfg.heartbeat_period()).await;
                }
            }
        }
    }

    async fn register(&self) -> Result<()> {
        let mut registered: Option<InstanceDesc> = None;
        let observe = self.cfg.tokens_observe_period();
        self.store
            .cas(&self.ring_key, {
                let registered = &mut registered;
                Box::new(move |desc: Option<RingDesc>| {
                    let mut desc = desc.unwrap_or_default();
                    let existing = desc.instances.get(&self.cfg.id).cloned();
                    let registered_ts = existing
                        .as_ref()
                        .map(|i| i.registered_timestamp)
                        .filter(|&ts| ts > 0)
                        .unwrap_or_else(timestamp_now);
                    let (read_only, read_only_ts) = existing
                        .as_ref()
                        .map(|i| (i.read_only, i.read_only_updated_timestamp))
                        .unwrap_or((false, 0));

                    let (mut state, mut tokens) = self.delegate.on_register(&desc, existing);

                    let deficit = self.cfg.num_tokens.saturating_sub(tokens.len());
                    if deficit > 0 {
                        let taken: Vec<Token> =
                            desc.token_owners().iter().map(|(t, _)| *t).collect();
                        let fresh = self.generator.generate_tokens(deficit, &taken)?;
                        tokens =
                            Tokens::new(tokens.iter().copied().chain(fresh).collect());
                    }
                    if state == InstanceState::Pending {
                        state = if deficit > 0 && !observe.is_zero() {
                            InstanceState::Joining
                        } else {
                            InstanceState::Active
                        };
                    }

                    let instance = desc.add_instance(
                        &self.cfg.id,
                        &self.cfg.addr,
                        &self.cfg.zone,
                        tokens.into_iter().collect(),
                        state,
                        registered_ts,
                        read_only,
                        read_only_ts,
                    );
                    *registered = Some(instance.clone());
                    Ok(Some(desc))
                })
            })
            .await?;

        if let Some(instance) = registered {
            info!(
                id = %self.cfg.id,
                state = %instance.state,
                tokens = instance.tokens.len(),
                "registered in ring"
            );
            *self.local.write().unwrap() = Some(instance);
        }
        Ok(())
    }

    /// Joining phase: keep heartbeating until the observe window passes,
    /// then claim any tokens lost to conflict resolution and activate.
    async fn observe_tokens(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.cfg.tokens_observe_period();
        let mut heartbeat = tokio::time::interval(self.cfg.heartbeat_period());
        heartbeat.tick().await;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.heartbeat().await {
                        warn!(id = %self.cfg.id, error = %e, "heartbeat failed during observe");
                    }
                }
            }
        }
        self.verify_tokens().await?;
        self.do_change_state(InstanceState::Active).await
    }

    async fn heartbeat(&self) -> Result<()> {
        let snapshot = self.instance();
        let mut updated: Option<InstanceDesc> = None;
        self.store
            .cas(&self.ring_key, {
                let updated = &mut updated;
                let snapshot = &snapshot;
                Box::new(move |desc: Option<RingDesc>| {
                    let mut desc = desc.unwrap_or_default();
                    match desc.instances.get_mut(&self.cfg.id) {
                        Some(instance) => {
                            instance.timestamp = timestamp_now();
                        }
                        None => {
                            // Someone forgot us; re-register from the local copy.
                            if let Some(local) = snapshot {
                                warn!(id = %self.cfg.id, "instance missing from ring, re-adding");
                                desc.add_instance(
                                    &self.cfg.id,
                                    &local.addr,
                                    &local.zone,
                                    local.tokens.clone(),
                                    local.state,
                                    local.registered_timestamp,
                                    local.read_only,
                                    local.read_only_updated_timestamp,
                                );
                            }
                        }
                    }
                    self.delegate.on_heartbeat(&mut desc, &self.cfg.id);
                    *updated = desc.instances.get(&self.cfg.id).cloned();
                    Ok(Some(desc))
                })
            })
            .await?;
        if updated.is_some() {
            *self.local.write().unwrap() = updated;
        }
        Ok(())
    }

    /// Regenerate exactly the token deficit if merge conflict resolution
    /// took tokens away from us.
    async fn verify_tokens(&self) -> Result<()> {
        let mut updated: Option<InstanceDesc> = None;
        self.store
            .cas(&self.ring_key, {
                let updated = &mut updated;
                Box::new(move |desc: Option<RingDesc>| {
                    let mut desc = desc.unwrap_or_default();
                    let Some(instance) = desc.instances.get(&self.cfg.id) else {
                        return Ok(None);
                    };
                    let deficit = self.cfg.num_tokens.saturating_sub(instance.tokens.len());
                    if deficit == 0 {
                        return Ok(None);
                    }
                    debug!(id = %self.cfg.id, deficit, "regenerating lost tokens");
                    let taken: Vec<Token> = desc.token_owners().iter().map(|(t, _)| *t).collect();
                    let fresh = self.generator.generate_tokens(deficit, &taken)?;
                    let instance = desc.instances.get_mut(&self.cfg.id).ok_or_else(|| {
                        Error::InstanceNotFound(self.cfg.id.clone())
                    })?;
                    let mut tokens = instance.tokens.clone();
                    tokens.extend(fresh);
                    tokens.sort_unstable();
                    tokens.dedup();
                    instance.tokens = tokens;
                    instance.timestamp = timestamp_now();
                    *updated = Some(instance.clone());
                    Ok(Some(desc))
                })
            })
            .await?;
        if let Some(instance) = updated {
            self.delegate
                .on_tokens_stable(&Tokens::new(instance.tokens.clone()));
            *self.local.write().unwrap() = Some(instance);
        }
        Ok(())
    }

    async fn do_change_state(&self, new_state: InstanceState) -> Result<()> {
        let mut updated: Option<InstanceDesc> = None;
        self.store
            .cas(&self.ring_key, {
                let updated = &mut updated;
                Box::new(move |desc: Option<RingDesc>| {
                    let mut desc = desc.unwrap_or_default();
                    let instance = desc
                        .instances
                        .get_mut(&self.cfg.id)
                        .ok_or_else(|| Error::InstanceNotFound(self.cfg.id.clone()))?;
                    if !instance.state.can_transition_to(new_state) {
                        return Err(Error::InvalidStateTransition {
                            from: instance.state.to_string(),
                            to: new_state.to_string(),
                        });
                    }
                    instance.state = new_state;
                    instance.timestamp = timestamp_now();
                    *updated = Some(instance.clone());
                    Ok(Some(desc))
                })
            })
            .await?;
        if updated.is_some() {
            info!(id = %self.cfg.id, state = %new_state, "instance state changed");
            *self.local.write().unwrap() = updated;
        }
        Ok(())
    }

    async fn do_change_read_only(&self, read_only: bool) -> Result<()> {
        let mut updated: Option<InstanceDesc> = None;
        self.store
            .cas(&self.ring_key, {
                let updated = &mut updated;
                Box::new(move |desc: Option<RingDesc>| {
                    let mut desc = desc.unwrap_or_default();
                    let instance = desc
                        .instances
                        .get_mut(&self.cfg.id)
                        .ok_or_else(|| Error::InstanceNotFound(self.cfg.id.clone()))?;
                    if instance.read_only == read_only {
                        return Ok(None);
                    }
                    instance.read_only = read_only;
                    instance.read_only_updated_timestamp = timestamp_now();
                    instance.timestamp = timestamp_now();
                    *updated = Some(instance.clone());
                    Ok(Some(desc))
                })
            })
            .await?;
        if updated.is_some() {
            info!(id = %self.cfg.id, read_only, "read-only state changed");
            *self.local.write().unwrap() = updated;
        }
        Ok(())
    }

    async fn stopping(self: &Arc<Self>) {
        // The delegate may drain for a while; keep the heartbeat alive so
        // the instance does not look dead mid-drain.
        let heartbeater = {
            let me = self.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(me.cfg.heartbeat_period());
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if let Err(e) = me.heartbeat().await {
                        warn!(id = %me.cfg.id, error = %e, "heartbeat failed while stopping");
                    }
                }
            })
        };

        self.delegate.on_stopping(self.as_ref()).await;
        heartbeater.abort();

        if self.cfg.keep_instance_in_ring_on_shutdown {
            info!(id = %self.cfg.id, "stopping, instance kept in ring");
            return;
        }
        if let Err(e) = self.unregister().await {
            warn!(id = %self.cfg.id, error = %e, "failed to unregister from ring");
        } else {
            info!(id = %self.cfg.id, "unregistered from ring");
        }
    }

    async fn unregister(&self) -> Result<()> {
        self.store
            .cas(
                &self.ring_key,
                Box::new(move |desc: Option<RingDesc>| {
                    let mut desc = desc.unwrap_or_default();
                    desc.remove_instance(&self.cfg.id);
                    Ok(Some(desc))
                }),
            )
            .await?;
        *self.local.write().unwrap() = None;
        Ok(())
    }
}

#[async_trait]
impl LifecyclerOps for BasicLifecycler {
    fn instance_id(&self) -> &str {
        &self.cfg.id
    }

    fn state(&self) -> Option<InstanceState> {
        self.instance().map(|i| i.state)
    }

    fn tokens(&self) -> Tokens {
        self.instance()
            .map(|i| Tokens::new(i.tokens))
            .unwrap_or_default()
    }

    fn keep_instance_in_ring_on_shutdown(&self) -> bool {
        self.cfg.keep_instance_in_ring_on_shutdown
    }

    async fn change_state(&self, state: InstanceState) -> Result<()> {
        self.do_change_state(state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use crate::token::RandomTokenGenerator;

    fn config(id: &str) -> LifecyclerConfig {
        LifecyclerConfig {
            id: id.to_string(),
            addr: format!("{}:9000", id),
            zone: "zone-a".to_string(),
            num_tokens: 8,
            heartbeat_period_secs: 1,
            tokens_observe_period_secs: 0,
            tokens_reverify_period_secs: 5,
            keep_instance_in_ring_on_shutdown: false,
            tokens_file_path: None,
        }
    }

    fn lifecycler(
        cfg: LifecyclerConfig,
        store: Arc<MemoryKvStore<RingDesc>>,
    ) -> Arc<BasicLifecycler> {
        BasicLifecycler::new(
            cfg,
            "ring",
            store,
            Arc::new(DefaultDelegate),
            Arc::new(RandomTokenGenerator::with_seed(1)),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_registers_active_with_tokens() {
        let store = Arc::new(MemoryKvStore::new());
        let lc = lifecycler(config("i-1"), store.clone());
        let runner = tokio::spawn(lc.clone().run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let desc = store.get("ring").await.unwrap().unwrap();
        let instance = &desc.instances["i-1"];
        assert_eq!(instance.state, InstanceState::Active);
        assert_eq!(instance.tokens.len(), 8);
        assert!(lc.is_registered());

        lc.stop().await;
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_advances_timestamp() {
        let store = Arc::new(MemoryKvStore::new());
        let lc = lifecycler(config("i-1"), store.clone());
        let runner = tokio::spawn(lc.clone().run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let before = store.get("ring").await.unwrap().unwrap().instances["i-1"].timestamp;

        // Several heartbeat periods pass (wall clock still moves under
        // paused tokio time, so compare with >=).
        tokio::time::sleep(Duration::from_secs(3)).await;
        let after = store.get("ring").await.unwrap().unwrap().instances["i-1"].timestamp;
        assert!(after >= before);

        lc.stop().await;
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_unregisters() {
        let store = Arc::new(MemoryKvStore::new());
        let lc = lifecycler(config("i-1"), store.clone());
        let runner = tokio::spawn(lc.clone().run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        lc.stop().await;
        runner.await.unwrap().unwrap();

        let desc = store.get("ring").await.unwrap().unwrap();
        assert!(!desc.instances.contains_key("i-1"));
        assert!(!lc.is_registered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_instance_in_ring_on_shutdown() {
        let store = Arc::new(MemoryKvStore::new());
        let mut cfg = config("i-1");
        cfg.keep_instance_in_ring_on_shutdown = true;
        let lc = BasicLifecycler::new(
            cfg,
            "ring",
            store.clone(),
            Arc::new(LeaveOnStoppingDelegate::new(Arc::new(DefaultDelegate))),
            Arc::new(RandomTokenGenerator::with_seed(1)),
        )
        .unwrap();
        let runner = tokio::spawn(lc.clone().run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        lc.stop().await;
        runner.await.unwrap().unwrap();

        let desc = store.get("ring").await.unwrap().unwrap();
        assert_eq!(desc.instances["i-1"].state, InstanceState::Leaving);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_state_validates_transition() {
        let store = Arc::new(MemoryKvStore::new());
        let lc = lifecycler(config("i-1"), store.clone());
        let runner = tokio::spawn(lc.clone().run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Active → Pending is not allowed.
        let err = lc.change_state(InstanceState::Pending).await.unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        lc.change_state(InstanceState::Leaving).await.unwrap();
        assert_eq!(lc.instance().unwrap().state, InstanceState::Leaving);

        lc.stop().await;
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_read_only_state() {
        let store = Arc::new(MemoryKvStore::new());
        let lc = lifecycler(config("i-1"), store.clone());
        let runner = tokio::spawn(lc.clone().run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        lc.change_read_only_state(true).await.unwrap();

        let instance = store.get("ring").await.unwrap().unwrap().instances["i-1"].clone();
        assert!(instance.read_only);
        assert!(instance.read_only_updated_timestamp > 0);

        lc.stop().await;
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_restores_existing_tokens() {
        let store = Arc::new(MemoryKvStore::new());
        let lc = lifecycler(config("i-1"), store.clone());
        let runner = tokio::spawn(lc.clone().run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let first_tokens = lc.instance().unwrap().tokens;
        // Simulate a crash: the descriptor stays behind.
        runner.abort();
        drop(lc);

        let lc = lifecycler(config("i-1"), store.clone());
        let runner = tokio::spawn(lc.clone().run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(lc.instance().unwrap().tokens, first_tokens);

        lc.stop().await;
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_lifecyclers_share_ring() {
        let store = Arc::new(MemoryKvStore::new());
        let a = lifecycler(config("i-a"), store.clone());
        let b = lifecycler(config("i-b"), store.clone());
        let run_a = tokio::spawn(a.clone().run());
        let run_b = tokio::spawn(b.clone().run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let desc = store.get("ring").await.unwrap().unwrap();
        assert_eq!(desc.instances.len(), 2);

        // Tokens stay globally unique across both registrations.
        let mut all: Vec<Token> = desc.token_owners().iter().map(|(t, _)| *t).collect();
        let before = all.len();
        all.dedup();
        assert_eq!(all.len(), before);

        a.stop().await;
        b.stop().await;
        run_a.await.unwrap().unwrap();
        run_b.await.unwrap().unwrap();
    }
}
