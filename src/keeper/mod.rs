//! Per-endpoint keeper: the state machine's event loops and the failover
//! and stop protocols.
//!
//! Four concurrent loops feed one bounded event queue consumed strictly in
//! order by a single task, which is what makes the activation/deactivation
//! side effects safe without their own locking:
//!
//! 1. lock-acquisition (ticks every keepalive interval, woken early by
//!    topology changes; debounces transient store errors into `Fault`)
//! 2. health-check (threshold of consecutive failures retires the endpoint)
//! 3. plugin-ensure (while activated; exponential backoff, ±25% jitter)
//! 4. the event consumer applying [`fsm::transition`] and running effects
//!
//! Every loop checks the cancellation token at the top of each iteration;
//! there is no hard interrupt of an in-flight store call, so the stop
//! protocol tolerates one final stale event after cancellation (the
//! transition re-checks state before acting).

pub mod fsm;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rand::Rng;
use snafu::ResultExt;
use tokio::sync::{Notify, mpsc};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{Endpoint, HealthChecker, KeyValueStore, Plugin, Storage, Watcher};
use crate::config::KeeperConfig;
use crate::error::{EngineError, NoOtherHostsSnafu, NotMasterSnafu, StorageSnafu};
use crate::lease::LeaseManager;
use crate::locker::EndpointLocker;

use fsm::{Effect, EndpointEvent, EndpointState, transition};

/// Events are few and the consumer is fast; a small bound is plenty and
/// keeps a stuck plugin from buffering unbounded history.
const EVENT_QUEUE_DEPTH: usize = 16;

/// Manages one endpoint: holds the locker, runs the loops, and implements
/// the failover and stop protocols.
pub struct EndpointKeeper {
    endpoint: Endpoint,
    config: KeeperConfig,
    store: Arc<dyn KeyValueStore>,
    storage: Arc<dyn Storage>,
    plugin: Arc<dyn Plugin>,
    checker: Arc<dyn HealthChecker>,
    watcher: Arc<dyn Watcher>,
    locker: Arc<EndpointLocker>,
    state: RwLock<EndpointState>,
    /// Taken (and dropped) by the stop protocol to close the event queue.
    events: parking_lot::Mutex<Option<mpsc::Sender<EndpointEvent>>>,
    topology: Notify,
    cancel: CancellationToken,
    /// Serializes the stop protocol against itself and the loops' shutdown.
    stop_guard: tokio::sync::Mutex<()>,
}

impl EndpointKeeper {
    /// Link this host to the endpoint's election key and launch the loops.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        endpoint: Endpoint,
        config: KeeperConfig,
        store: Arc<dyn KeyValueStore>,
        storage: Arc<dyn Storage>,
        leases: Arc<LeaseManager>,
        plugin: Arc<dyn Plugin>,
        checker: Arc<dyn HealthChecker>,
        watcher: Arc<dyn Watcher>,
    ) -> Result<Arc<Self>, EngineError> {
        let locker = EndpointLocker::start(
            store.clone(),
            leases,
            &config.key_root,
            &endpoint.election_key,
            config.hostname.clone(),
        );

        storage
            .link_endpoint(&endpoint.election_key)
            .await
            .context(StorageSnafu)?;

        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let keeper = Arc::new(Self {
            endpoint,
            config,
            store,
            storage,
            plugin,
            checker,
            watcher,
            locker,
            state: RwLock::new(EndpointState::Standby),
            events: parking_lot::Mutex::new(Some(tx)),
            topology: Notify::new(),
            cancel: CancellationToken::new(),
            stop_guard: tokio::sync::Mutex::new(()),
        });

        info!(
            endpoint = %keeper.endpoint.id,
            election_key = %keeper.endpoint.election_key,
            "endpoint keeper started"
        );

        tokio::spawn(Arc::clone(&keeper).event_loop(rx));
        tokio::spawn(Arc::clone(&keeper).lock_loop());
        tokio::spawn(Arc::clone(&keeper).health_loop());
        tokio::spawn(Arc::clone(&keeper).ensure_loop());
        Ok(keeper)
    }

    pub fn id(&self) -> uuid::Uuid {
        self.endpoint.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Current state of the endpoint on this host.
    pub fn status(&self) -> EndpointState {
        *self.state.read()
    }

    /// Called by the topology watcher when host-link records change.
    ///
    /// Ignored while activated — the lock holder has nothing to race for;
    /// otherwise the lock-acquisition loop attempts promptly instead of
    /// waiting for its next tick.
    pub fn notify_topology_change(&self) {
        self.topology.notify_one();
    }

    /// Operator-triggered hand-off: release the lock and nudge the other
    /// listeners to race for it.
    pub async fn failover(&self) -> Result<(), EngineError> {
        let master = self.locker.is_master().await.unwrap_or(false);
        if !master {
            return NotMasterSnafu {
                hostname: self.config.hostname.clone(),
                key: self.locker.key().to_string(),
            }
            .fail();
        }

        let hosts = self
            .storage
            .endpoint_hosts(&self.endpoint.election_key)
            .await
            .context(StorageSnafu)?;
        if !hosts.iter().any(|host| host != &self.config.hostname) {
            return NoOtherHostsSnafu {
                election_key: self.endpoint.election_key.clone(),
            }
            .fail();
        }

        self.locker.unlock().await?;
        // A redundant link write still fires topology watchers on the other
        // hosts, prompting them to race for the now-free key.
        self.storage
            .link_endpoint(&self.endpoint.election_key)
            .await
            .context(StorageSnafu)?;

        info!(endpoint = %self.endpoint.id, "failover initiated, lock released");
        Ok(())
    }

    /// Graceful shutdown. Order matters:
    ///
    /// 1. snapshot link list and mastership (no lock needed for the reads)
    /// 2. under the stop lock: cancel the loops, stop the locker and the
    ///    watcher, remove this host's link record
    /// 3. if we were master and others listen, wait (bounded) for one of
    ///    them to take over; a timeout is logged, never aborts shutdown
    /// 4. apply a final demotion directly — the normal send path is closed
    ///    once cancelled — then close the event queue
    pub async fn stop(&self) {
        let hosts = self
            .storage
            .endpoint_hosts(&self.endpoint.election_key)
            .await
            .unwrap_or_default();
        let was_master = self.locker.is_master().await.unwrap_or(false);

        let _guard = self.stop_guard.lock().await;
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();

        self.locker.stop().await;
        self.watcher.stop().await;
        if let Err(error) = self.storage.unlink_endpoint(&self.endpoint.election_key).await {
            warn!(endpoint = %self.endpoint.id, %error, "failed to remove host link during stop");
        }

        let others_listening = hosts.iter().any(|host| host != &self.config.hostname);
        if was_master && others_listening {
            self.wait_for_reallocation().await;
        }

        if self.status() != EndpointState::Failing {
            self.apply(EndpointEvent::Demoted).await;
        }
        // Dropping the sender ends the consumer loop.
        self.events.lock().take();
        info!(endpoint = %self.endpoint.id, "endpoint keeper stopped");
    }

    /// Poll for another host to pick up the ownership key, bounded by one
    /// keepalive interval.
    async fn wait_for_reallocation(&self) {
        let deadline = Instant::now() + self.config.keepalive_interval();
        loop {
            match self.store.get(self.locker.key()).await {
                Ok(Some(entry)) if entry.value != self.config.hostname => {
                    info!(
                        endpoint = %self.endpoint.id,
                        new_owner = %entry.value,
                        "endpoint reallocated"
                    );
                    return;
                }
                Ok(_) => {}
                Err(error) => {
                    debug!(endpoint = %self.endpoint.id, %error, "reallocation poll failed");
                }
            }
            if Instant::now() >= deadline {
                warn!(
                    endpoint = %self.endpoint.id,
                    "timed out waiting for another host to take over"
                );
                return;
            }
            tokio::time::sleep(self.config.stop_poll_interval()).await;
        }
    }

    /// Send an event through the queue. Dropped silently once stopped; the
    /// stop protocol applies its final demotion directly instead.
    async fn emit(&self, event: EndpointEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        let sender = self.events.lock().clone();
        if let Some(tx) = sender {
            if tx.send(event).await.is_err() {
                debug!(endpoint = %self.endpoint.id, ?event, "event dropped, queue closed");
            }
        }
    }

    /// Apply one event: pure transition under the state lock, effects after.
    async fn apply(&self, event: EndpointEvent) {
        let (previous, outcome) = {
            let mut state = self.state.write();
            let previous = *state;
            let outcome = transition(previous, event);
            *state = outcome.next;
            (previous, outcome)
        };

        if outcome.next != previous {
            info!(
                endpoint = %self.endpoint.id,
                from = %previous,
                to = %outcome.next,
                ?event,
                "state transition"
            );
        }
        for effect in outcome.effects {
            self.run_effect(effect).await;
        }
    }

    async fn run_effect(&self, effect: Effect) {
        match effect {
            Effect::Activate => {
                if let Err(error) = self.plugin.activate().await {
                    warn!(endpoint = %self.endpoint.id, %error, "plugin activation failed");
                }
            }
            Effect::Deactivate => {
                if let Err(error) = self.plugin.deactivate().await {
                    warn!(endpoint = %self.endpoint.id, %error, "plugin deactivation failed");
                }
            }
            Effect::ReleaseLock => match self.locker.unlock().await {
                Ok(()) => {}
                // Not holding the lock is fine here; the release is
                // best-effort.
                Err(EngineError::NotMaster { .. }) | Err(EngineError::InvalidState { .. }) => {}
                Err(error) => {
                    warn!(endpoint = %self.endpoint.id, %error, "best-effort unlock failed");
                }
            },
        }
    }

    /// Single consumer: events are processed one at a time, in the order
    /// emitted.
    async fn event_loop(self: Arc<Self>, mut rx: mpsc::Receiver<EndpointEvent>) {
        while let Some(event) = rx.recv().await {
            self.apply(event).await;
        }
        debug!(endpoint = %self.endpoint.id, "event consumer finished");
    }

    async fn lock_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.keepalive_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut debounce = FaultDebounce::new(self.config.fault_threshold);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.topology.notified() => {
                    // Already the lock holder; topology noise is irrelevant.
                    if self.status() == EndpointState::Activated {
                        continue;
                    }
                    debug!(endpoint = %self.endpoint.id, "topology change, acquiring now");
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }
            // A retired endpoint must not reacquire the lock; that would
            // keep healthy hosts from taking over.
            if self.status() == EndpointState::Failing {
                continue;
            }

            if let Err(error) = self.locker.refresh().await {
                let escalate = debounce.record_failure();
                warn!(
                    endpoint = %self.endpoint.id,
                    %error,
                    failures = debounce.failures(),
                    "lock refresh failed"
                );
                if escalate {
                    self.emit(EndpointEvent::Fault).await;
                }
                continue;
            }
            debounce.record_success();

            match self.locker.is_master().await {
                Ok(true) => self.emit(EndpointEvent::Elected).await,
                Ok(false) | Err(EngineError::InvalidState { .. }) => {
                    self.emit(EndpointEvent::Demoted).await
                }
                Err(error) => {
                    warn!(endpoint = %self.endpoint.id, %error, "mastership check failed");
                }
            }
        }
    }

    async fn health_loop(self: Arc<Self>) {
        let period = self
            .endpoint
            .health_check_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.health_check_interval());
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.checker.check().await {
                Ok(()) => {
                    failures = 0;
                    self.emit(EndpointEvent::HealthCheckSuccess).await;
                }
                Err(error) => {
                    failures += 1;
                    warn!(
                        endpoint = %self.endpoint.id,
                        %error,
                        failures,
                        threshold = self.config.health_fail_threshold,
                        "health check failed"
                    );
                    // Emit exactly once when the threshold is crossed.
                    if failures == self.config.health_fail_threshold {
                        self.emit(EndpointEvent::HealthCheckFail).await;
                    }
                }
            }
        }
    }

    async fn ensure_loop(self: Arc<Self>) {
        let base = self.config.ensure_interval();
        let max = self.config.ensure_max_backoff();
        let mut delay = base;

        loop {
            let sleep_for = jitter(delay);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep_for) => {}
            }
            if self.status() != EndpointState::Activated {
                delay = base;
                continue;
            }

            match self.plugin.ensure().await {
                Ok(()) => delay = base,
                Err(error) => {
                    delay = (delay * 2).min(max);
                    warn!(
                        endpoint = %self.endpoint.id,
                        %error,
                        next_attempt_ms = delay.as_millis() as u64,
                        "plugin ensure failed, backing off"
                    );
                }
            }
        }
    }
}

/// Consecutive-failure counter gating `Fault` emission.
///
/// Transient store hiccups are absorbed: the first `threshold - 1`
/// consecutive failures produce nothing, the `threshold`-th produces exactly
/// one escalation, then the count restarts.
struct FaultDebounce {
    failures: u32,
    threshold: u32,
}

impl FaultDebounce {
    fn new(threshold: u32) -> Self {
        Self {
            failures: 0,
            threshold: threshold.max(1),
        }
    }

    fn failures(&self) -> u32 {
        self.failures
    }

    /// Returns `true` when the failure should escalate to a fault event.
    fn record_failure(&mut self) -> bool {
        self.failures += 1;
        if self.failures >= self.threshold {
            self.failures = 0;
            return true;
        }
        false
    }

    fn record_success(&mut self) {
        self.failures = 0;
    }
}

/// ±25% jitter so many endpoints on one host do not thunder in lockstep.
fn jitter(duration: Duration) -> Duration {
    let ms = duration.as_millis() as u64;
    if ms < 4 {
        return duration;
    }
    let spread = ms / 4;
    let jittered = rand::rng().random_range(ms - spread..=ms + spread);
    Duration::from_millis(jittered)
}
