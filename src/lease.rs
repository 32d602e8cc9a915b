//! Host lease lifecycle.
//!
//! One [`LeaseManager`] per host owns a single renewable lease against the
//! key-value store. Every ownership key this host creates is bound to that
//! lease, so a crash or a lost network partition expires all of them
//! together and failover proceeds without any explicit cleanup.
//!
//! The lease id is persisted in the durable [`Host`](crate::api::Host)
//! record; a restarted process resumes the same lease (as long as it has not
//! expired server-side) instead of triggering a spurious failover.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use snafu::ResultExt;
use tokio::sync::{Notify, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{KeyValueStore, LeaseId, Storage, StoreError};
use crate::config::KeeperConfig;
use crate::error::{CallbackNotFoundSnafu, EngineError, LeaseTimeoutSnafu, StorageSnafu};

/// Callback invoked with `(old, new)` whenever the host lease is replaced.
///
/// Callbacks run on their own spawned task; no ordering is guaranteed across
/// subscribers, and a slow subscriber never blocks lease regeneration.
pub type LeaseChangeCallback = Arc<dyn Fn(LeaseId, LeaseId) + Send + Sync>;

/// Identifier returned by [`LeaseManager::subscribe_to_lease_change`].
pub type SubscriptionId = u64;

#[derive(Debug)]
struct LeaseState {
    id: LeaseId,
    refreshed_at: Instant,
    /// Forces regeneration on the next refresh cycle.
    dirty: bool,
}

/// Owns the single renewable host lease and fans out lease changes.
///
/// The lease id is the only mutable state shared between the manager and the
/// lockers of this host: the manager is its exclusive writer, lockers only
/// read it.
pub struct LeaseManager {
    store: Arc<dyn KeyValueStore>,
    storage: Arc<dyn Storage>,
    config: KeeperConfig,
    state: RwLock<LeaseState>,
    subscribers: RwLock<HashMap<SubscriptionId, LeaseChangeCallback>>,
    next_subscription: AtomicU64,
    /// Wakes the refresh loop ahead of its tick after a dirty mark.
    wake: Notify,
    cancel: CancellationToken,
}

impl LeaseManager {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        storage: Arc<dyn Storage>,
        config: KeeperConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            storage,
            config,
            state: RwLock::new(LeaseState {
                id: LeaseId::NONE,
                refreshed_at: Instant::now(),
                dirty: false,
            }),
            subscribers: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(0),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Load any persisted lease and launch the refresh loop.
    ///
    /// A persisted lease id is validated with one keep-alive probe; any probe
    /// failure marks the lease dirty so the loop regenerates immediately.
    /// Only a failure to load the host record aborts startup.
    pub async fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        let host = self.storage.current_host().await.context(StorageSnafu)?;

        if host.lease_id.is_none() {
            self.state.write().dirty = true;
        } else {
            match self.store.keep_alive(host.lease_id).await {
                Ok(()) => {
                    let mut state = self.state.write();
                    state.id = host.lease_id;
                    state.refreshed_at = Instant::now();
                    info!(lease = %host.lease_id, "resumed persisted lease");
                }
                Err(error) => {
                    warn!(
                        lease = %host.lease_id,
                        %error,
                        "persisted lease unusable, regenerating"
                    );
                    self.state.write().dirty = true;
                }
            }
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.refresh_loop().await });
        Ok(())
    }

    /// Terminate the refresh loop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// The current lease id without waiting. May be [`LeaseId::NONE`] before
    /// the first lease has been generated.
    pub fn current_lease(&self) -> LeaseId {
        self.state.read().id
    }

    /// The current lease id, waiting for one to be generated if necessary.
    ///
    /// Gives up with [`EngineError::LeaseTimeout`] after a small multiple of
    /// the keepalive interval.
    pub async fn get_lease(&self) -> Result<LeaseId, EngineError> {
        let current = self.current_lease();
        if !current.is_none() {
            return Ok(current);
        }

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let subscription = self.subscribe_to_lease_change(Arc::new(move |_old, new| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(new);
            }
        }));

        // A lease may have been generated between the read and the subscribe.
        let current = self.current_lease();
        if !current.is_none() {
            let _ = self.unsubscribe(subscription);
            return Ok(current);
        }

        let wait = self.config.lease_wait_timeout();
        let result = tokio::time::timeout(wait, rx).await;
        let _ = self.unsubscribe(subscription);

        match result {
            Ok(Ok(lease)) => Ok(lease),
            _ => LeaseTimeoutSnafu {
                waited_ms: wait.as_millis() as u64,
            }
            .fail(),
        }
    }

    /// Report that `lease` may be broken (a locker got a store error while
    /// using it).
    ///
    /// Stale reports for a lease that was already replaced are ignored; a
    /// report for the current lease forces regeneration on the next cycle
    /// and wakes the refresh loop immediately.
    pub fn mark_lease_dirty(&self, lease: LeaseId) {
        let mut state = self.state.write();
        if state.id != lease {
            debug!(reported = %lease, current = %state.id, "stale dirty report ignored");
            return;
        }
        if !state.dirty {
            state.dirty = true;
            drop(state);
            self.wake.notify_one();
        }
    }

    /// Register a callback for lease changes. Returns the id to pass to
    /// [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe_to_lease_change(&self, callback: LeaseChangeCallback) -> SubscriptionId {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst) + 1;
        self.subscribers.write().insert(id, callback);
        id
    }

    /// Remove a lease-change subscription.
    pub fn unsubscribe(&self, subscription_id: SubscriptionId) -> Result<(), EngineError> {
        match self.subscribers.write().remove(&subscription_id) {
            Some(_) => Ok(()),
            None => CallbackNotFoundSnafu { subscription_id }.fail(),
        }
    }

    async fn refresh_loop(&self) {
        let mut ticker = interval(self.config.keepalive_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            keepalive_ms = self.config.keepalive_interval_ms,
            ttl_ms = self.config.lease_ttl_ms,
            "lease refresh loop started"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("lease refresh loop shutting down");
                    break;
                }
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            self.refresh_once().await;
        }
    }

    /// One refresh cycle: regenerate when the lease is absent, dirty or
    /// overdue, otherwise renew in place. Renewal failure never crashes the
    /// process; the ownership keys simply expire and failover proceeds.
    async fn refresh_once(&self) {
        let (id, dirty, refreshed_at) = {
            let state = self.state.read();
            (state.id, state.dirty, state.refreshed_at)
        };

        let needs_new = id.is_none() || dirty || refreshed_at.elapsed() >= self.config.lease_ttl();
        if needs_new {
            self.regenerate(id).await;
            return;
        }

        match self.store.keep_alive(id).await {
            Ok(()) => {
                self.state.write().refreshed_at = Instant::now();
                debug!(lease = %id, "lease renewed");
            }
            Err(StoreError::LeaseNotFound { .. }) => {
                warn!(lease = %id, "lease expired server-side, forcing regeneration");
                self.mark_lease_dirty(id);
            }
            Err(error) => {
                warn!(lease = %id, %error, "lease renewal failed, retrying on next tick");
            }
        }
    }

    async fn regenerate(&self, old: LeaseId) {
        let new = match self.store.grant_lease(self.config.lease_ttl()).await {
            Ok(lease) => lease,
            Err(error) => {
                warn!(%error, "lease generation failed, retrying on next tick");
                return;
            }
        };

        {
            let mut state = self.state.write();
            state.id = new;
            state.dirty = false;
            state.refreshed_at = Instant::now();
        }
        info!(old = %old, new = %new, "lease generated");

        self.fan_out(old, new);
        self.persist(new).await;
    }

    /// Invoke every subscriber on its own task.
    fn fan_out(&self, old: LeaseId, new: LeaseId) {
        let callbacks: Vec<LeaseChangeCallback> =
            self.subscribers.read().values().cloned().collect();
        for callback in callbacks {
            tokio::spawn(async move { callback(old, new) });
        }
    }

    /// Record the new lease id in the durable host record.
    async fn persist(&self, lease: LeaseId) {
        let mut host = match self.storage.current_host().await {
            Ok(host) => host,
            Err(error) => {
                warn!(%error, "failed to load host record, lease id not persisted");
                return;
            }
        };
        host.lease_id = lease;
        if let Err(error) = self.storage.save_host(&host).await {
            warn!(%error, "failed to persist lease id");
        }
    }
}
