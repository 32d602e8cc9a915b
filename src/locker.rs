//! Per-endpoint distributed lock.
//!
//! An [`EndpointLocker`] maintains one ownership key in the store: the key's
//! value is the owning hostname and its bound lease is the owner's current
//! host lease. A host is master of the endpoint iff the key exists and its
//! lease equals this host's current lease. The key decays automatically with
//! the lease, so crash failover needs no explicit cleanup.

use std::sync::{Arc, OnceLock, Weak};

use snafu::ResultExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::{KeyValueStore, LeaseId};
use crate::error::{EngineError, InvalidStateSnafu, NotMasterSnafu, StoreSnafu};
use crate::lease::{LeaseManager, SubscriptionId};

/// Ownership key for an election key: `<root>/default/<storable>`, where the
/// storable form replaces path separators so the election key cannot escape
/// the namespace in a path-like store.
pub fn ownership_key(root: &str, election_key: &str) -> String {
    let storable = election_key.replace('/', "_");
    format!("{root}/default/{storable}")
}

/// Holds (or tries to hold) the ownership key of a single endpoint.
pub struct EndpointLocker {
    store: Arc<dyn KeyValueStore>,
    leases: Arc<LeaseManager>,
    /// The ownership key this locker manages.
    key: String,
    hostname: String,
    /// Serializes all writers of the ownership key: `refresh`, `unlock`,
    /// `stop` and the lease-change reaction.
    guard: Mutex<()>,
    subscription: OnceLock<SubscriptionId>,
}

impl EndpointLocker {
    /// Create the locker and register its lease-change subscription.
    pub fn start(
        store: Arc<dyn KeyValueStore>,
        leases: Arc<LeaseManager>,
        root: &str,
        election_key: &str,
        hostname: impl Into<String>,
    ) -> Arc<Self> {
        let locker = Arc::new(Self {
            store,
            leases: leases.clone(),
            key: ownership_key(root, election_key),
            hostname: hostname.into(),
            guard: Mutex::new(()),
            subscription: OnceLock::new(),
        });

        let weak: Weak<EndpointLocker> = Arc::downgrade(&locker);
        let subscription = leases.subscribe_to_lease_change(Arc::new(move |old, new| {
            if let Some(locker) = weak.upgrade() {
                tokio::spawn(async move { locker.handle_lease_change(old, new).await });
            }
        }));
        locker
            .subscription
            .set(subscription)
            .expect("subscription set once at construction");

        locker
    }

    /// Ensure this host's ownership key exists and is bound to the current
    /// lease.
    ///
    /// A single atomic conditional create: if the key already exists — no
    /// matter who owns it — this is a no-op and never overwrites another
    /// owner. Any store error marks the lease dirty so the lease manager can
    /// detect and repair lease loss.
    pub async fn refresh(&self) -> Result<(), EngineError> {
        let _guard = self.guard.lock().await;
        let lease = self.leases.get_lease().await?;

        match self
            .store
            .create_if_absent(&self.key, &self.hostname, lease)
            .await
        {
            Ok(created) => {
                if created {
                    info!(key = %self.key, lease = %lease, "ownership key created");
                } else {
                    self.repair_stale_binding(lease).await;
                }
                Ok(())
            }
            Err(error) => {
                self.leases.mark_lease_dirty(lease);
                Err(error).context(StoreSnafu)
            }
        }
    }

    /// If the key carries this hostname but an older lease, the rotation
    /// callback has not caught up yet; rebind here, under the writer guard,
    /// so the mastership check that follows sees a consistent binding.
    async fn repair_stale_binding(&self, lease: LeaseId) {
        let entry = match self.store.get(&self.key).await {
            Ok(Some(entry)) => entry,
            Ok(None) | Err(_) => return,
        };
        if entry.value != self.hostname || entry.lease == lease {
            return;
        }
        match self.store.rebind_lease(&self.key, entry.lease, lease).await {
            Ok(true) => {
                info!(key = %self.key, old = %entry.lease, new = %lease, "ownership key rebound to new lease");
            }
            Ok(false) => {}
            Err(error) => {
                warn!(key = %self.key, %error, "failed to rebind ownership key");
            }
        }
    }

    /// Whether this host currently owns the endpoint.
    ///
    /// A missing ownership key yields [`EngineError::InvalidState`]; callers
    /// treat that as "not master".
    pub async fn is_master(&self) -> Result<bool, EngineError> {
        let entry = self.store.get(&self.key).await.context(StoreSnafu)?;
        match entry {
            None => InvalidStateSnafu {
                key: self.key.clone(),
            }
            .fail(),
            Some(entry) => {
                let current = self.leases.current_lease();
                Ok(!current.is_none() && entry.lease == current)
            }
        }
    }

    /// Delete the ownership key, but only after confirming mastership.
    ///
    /// Used exactly once per deliberate hand-off (failover, retiring to
    /// FAILING).
    pub async fn unlock(&self) -> Result<(), EngineError> {
        let _guard = self.guard.lock().await;
        let master = self.is_master().await.unwrap_or(false);
        if !master {
            return NotMasterSnafu {
                hostname: self.hostname.clone(),
                key: self.key.clone(),
            }
            .fail();
        }
        self.store.delete(&self.key).await.context(StoreSnafu)?;
        info!(key = %self.key, "ownership key released");
        Ok(())
    }

    /// Best-effort cleanup: drop the lease-change subscription, then delete
    /// the key if this host is master. When mastership cannot be determined
    /// the locker errs toward deletion rather than leaking a stale lock.
    pub async fn stop(&self) {
        if let Some(subscription) = self.subscription.get() {
            let _ = self.leases.unsubscribe(*subscription);
        }

        let _guard = self.guard.lock().await;
        let assume_master = match self.is_master().await {
            Ok(master) => master,
            Err(EngineError::InvalidState { .. }) => false,
            Err(error) => {
                warn!(key = %self.key, %error, "mastership unknown during stop, releasing anyway");
                true
            }
        };
        if assume_master {
            if let Err(error) = self.store.delete(&self.key).await {
                warn!(key = %self.key, %error, "failed to release ownership key during stop");
            }
        }
    }

    /// Lease rotation: re-point the ownership key from `old` to `new`, but
    /// only while it is still bound to `old`. This keeps ownership continuous
    /// across the rotation with no window in which another host could steal
    /// the key.
    async fn handle_lease_change(&self, old: LeaseId, new: LeaseId) {
        let _guard = self.guard.lock().await;
        if old.is_none() {
            // First-ever lease, nothing to migrate.
            return;
        }
        match self.store.rebind_lease(&self.key, old, new).await {
            Ok(true) => {
                info!(key = %self.key, old = %old, new = %new, "ownership key rebound to new lease");
            }
            Ok(false) => {
                debug!(key = %self.key, old = %old, "key absent or owned elsewhere, nothing to rebind");
            }
            Err(error) => {
                warn!(key = %self.key, %error, "failed to rebind ownership key");
            }
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }
}
