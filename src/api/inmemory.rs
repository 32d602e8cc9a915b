//! Deterministic in-memory implementations of the collaborator traits.
//!
//! These mirror the behavior of production backends without network or disk
//! I/O, for unit tests and multi-host simulation: the store enforces the
//! same conditional-create and lease-binding atomicity a real etcd provides,
//! and the storage fake can share its link table across several per-host
//! handles to simulate a fleet.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    HealthChecker, Host, KeyValueEntry, KeyValueStore, LeaseId, Plugin, Storage, StorageError,
    StoreError, Watcher,
};

#[derive(Debug)]
struct LeaseRecord {
    ttl: Duration,
    refreshed_at: Instant,
}

impl LeaseRecord {
    fn is_expired(&self) -> bool {
        self.refreshed_at.elapsed() > self.ttl
    }
}

#[derive(Default)]
struct StoreInner {
    leases: HashMap<u64, LeaseRecord>,
    keys: HashMap<String, (String, u64)>,
    next_lease: u64,
}

impl StoreInner {
    /// Drop expired leases and every key bound to them, like the store's
    /// server-side lease expiry would.
    fn purge_expired(&mut self) {
        let expired: Vec<u64> = self
            .leases
            .iter()
            .filter(|(_, record)| record.is_expired())
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.leases.remove(&id);
            self.keys.retain(|_, (_, lease)| *lease != id);
        }
    }
}

/// In-memory deterministic [`KeyValueStore`] with lease semantics.
///
/// Shared across simulated hosts via `Clone` (all clones see the same keys
/// and leases). Supports fault injection for debounce tests and explicit
/// lease revocation to simulate server-side expiry.
#[derive(Clone, Default)]
pub struct DeterministicKeyValueStore {
    inner: Arc<Mutex<StoreInner>>,
    inject_failures: Arc<AtomicU32>,
    inject_create_failures: Arc<AtomicU32>,
}

impl DeterministicKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` store operations fail with
    /// [`StoreError::Unavailable`].
    pub fn inject_errors(&self, count: u32) {
        self.inject_failures.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` conditional-create operations fail, leaving all
    /// other store traffic (lease renewals in particular) untouched.
    pub fn inject_create_errors(&self, count: u32) {
        self.inject_create_failures.store(count, Ordering::SeqCst);
    }

    /// Forget a lease immediately, deleting all keys bound to it. Simulates
    /// the lease expiring server-side faster than the client expected.
    pub fn revoke_lease(&self, lease: LeaseId) {
        let mut inner = self.inner.lock();
        inner.leases.remove(&lease.value());
        inner.keys.retain(|_, (_, l)| *l != lease.value());
    }

    /// Forget a lease record while leaving its keys in place. Simulates the
    /// window where keep-alive already reports the lease unknown but the
    /// attached keys have not been reaped yet.
    pub fn forget_lease(&self, lease: LeaseId) {
        let mut inner = self.inner.lock();
        inner.leases.remove(&lease.value());
    }

    /// Whether the given lease is currently known to the store.
    pub fn lease_exists(&self, lease: LeaseId) -> bool {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        inner.leases.contains_key(&lease.value())
    }

    fn check_injected(&self) -> Result<(), StoreError> {
        let remaining = self.inject_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inject_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable {
                reason: "injected fault".into(),
            });
        }
        Ok(())
    }

    fn check_injected_create(&self) -> Result<(), StoreError> {
        let remaining = self.inject_create_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inject_create_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable {
                reason: "injected fault".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for DeterministicKeyValueStore {
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError> {
        self.check_injected()?;
        let mut inner = self.inner.lock();
        inner.purge_expired();
        inner.next_lease += 1;
        let id = inner.next_lease;
        inner.leases.insert(
            id,
            LeaseRecord {
                ttl,
                refreshed_at: Instant::now(),
            },
        );
        Ok(LeaseId(id))
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.check_injected()?;
        let mut inner = self.inner.lock();
        inner.purge_expired();
        match inner.leases.get_mut(&lease.value()) {
            Some(record) => {
                record.refreshed_at = Instant::now();
                Ok(())
            }
            None => Err(StoreError::LeaseNotFound {
                lease_id: lease.value(),
            }),
        }
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: LeaseId,
    ) -> Result<bool, StoreError> {
        self.check_injected()?;
        self.check_injected_create()?;
        let mut inner = self.inner.lock();
        inner.purge_expired();
        if inner.keys.contains_key(key) {
            return Ok(false);
        }
        if !inner.leases.contains_key(&lease.value()) {
            return Err(StoreError::LeaseNotFound {
                lease_id: lease.value(),
            });
        }
        inner
            .keys
            .insert(key.to_string(), (value.to_string(), lease.value()));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<KeyValueEntry>, StoreError> {
        self.check_injected()?;
        let mut inner = self.inner.lock();
        inner.purge_expired();
        Ok(inner.keys.get(key).map(|(value, lease)| KeyValueEntry {
            value: value.clone(),
            lease: LeaseId(*lease),
        }))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_injected()?;
        let mut inner = self.inner.lock();
        inner.purge_expired();
        Ok(inner.keys.remove(key).is_some())
    }

    async fn rebind_lease(
        &self,
        key: &str,
        old: LeaseId,
        new: LeaseId,
    ) -> Result<bool, StoreError> {
        self.check_injected()?;
        let mut inner = self.inner.lock();
        inner.purge_expired();
        if !inner.leases.contains_key(&new.value()) {
            return Err(StoreError::LeaseNotFound {
                lease_id: new.value(),
            });
        }
        match inner.keys.get_mut(key) {
            Some((_, lease)) if *lease == old.value() => {
                *lease = new.value();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Callback invoked with `(election_key, hostname)` on link-record writes.
pub type LinkListener = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Default)]
struct StorageInner {
    links: HashMap<String, HashSet<String>>,
    hosts: HashMap<String, Host>,
    /// Called with `(election_key, hostname)` on every link/unlink write;
    /// stands in for the topology watcher's notification path.
    link_listeners: Vec<LinkListener>,
}

/// In-memory [`Storage`] for one simulated host.
///
/// Use [`DeterministicStorage::new_shared`] to create per-host handles over
/// a common link/host table, simulating a fleet against shared storage.
#[derive(Clone)]
pub struct DeterministicStorage {
    inner: Arc<Mutex<StorageInner>>,
    hostname: String,
}

impl DeterministicStorage {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StorageInner::default())),
            hostname: hostname.into(),
        }
    }

    /// A handle for another host sharing the same backing tables.
    pub fn new_shared(&self, hostname: impl Into<String>) -> Self {
        Self {
            inner: self.inner.clone(),
            hostname: hostname.into(),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Register a callback fired on every link-record write, including
    /// redundant ones. Simulates what a topology watcher would observe.
    pub fn on_link_change(&self, listener: LinkListener) {
        self.inner.lock().link_listeners.push(listener);
    }
}

#[async_trait]
impl Storage for DeterministicStorage {
    async fn endpoint_hosts(&self, election_key: &str) -> Result<Vec<String>, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .links
            .get(election_key)
            .map(|hosts| hosts.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn link_endpoint(&self, election_key: &str) -> Result<(), StorageError> {
        let listeners = {
            let mut inner = self.inner.lock();
            inner
                .links
                .entry(election_key.to_string())
                .or_default()
                .insert(self.hostname.clone());
            inner.link_listeners.clone()
        };
        // Fire outside the lock; a listener may touch storage itself.
        for listener in listeners {
            listener(election_key, &self.hostname);
        }
        Ok(())
    }

    async fn unlink_endpoint(&self, election_key: &str) -> Result<(), StorageError> {
        let listeners = {
            let mut inner = self.inner.lock();
            if let Some(hosts) = inner.links.get_mut(election_key) {
                hosts.remove(&self.hostname);
            }
            inner.link_listeners.clone()
        };
        for listener in listeners {
            listener(election_key, &self.hostname);
        }
        Ok(())
    }

    async fn current_host(&self) -> Result<Host, StorageError> {
        let inner = self.inner.lock();
        Ok(inner
            .hosts
            .get(&self.hostname)
            .cloned()
            .unwrap_or_else(|| Host {
                hostname: self.hostname.clone(),
                lease_id: LeaseId::NONE,
                data_version: 0,
            }))
    }

    async fn save_host(&self, host: &Host) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.hosts.insert(host.hostname.clone(), host.clone());
        Ok(())
    }
}

/// Watcher that watches nothing. Stands in where topology notifications are
/// driven manually (tests) or not needed at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWatcher;

#[async_trait]
impl Watcher for NoopWatcher {
    async fn stop(&self) {}
}

/// Plugin fake that counts its calls and can be scripted to fail.
#[derive(Default)]
pub struct CountingPlugin {
    election_key: String,
    activations: AtomicU32,
    deactivations: AtomicU32,
    ensures: AtomicU32,
    fail_ensure: AtomicBool,
}

impl CountingPlugin {
    pub fn new(election_key: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            election_key: election_key.into(),
            ..Self::default()
        })
    }

    pub fn activations(&self) -> u32 {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn deactivations(&self) -> u32 {
        self.deactivations.load(Ordering::SeqCst)
    }

    pub fn ensures(&self) -> u32 {
        self.ensures.load(Ordering::SeqCst)
    }

    pub fn set_fail_ensure(&self, fail: bool) {
        self.fail_ensure.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Plugin for CountingPlugin {
    async fn activate(&self) -> anyhow::Result<()> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn deactivate(&self) -> anyhow::Result<()> {
        self.deactivations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ensure(&self) -> anyhow::Result<()> {
        self.ensures.fetch_add(1, Ordering::SeqCst);
        if self.fail_ensure.load(Ordering::SeqCst) {
            anyhow::bail!("ensure scripted to fail");
        }
        Ok(())
    }

    fn election_key(&self) -> String {
        self.election_key.clone()
    }
}

/// Health checker fake toggled between healthy and unhealthy.
#[derive(Default)]
pub struct StaticHealthChecker {
    healthy: AtomicBool,
}

impl StaticHealthChecker {
    pub fn healthy() -> Arc<Self> {
        let checker = Arc::new(Self::default());
        checker.set_healthy(true);
        checker
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthChecker for StaticHealthChecker {
    async fn check(&self) -> anyhow::Result<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            anyhow::bail!("endpoint unhealthy")
        }
    }
}
