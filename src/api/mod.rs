//! Collaborator interfaces consumed by the failover engine.
//!
//! Every external dependency of the core — the key-value store, the host and
//! link record storage, the endpoint plugin, the health checker and the
//! topology watcher — is expressed as a trait here and injected at
//! construction time, so tests can substitute deterministic fakes (see
//! [`inmemory`]).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod inmemory;
pub use inmemory::{
    CountingPlugin, DeterministicKeyValueStore, DeterministicStorage, NoopWatcher,
    StaticHealthChecker,
};

/// Opaque identifier of a store-issued lease.
///
/// Zero means "no lease". Keys bound to a lease are deleted by the store
/// when the lease expires, which is what makes crash failover automatic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub u64);

impl LeaseId {
    /// The absent lease.
    pub const NONE: LeaseId = LeaseId(0);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A key's value together with the lease it is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValueEntry {
    pub value: String,
    pub lease: LeaseId,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("lease {lease_id} not found")]
    LeaseNotFound { lease_id: u64 },
    #[error("key '{key}' not found")]
    NotFound { key: String },
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
}

/// Linearizable key-value store with lease semantics (etcd-shaped).
///
/// The client is shared read-only across the lease manager and all lockers
/// of a host; implementations must be safe for concurrent use.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Issue a new lease with the given time-to-live.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId, StoreError>;

    /// Renew a lease in place.
    ///
    /// Returns [`StoreError::LeaseNotFound`] when the store no longer knows
    /// the lease (it expired server-side).
    async fn keep_alive(&self, lease: LeaseId) -> Result<(), StoreError>;

    /// Atomically create `key` bound to `lease` if and only if the key does
    /// not exist ("create revision == 0" transaction).
    ///
    /// Returns `true` when the key was created, `false` when it already
    /// existed (no matter who owns it — the existing value is untouched).
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: LeaseId,
    ) -> Result<bool, StoreError>;

    /// Read a key. `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<KeyValueEntry>, StoreError>;

    /// Delete a key. Returns `true` when the key existed (idempotent).
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically re-point `key` from lease `old` to lease `new`, but only
    /// if the key is currently bound to `old`.
    ///
    /// Returns `false` when the key is absent or bound to a different lease.
    async fn rebind_lease(
        &self,
        key: &str,
        old: LeaseId,
        new: LeaseId,
    ) -> Result<bool, StoreError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("host '{hostname}' not found")]
    HostNotFound { hostname: String },
    #[error("storage operation failed: {reason}")]
    Failed { reason: String },
}

/// Durable host record: the local host's identity plus its persisted lease,
/// so a restarted process can resume the same lease instead of forcing a
/// spurious failover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub hostname: String,
    pub lease_id: LeaseId,
    pub data_version: u64,
}

/// Host and host-link record storage.
///
/// Link records associate a hostname with an endpoint's election key; they
/// are what lets a host discover who else is listening for an endpoint, and
/// writing one (even redundantly) is what fires topology-change watchers on
/// the other hosts.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Hostnames currently linked to `election_key`, in no particular order.
    async fn endpoint_hosts(&self, election_key: &str) -> Result<Vec<String>, StorageError>;

    /// Link the current host to `election_key`. Idempotent; a redundant
    /// write still triggers topology notifications on other hosts.
    async fn link_endpoint(&self, election_key: &str) -> Result<(), StorageError>;

    /// Remove the current host's link to `election_key`.
    async fn unlink_endpoint(&self, election_key: &str) -> Result<(), StorageError>;

    /// Load the local host record.
    async fn current_host(&self) -> Result<Host, StorageError>;

    /// Persist the local host record.
    async fn save_host(&self, host: &Host) -> Result<(), StorageError>;
}

/// Resource activation plugin (ARP announcement, cloud public IP, ...).
///
/// All methods must be idempotent: the keeper calls `ensure` periodically
/// while activated and may re-issue `deactivate` during shutdown.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Take ownership of the resource on this host.
    async fn activate(&self) -> anyhow::Result<()>;

    /// Release the resource on this host.
    async fn deactivate(&self) -> anyhow::Result<()>;

    /// Re-assert an activation that should already hold (e.g. resend a
    /// gratuitous ARP announcement).
    async fn ensure(&self) -> anyhow::Result<()>;

    /// Stable name of the resource this plugin manages; namespaces the
    /// ownership key and the host-link records.
    fn election_key(&self) -> String;
}

/// External health evaluation for an endpoint.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// `Ok` when the endpoint is healthy on this host.
    async fn check(&self) -> anyhow::Result<()>;
}

/// Topology-change watcher handle.
///
/// The watcher implementation observes host-link records and calls
/// `EndpointKeeper::notify_topology_change` when they change; the keeper
/// only needs to be able to stop it during shutdown.
#[async_trait]
pub trait Watcher: Send + Sync {
    async fn stop(&self);
}

/// The resource under management.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: Uuid,
    /// Derived from the plugin configuration; see [`Plugin::election_key`].
    pub election_key: String,
    /// Name of the plugin managing this endpoint.
    pub plugin: String,
    /// Per-endpoint health-check interval override, in milliseconds.
    pub health_check_interval_ms: Option<u64>,
}

impl Endpoint {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            election_key: String::new(),
            plugin: plugin.into(),
            health_check_interval_ms: None,
        }
    }
}
