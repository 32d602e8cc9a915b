//! Engine-level error type.
//!
//! Store and storage boundaries carry their own typed errors
//! ([`crate::api::StoreError`], [`crate::api::StorageError`]); everything the
//! engine itself can fail with is collected here. Protocol-violation variants
//! (`NotMaster`, `NoOtherHosts`, `InvalidState`, `LeaseTimeout`,
//! `CallbackNotFound`) are returned synchronously to the caller of the
//! offending operation and are never fatal to the process.

use snafu::Snafu;
use uuid::Uuid;

use crate::api::{StorageError, StoreError};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    /// The caller is not the current master of the endpoint.
    #[snafu(display("host '{hostname}' is not master of '{key}'"))]
    NotMaster { hostname: String, key: String },

    /// A failover was requested but no other host is link-registered for
    /// the endpoint's election key.
    #[snafu(display("no other hosts registered for election key '{election_key}'"))]
    NoOtherHosts { election_key: String },

    /// The ownership key does not exist, so mastership cannot be asserted.
    #[snafu(display("ownership key '{key}' does not exist"))]
    InvalidState { key: String },

    /// No lease became available within the wait budget.
    #[snafu(display("no lease generated within {waited_ms}ms"))]
    LeaseTimeout { waited_ms: u64 },

    /// An unsubscribe named a subscription id that is not registered.
    #[snafu(display("lease-change subscription {subscription_id} not found"))]
    CallbackNotFound { subscription_id: u64 },

    /// The registry has no keeper for this endpoint id.
    #[snafu(display("endpoint {id} not found"))]
    EndpointNotFound { id: Uuid },

    /// Key-value store operation failed.
    #[snafu(display("store operation failed: {source}"))]
    Store { source: StoreError },

    /// Host/link record storage operation failed.
    #[snafu(display("storage operation failed: {source}"))]
    Storage { source: StorageError },
}
