//! Distributed endpoint leadership and failover.
//!
//! Each participating host runs one [`LeaseManager`] that keeps a single
//! store lease alive for the whole process, and one [`EndpointKeeper`] per
//! managed endpoint. A keeper competes for its endpoint's ownership key,
//! drives the endpoint state machine and runs the attached plugin's
//! activate/deactivate hooks. If a host dies, its lease expires and the
//! store drops every ownership key bound to it, so surviving hosts take
//! over without any explicit hand-off.
//!
//! The store and host-inventory backends are trait objects
//! ([`api::KeyValueStore`], [`api::Storage`]); deterministic in-memory
//! implementations live in [`api::inmemory`] for tests and simulation.

pub mod api;
pub mod config;
pub mod error;
pub mod keeper;
pub mod lease;
pub mod locker;
pub mod registry;

pub use api::{Endpoint, HealthChecker, KeyValueStore, LeaseId, Plugin, Storage, Watcher};
pub use config::KeeperConfig;
pub use error::EngineError;
pub use keeper::EndpointKeeper;
pub use keeper::fsm::{EndpointEvent, EndpointState};
pub use lease::LeaseManager;
pub use locker::EndpointLocker;
pub use registry::KeeperRegistry;
