//! Engine configuration.
//!
//! Single source of truth for all timing knobs and thresholds, deserializable
//! from TOML/JSON with sensible defaults. Intervals are stored in
//! milliseconds and exposed as [`Duration`] accessors.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default values for configuration.
mod defaults {
    pub fn keepalive_interval_ms() -> u64 {
        5_000
    }
    pub fn lease_ttl_ms() -> u64 {
        15_000
    }
    pub fn fault_threshold() -> u32 {
        3
    }
    pub fn health_check_interval_ms() -> u64 {
        10_000
    }
    pub fn health_fail_threshold() -> u32 {
        3
    }
    pub fn ensure_interval_ms() -> u64 {
        10_000
    }
    pub fn ensure_max_backoff_ms() -> u64 {
        60_000
    }
    pub fn stop_poll_interval_ms() -> u64 {
        100
    }
    pub fn key_root() -> String {
        "/holdfast".to_string()
    }
}

/// Configuration shared by the lease manager and every endpoint keeper on
/// one host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeeperConfig {
    /// Name under which this host takes locks and registers links.
    pub hostname: String,

    /// Interval between lease renewals and lock-acquisition attempts.
    /// Must be comfortably smaller than `lease_ttl_ms`.
    #[serde(default = "defaults::keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,

    /// Time-to-live requested for the host lease.
    #[serde(default = "defaults::lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// Consecutive lock-refresh failures tolerated before a fault event is
    /// emitted (debounce for transient store hiccups).
    #[serde(default = "defaults::fault_threshold")]
    pub fault_threshold: u32,

    /// Default health-check interval; endpoints may override.
    #[serde(default = "defaults::health_check_interval_ms")]
    pub health_check_interval_ms: u64,

    /// Consecutive health-check failures before the endpoint is retired.
    #[serde(default = "defaults::health_fail_threshold")]
    pub health_fail_threshold: u32,

    /// Base interval between plugin `ensure` calls while activated.
    #[serde(default = "defaults::ensure_interval_ms")]
    pub ensure_interval_ms: u64,

    /// Cap for the ensure loop's exponential backoff.
    #[serde(default = "defaults::ensure_max_backoff_ms")]
    pub ensure_max_backoff_ms: u64,

    /// Poll interval while waiting for another host to take over during
    /// graceful shutdown.
    #[serde(default = "defaults::stop_poll_interval_ms")]
    pub stop_poll_interval_ms: u64,

    /// Root directory under which ownership keys live in the store.
    #[serde(default = "defaults::key_root")]
    pub key_root: String,
}

impl KeeperConfig {
    /// A configuration with all defaults for the given hostname.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            keepalive_interval_ms: defaults::keepalive_interval_ms(),
            lease_ttl_ms: defaults::lease_ttl_ms(),
            fault_threshold: defaults::fault_threshold(),
            health_check_interval_ms: defaults::health_check_interval_ms(),
            health_fail_threshold: defaults::health_fail_threshold(),
            ensure_interval_ms: defaults::ensure_interval_ms(),
            ensure_max_backoff_ms: defaults::ensure_max_backoff_ms(),
            stop_poll_interval_ms: defaults::stop_poll_interval_ms(),
            key_root: defaults::key_root(),
        }
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn ensure_interval(&self) -> Duration {
        Duration::from_millis(self.ensure_interval_ms)
    }

    pub fn ensure_max_backoff(&self) -> Duration {
        Duration::from_millis(self.ensure_max_backoff_ms)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    /// How long `get_lease` waits for a lease to be generated before giving
    /// up with a timeout error.
    pub fn lease_wait_timeout(&self) -> Duration {
        self.keepalive_interval() * 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_applied_on_deserialize() {
        let config: KeeperConfig = serde_json::from_str(r#"{"hostname":"node-a"}"#).unwrap();
        assert_eq!(config.hostname, "node-a");
        assert_eq!(config.keepalive_interval_ms, 5_000);
        assert_eq!(config.fault_threshold, 3);
        assert_eq!(config.key_root, "/holdfast");
        assert_eq!(config.lease_wait_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn test_overrides_win() {
        let config: KeeperConfig =
            serde_json::from_str(r#"{"hostname":"node-a","keepalive_interval_ms":250}"#).unwrap();
        assert_eq!(config.keepalive_interval(), Duration::from_millis(250));
        assert_eq!(config.lease_ttl_ms, 15_000);
    }
}
