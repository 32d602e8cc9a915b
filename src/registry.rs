//! Thin per-host registry multiplexing many endpoint keepers.
//!
//! The control surface (HTTP API, CLI) talks to this: start an endpoint,
//! stop it, trigger a failover, read its status. All the interesting work
//! happens in [`EndpointKeeper`]; the registry only owns the map and the
//! shared lease manager.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::api::{Endpoint, HealthChecker, KeyValueStore, Plugin, Storage, Watcher};
use crate::config::KeeperConfig;
use crate::error::{EndpointNotFoundSnafu, EngineError};
use crate::keeper::EndpointKeeper;
use crate::keeper::fsm::EndpointState;
use crate::lease::LeaseManager;

pub struct KeeperRegistry {
    config: KeeperConfig,
    store: Arc<dyn KeyValueStore>,
    storage: Arc<dyn Storage>,
    leases: Arc<LeaseManager>,
    keepers: RwLock<HashMap<Uuid, Arc<EndpointKeeper>>>,
}

impl KeeperRegistry {
    pub fn new(
        config: KeeperConfig,
        store: Arc<dyn KeyValueStore>,
        storage: Arc<dyn Storage>,
        leases: Arc<LeaseManager>,
    ) -> Self {
        Self {
            config,
            store,
            storage,
            leases,
            keepers: RwLock::new(HashMap::new()),
        }
    }

    /// Derive the election key from the plugin, register the keeper and
    /// launch its loops. Returns the completed endpoint record.
    pub async fn start(
        &self,
        mut endpoint: Endpoint,
        plugin: Arc<dyn Plugin>,
        checker: Arc<dyn HealthChecker>,
        watcher: Arc<dyn Watcher>,
    ) -> Result<Endpoint, EngineError> {
        endpoint.election_key = plugin.election_key();

        let keeper = EndpointKeeper::start(
            endpoint.clone(),
            self.config.clone(),
            self.store.clone(),
            self.storage.clone(),
            self.leases.clone(),
            plugin,
            checker,
            watcher,
        )
        .await?;

        self.keepers.write().await.insert(endpoint.id, keeper);
        info!(endpoint = %endpoint.id, election_key = %endpoint.election_key, "endpoint registered");
        Ok(endpoint)
    }

    /// Run the stop protocol for an endpoint and drop it from the registry.
    pub async fn stop(&self, id: Uuid) -> Result<(), EngineError> {
        let keeper = self
            .keepers
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| EndpointNotFoundSnafu { id }.build())?;
        keeper.stop().await;
        Ok(())
    }

    /// Operator-triggered hand-off for an endpoint.
    pub async fn failover(&self, id: Uuid) -> Result<(), EngineError> {
        let keeper = self.get(id).await?;
        keeper.failover().await
    }

    /// Current state of an endpoint on this host.
    pub async fn status(&self, id: Uuid) -> Result<EndpointState, EngineError> {
        Ok(self.get(id).await?.status())
    }

    /// Keeper handle, e.g. for wiring a watcher's notification callback.
    pub async fn get(&self, id: Uuid) -> Result<Arc<EndpointKeeper>, EngineError> {
        self.keepers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EndpointNotFoundSnafu { id }.build())
    }

    /// Stop every keeper. Used on process shutdown.
    pub async fn stop_all(&self) {
        let keepers: Vec<Arc<EndpointKeeper>> =
            self.keepers.write().await.drain().map(|(_, k)| k).collect();
        for keeper in keepers {
            keeper.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::inmemory::{
        CountingPlugin, DeterministicKeyValueStore, DeterministicStorage, NoopWatcher,
        StaticHealthChecker,
    };

    #[tokio::test]
    async fn test_unknown_endpoint_is_rejected() {
        let store: Arc<dyn KeyValueStore> = Arc::new(DeterministicKeyValueStore::new());
        let storage: Arc<dyn Storage> = Arc::new(DeterministicStorage::new("host-a"));
        let config = KeeperConfig::new("host-a");
        let leases = LeaseManager::new(store.clone(), storage.clone(), config.clone());
        let registry = KeeperRegistry::new(config, store, storage, leases);

        let id = Uuid::new_v4();
        assert!(matches!(
            registry.status(id).await,
            Err(EngineError::EndpointNotFound { .. })
        ));
        assert!(matches!(
            registry.failover(id).await,
            Err(EngineError::EndpointNotFound { .. })
        ));
        assert!(matches!(
            registry.stop(id).await,
            Err(EngineError::EndpointNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_start_fills_election_key_and_reports_status() {
        let store: Arc<dyn KeyValueStore> = Arc::new(DeterministicKeyValueStore::new());
        let storage: Arc<dyn Storage> = Arc::new(DeterministicStorage::new("host-a"));
        let config = KeeperConfig {
            keepalive_interval_ms: 20,
            ..KeeperConfig::new("host-a")
        };
        let leases = LeaseManager::new(store.clone(), storage.clone(), config.clone());
        leases.start().await.unwrap();
        let registry = KeeperRegistry::new(config, store, storage, leases.clone());

        let plugin = CountingPlugin::new("svc/web-vip");
        let endpoint = registry
            .start(
                Endpoint::new("counting"),
                plugin,
                StaticHealthChecker::healthy(),
                Arc::new(NoopWatcher),
            )
            .await
            .unwrap();
        assert_eq!(endpoint.election_key, "svc/web-vip");

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        assert_eq!(
            registry.status(endpoint.id).await.unwrap(),
            EndpointState::Activated
        );

        registry.stop(endpoint.id).await.unwrap();
        assert!(registry.status(endpoint.id).await.is_err());
        leases.stop();
    }
}
