//! Two-host failover scenarios against the deterministic in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use holdfast::api::inmemory::{
    CountingPlugin, DeterministicKeyValueStore, DeterministicStorage, NoopWatcher,
    StaticHealthChecker,
};
use holdfast::api::{Endpoint, KeyValueStore, Storage};
use holdfast::locker::ownership_key;
use holdfast::{EndpointState, KeeperConfig, KeeperRegistry, LeaseManager};

const ELECTION_KEY: &str = "svc/web-vip";

/// `RUST_LOG=holdfast=debug cargo test` shows the engine's view of a
/// scenario while debugging a failure.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Host {
    registry: KeeperRegistry,
    leases: Arc<LeaseManager>,
    storage: DeterministicStorage,
    plugin: Arc<CountingPlugin>,
    checker: Arc<StaticHealthChecker>,
    endpoint: Endpoint,
}

impl Host {
    async fn stop(&self) {
        self.registry.stop_all().await;
        self.leases.stop();
    }
}

async fn spawn_host(
    store: &DeterministicKeyValueStore,
    storage: &DeterministicStorage,
    hostname: &str,
) -> Host {
    let config = KeeperConfig {
        keepalive_interval_ms: 20,
        lease_ttl_ms: 1_000,
        health_check_interval_ms: 20,
        ensure_interval_ms: 50,
        ..KeeperConfig::new(hostname)
    };
    let host_storage = storage.new_shared(hostname);
    let store: Arc<dyn KeyValueStore> = Arc::new(store.clone());
    let storage_dyn: Arc<dyn Storage> = Arc::new(host_storage.clone());

    let leases = LeaseManager::new(store.clone(), storage_dyn.clone(), config.clone());
    leases.start().await.unwrap();
    leases.get_lease().await.unwrap();

    let registry = KeeperRegistry::new(config, store, storage_dyn, leases.clone());
    let plugin = CountingPlugin::new(ELECTION_KEY);
    let checker = StaticHealthChecker::healthy();
    let endpoint = registry
        .start(
            Endpoint::new("counting"),
            plugin.clone(),
            checker.clone(),
            Arc::new(NoopWatcher),
        )
        .await
        .unwrap();

    Host {
        registry,
        leases,
        storage: host_storage,
        plugin,
        checker,
        endpoint,
    }
}

/// Wire the storage link-change feed to a keeper, the way a real topology
/// watcher would: any link write for the election key nudges the lock loop.
async fn watch_topology(host: &Host) {
    let keeper = host.registry.get(host.endpoint.id).await.unwrap();
    host.storage.on_link_change(Arc::new(move |election_key, _hostname| {
        if election_key == ELECTION_KEY {
            keeper.notify_topology_change();
        }
    }));
}

async fn status(host: &Host) -> EndpointState {
    host.registry.status(host.endpoint.id).await.unwrap()
}

async fn wait_for_state(host: &Host, want: EndpointState) {
    for _ in 0..50 {
        if status(host).await == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("host {} never reached {want}", host.storage.hostname());
}

#[tokio::test]
async fn test_operator_failover_hands_endpoint_to_standby() {
    init_tracing();
    let store = DeterministicKeyValueStore::new();
    let storage = DeterministicStorage::new("seed");

    let host_a = spawn_host(&store, &storage, "host-a").await;
    wait_for_state(&host_a, EndpointState::Activated).await;

    let host_b = spawn_host(&store, &storage, "host-b").await;
    watch_topology(&host_b).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(status(&host_b).await, EndpointState::Standby);
    assert_eq!(host_b.plugin.activations(), 0);

    host_a.registry.failover(host_a.endpoint.id).await.unwrap();

    wait_for_state(&host_b, EndpointState::Activated).await;
    wait_for_state(&host_a, EndpointState::Standby).await;
    assert_eq!(host_b.plugin.activations(), 1);
    assert!(host_a.plugin.deactivations() >= 1);

    let key = ownership_key("/holdfast", ELECTION_KEY);
    let entry = store.get(&key).await.unwrap().unwrap();
    assert_eq!(entry.value, "host-b");

    host_a.stop().await;
    host_b.stop().await;
}

#[tokio::test]
async fn test_crashed_owner_is_replaced_after_lease_expiry() {
    init_tracing();
    let store = DeterministicKeyValueStore::new();
    let storage = DeterministicStorage::new("seed");

    // A dead host left the ownership key behind, bound to its lease. No
    // process is refreshing that lease anymore.
    let key = ownership_key("/holdfast", ELECTION_KEY);
    let dead_lease = store.grant_lease(Duration::from_secs(60)).await.unwrap();
    assert!(
        store
            .create_if_absent(&key, "host-dead", dead_lease)
            .await
            .unwrap()
    );

    let host_b = spawn_host(&store, &storage, "host-b").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(status(&host_b).await, EndpointState::Standby);

    // The store expires the lease and drops the keys bound to it.
    store.revoke_lease(dead_lease);

    wait_for_state(&host_b, EndpointState::Activated).await;
    assert_eq!(host_b.plugin.activations(), 1);

    let entry = store.get(&key).await.unwrap().unwrap();
    assert_eq!(entry.value, "host-b");

    host_b.stop().await;
}

#[tokio::test]
async fn test_lease_rotation_keeps_mastership_without_demotion() {
    init_tracing();
    let store = DeterministicKeyValueStore::new();
    let storage = DeterministicStorage::new("seed");

    let host = spawn_host(&store, &storage, "host-a").await;
    wait_for_state(&host, EndpointState::Activated).await;
    let first = host.leases.current_lease();

    // The store loses the lease record but the ownership key survives,
    // e.g. a lease server restart. Keep-alive starts failing, the manager
    // regenerates, and the locker rebinds the key to the new lease.
    store.forget_lease(first);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let second = host.leases.current_lease();
    assert_ne!(first, second);

    assert_eq!(status(&host).await, EndpointState::Activated);
    assert_eq!(host.plugin.activations(), 1);
    assert_eq!(host.plugin.deactivations(), 0);

    let key = ownership_key("/holdfast", ELECTION_KEY);
    let entry = store.get(&key).await.unwrap().unwrap();
    assert_eq!(entry.lease, second);

    host.stop().await;
}

#[tokio::test]
async fn test_unhealthy_owner_retires_and_standby_takes_over() {
    init_tracing();
    let store = DeterministicKeyValueStore::new();
    let storage = DeterministicStorage::new("seed");

    let host_a = spawn_host(&store, &storage, "host-a").await;
    wait_for_state(&host_a, EndpointState::Activated).await;
    let host_b = spawn_host(&store, &storage, "host-b").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    host_a.checker.set_healthy(false);

    wait_for_state(&host_a, EndpointState::Failing).await;
    wait_for_state(&host_b, EndpointState::Activated).await;
    assert!(host_a.plugin.deactivations() >= 1);
    assert_eq!(host_b.plugin.activations(), 1);

    host_a.stop().await;
    host_b.stop().await;
}
