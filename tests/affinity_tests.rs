//! Session ownership across workers sharing one coordination store

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue};
use chrono::Utc;
use futures::future::join_all;
use pretty_assertions::assert_eq;
use serde_json::json;

use common::{Script, directory, directory_with_script, key};
use mcp_session_pool::Error;
use mcp_session_pool::affinity::{Ownership, OwnershipDirectory, ReclaimOutcome};
use mcp_session_pool::config::{BackendConfig, Config, PoolConfig, RegistryConfig, TransportConfig};
use mcp_session_pool::coordination::{CoordinationStore, MemoryStore, keys};
use mcp_session_pool::gateway::{
    ChannelTransport, Dispatcher, ForwardingRelay, LocalSessionRegistry, StaticResolver, TargetResolver,
};
use mcp_session_pool::pool::{PoolKey, PoolStrategy};
use mcp_session_pool::transport::TransportKind;

const WORKERS: [&str; 4] = ["worker-a", "worker-b", "worker-c", "worker-d"];

/// Record `owner` as holding `session_id` with a heartbeat two minutes old
async fn stale_owner(store: &MemoryStore, owner: &str, session_id: &str) {
    let ttl = keys::OWNERSHIP_TTL;
    store
        .set_ex(&keys::pool_owner(session_id), owner, ttl)
        .await
        .unwrap();
    store
        .set_ex(
            &keys::worker_heartbeat(owner),
            &(Utc::now().timestamp() - 120).to_string(),
            ttl,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_claims_have_one_owner() {
    let store = Arc::new(MemoryStore::new());
    let directories: Vec<_> = WORKERS.iter().map(|w| directory(&store, w)).collect();

    let outcomes = join_all(directories.iter().map(|d| d.claim_ownership("sess-1"))).await;

    let winners: Vec<_> = outcomes
        .iter()
        .zip(WORKERS)
        .filter(|(o, _)| **o == Ownership::Owned)
        .map(|(_, w)| w)
        .collect();
    assert_eq!(winners.len(), 1);
    let winner = winners[0].to_string();
    for outcome in &outcomes {
        if *outcome != Ownership::Owned {
            assert_eq!(*outcome, Ownership::OwnedBy(winner.clone()));
        }
    }
    assert_eq!(
        store.get(&keys::pool_owner("sess-1")).await.unwrap(),
        Some(winner)
    );
}

#[tokio::test]
async fn test_dead_owner_is_reclaimed_by_exactly_one_worker() {
    let store = Arc::new(MemoryStore::new());
    stale_owner(&store, "worker-gone", "sess-1").await;
    let directories: Vec<_> = WORKERS.iter().map(|w| directory(&store, w)).collect();

    let outcomes = join_all(
        directories
            .iter()
            .map(|d| d.attempt_reclaim("sess-1", "worker-gone")),
    )
    .await;

    let reclaimed: Vec<_> = outcomes
        .iter()
        .zip(WORKERS)
        .filter(|(o, _)| o.is_reclaimed())
        .map(|(_, w)| w.to_string())
        .collect();
    assert_eq!(reclaimed.len(), 1);
    let winner = reclaimed[0].clone();

    for outcome in outcomes.iter().filter(|o| !o.is_reclaimed()) {
        assert_eq!(
            *outcome,
            ReclaimOutcome::LostRace {
                owner: Some(winner.clone())
            }
        );
    }
    let current = directories[0].current_owner("sess-1").await.unwrap();
    assert_eq!(current, Some(winner));

    let reclaims: u64 = directories
        .iter()
        .map(|d| d.metrics().snapshot().ownership_reclaims)
        .sum();
    let failures: u64 = directories
        .iter()
        .map(|d| d.metrics().snapshot().ownership_reclaim_failures)
        .sum();
    assert_eq!(reclaims, 1);
    assert_eq!(failures, 3);
}

#[tokio::test]
async fn test_live_owner_is_never_displaced() {
    let store = Arc::new(MemoryStore::new());
    let owner = directory(&store, "worker-owner");
    assert!(owner.heartbeat().beat().await);
    assert_eq!(owner.claim_ownership("sess-1").await, Ownership::Owned);

    let others: Vec<_> = WORKERS.iter().map(|w| directory(&store, w)).collect();
    let outcomes = join_all(
        others
            .iter()
            .map(|d| d.attempt_reclaim("sess-1", "worker-owner")),
    )
    .await;

    assert!(outcomes.iter().all(|o| *o == ReclaimOutcome::OwnerAlive));
    assert_eq!(
        owner.current_owner("sess-1").await.unwrap().as_deref(),
        Some("worker-owner")
    );
}

#[tokio::test]
async fn test_reclaim_refused_while_store_is_down() {
    let store = Arc::new(MemoryStore::new());
    stale_owner(&store, "worker-gone", "sess-1").await;
    let b = directory(&store, "worker-b");

    store.set_available(false);
    assert_eq!(
        b.attempt_reclaim("sess-1", "worker-gone").await,
        ReclaimOutcome::Unavailable
    );
    store.set_available(true);

    assert_eq!(
        b.current_owner("sess-1").await.unwrap().as_deref(),
        Some("worker-gone")
    );
    assert!(b.attempt_reclaim("sess-1", "worker-gone").await.is_reclaimed());
}

#[tokio::test]
async fn test_session_header_routes_to_registered_pool() {
    let store = Arc::new(MemoryStore::new());
    let a = directory(&store, "worker-a");
    let k = key();
    assert!(a.register_mapping("sess-1", &k));
    assert!(!a.register_mapping("sess-1", &k));

    let mut headers = HeaderMap::new();
    headers.insert("mcp-session-id", HeaderValue::from_static("sess-1"));

    let first = a.acquire_with_affinity(&headers, None).await.unwrap();
    assert_eq!(first.key, k);
    assert_eq!(first.session_id.as_deref(), Some("sess-1"));
    let pool = a.pools().get_pool(&k).unwrap();
    pool.release(first.lease.id(), true, None).await;

    let second = a.acquire_with_affinity(&headers, None).await.unwrap();
    assert_eq!(second.lease.id(), first.lease.id());
    assert_eq!(pool.sticky_binding("sess-1"), Some(first.lease.id()));

    let anonymous = a.acquire_with_affinity(&HeaderMap::new(), None).await;
    assert!(matches!(anonymous, Err(Error::TargetNotFound(_))));
}

#[tokio::test]
async fn test_store_outage_falls_back_to_local_pooling() {
    let store = Arc::new(MemoryStore::new());
    let a = directory(&store, "worker-a");
    a.register_mapping("sess-1", &key());

    store.set_available(false);
    assert_eq!(a.claim_ownership("sess-1").await, Ownership::Unknown);
    assert!(a.acquire_for_session(Some("sess-1"), None).await.is_ok());
    assert!(a.metrics().snapshot().store_errors >= 1);
}

#[tokio::test]
async fn test_registry_cleanup_drops_dead_and_expired_sessions() {
    let store = Arc::new(MemoryStore::new());
    let a = directory(&store, "worker-a");

    let mut backends = HashMap::new();
    backends.insert(
        "search".to_string(),
        BackendConfig {
            transport: TransportConfig::Http {
                http_url: "http://upstream.test/mcp".to_string(),
                streamable_http: true,
            },
            ..BackendConfig::default()
        },
    );
    let config = Config {
        backends,
        ..Config::default()
    };
    let resolver: Arc<dyn TargetResolver> = Arc::new(StaticResolver::from_config(&config));
    let store_dyn: Arc<dyn CoordinationStore> = Arc::clone(&store) as _;
    let registry = LocalSessionRegistry::new(
        store_dyn,
        Arc::clone(&a),
        resolver,
        &RegistryConfig::default(),
    );

    let (gone, gone_rx) = ChannelTransport::new(4);
    let (expired, _expired_rx) = ChannelTransport::new(4);
    let (alive, mut alive_rx) = ChannelTransport::new(4);
    registry.register("sess-gone", Arc::new(gone)).await;
    registry.register("sess-expired", Arc::new(expired)).await;
    registry.register("sess-alive", Arc::new(alive)).await;
    assert_eq!(a.heartbeat().metadata().local_sessions, 3);

    a.claim_ownership("sess-gone").await;
    drop(gone_rx);
    store
        .delete(&keys::session_record("sess-expired"))
        .await
        .unwrap();

    let report = registry.cleanup().await;
    assert_eq!(report.disconnected, 1);
    assert_eq!(report.expired, 1);
    assert_eq!(report.refreshed, 1);
    assert_eq!(registry.len(), 1);
    assert_eq!(a.heartbeat().metadata().local_sessions, 1);
    assert_eq!(a.current_owner("sess-gone").await.unwrap(), None);

    let message = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
    assert!(registry.broadcast("sess-alive", message.clone(), None).await.unwrap());
    assert_eq!(alive_rx.recv().await.unwrap(), message);
    assert!(a.mapping("sess-alive").is_some());
    assert!(!registry.broadcast("sess-gone", message, None).await.unwrap());
}

fn upstream_config(pool: Option<PoolConfig>) -> Config {
    let mut backends = HashMap::new();
    backends.insert(
        "search".to_string(),
        BackendConfig {
            transport: TransportConfig::Http {
                http_url: "http://upstream.test/mcp".to_string(),
                streamable_http: true,
            },
            pool,
            ..BackendConfig::default()
        },
    );
    Config {
        backends,
        ..Config::default()
    }
}

fn dispatcher(store: &Arc<MemoryStore>, directory: &Arc<OwnershipDirectory>, config: &Config) -> Dispatcher {
    let store_dyn: Arc<dyn CoordinationStore> = Arc::clone(store) as _;
    let relay = ForwardingRelay::new(
        store_dyn,
        Arc::clone(directory.heartbeat()),
        Arc::clone(directory.metrics()),
        Duration::from_millis(200),
    )
    .unwrap();
    Dispatcher::new(
        Arc::clone(directory),
        Arc::new(StaticResolver::from_config(config)),
        Arc::new(relay),
    )
}

fn search(id: u64) -> serde_json::Value {
    json!({"jsonrpc": "2.0", "id": id, "method": "tools/call", "params": {"name": "search"}})
}

#[tokio::test]
async fn test_cancelled_dispatch_releases_its_connection() {
    let store = Arc::new(MemoryStore::new());
    let script = Arc::new(Script::default());
    let a = directory_with_script(&store, "worker-a", Arc::clone(&script));
    let config = upstream_config(Some(PoolConfig {
        strategy: PoolStrategy::Sticky,
        min_size: 0,
        max_size: 1,
        acquire_timeout: Duration::from_millis(200),
        ..PoolConfig::default()
    }));
    let d = dispatcher(&store, &a, &config);

    script.request_delay_ms.store(10_000, Ordering::SeqCst);
    let cancelled =
        tokio::time::timeout(Duration::from_millis(100), d.dispatch(Some("sess-1"), None, search(1))).await;
    assert!(cancelled.is_err());

    let pool = a.pools().get_pool(&a.mapping("sess-1").unwrap()).unwrap();
    assert_eq!(pool.get_stats().active_connections, 0);
    assert_eq!(pool.sticky_binding("sess-1"), None);

    script.request_delay_ms.store(0, Ordering::SeqCst);
    let reply = d.dispatch(Some("sess-1"), None, search(2)).await.unwrap();
    assert_eq!(reply["id"], json!(2));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(script.closes(), 1);
}

#[tokio::test]
async fn test_identities_never_share_a_connection() {
    let store = Arc::new(MemoryStore::new());
    let a = directory(&store, "worker-a");
    let d = dispatcher(&store, &a, &upstream_config(None));

    d.dispatch(Some("sess-1"), Some("alice"), search(1)).await.unwrap();
    let alice_key = a.mapping("sess-1").unwrap();
    d.dispatch(Some("sess-1"), Some("bob"), search(2)).await.unwrap();
    let bob_key = a.mapping("sess-1").unwrap();
    assert_ne!(alice_key, bob_key);

    let alice = a.pools().get_pool(&alice_key).unwrap();
    let bob = a.pools().get_pool(&bob_key).unwrap();
    let alice_ids: Vec<_> = alice.connections().iter().map(|c| c.id).collect();
    let bob_ids: Vec<_> = bob.connections().iter().map(|c| c.id).collect();
    assert_eq!(alice_ids.len(), 1);
    assert_eq!(bob_ids.len(), 1);
    assert!(alice_ids.iter().all(|id| !bob_ids.contains(id)));

    // Same session id, same target: still a separate pool per identity
    let shared_target = |identity| PoolKey::new("http://upstream.test/mcp", TransportKind::StreamableHttp, None, identity);
    let carol = a.acquire_for_session(None, Some(&shared_target(Some("carol")))).await.unwrap();
    let dave = a.acquire_for_session(None, Some(&shared_target(Some("dave")))).await.unwrap();
    assert_ne!(carol.key, dave.key);
    assert_ne!(carol.lease.id(), dave.lease.id());
}

#[tokio::test(start_paused = true)]
async fn test_idle_session_mappings_are_pruned() {
    let store = Arc::new(MemoryStore::new());
    let a = directory(&store, "worker-a");
    let d = dispatcher(&store, &a, &upstream_config(None));
    for i in 0..50 {
        d.dispatch(Some(&format!("sess-{i}")), None, search(i)).await.unwrap();
    }
    assert_eq!(a.mapping_count(), 50);

    // Nothing to prune while the sessions are owned here and in use
    assert_eq!(a.prune_mappings(|_| false).await, 0);

    tokio::time::advance(Duration::from_secs(7200)).await;
    store.purge();
    assert_eq!(a.prune_mappings(|session_id| session_id == "sess-0").await, 49);
    assert_eq!(a.mapping_count(), 1);
    assert!(a.mapping("sess-0").is_some());
}
