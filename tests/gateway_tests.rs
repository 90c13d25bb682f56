//! End-to-end: two workers sharing a coordination store in front of one upstream

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
};
use pretty_assertions::assert_eq;
use reqwest::{Client, Url};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use mcp_session_pool::config::{BackendConfig, Config, PoolConfig, TransportConfig};
use mcp_session_pool::coordination::{CoordinationStore, MemoryStore, keys};
use mcp_session_pool::gateway::Gateway;
use mcp_session_pool::pool::PoolStrategy;

/// Streamable-HTTP upstream echoing each request's method and params
async fn upstream_handler(State(served): State<Arc<AtomicUsize>>, Json(message): Json<Value>) -> Response {
    let Some(id) = message.get("id").cloned() else {
        return StatusCode::ACCEPTED.into_response();
    };
    if message["method"] == "tools/call" {
        served.fetch_add(1, Ordering::SeqCst);
    }
    Json(json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {"method": message["method"], "params": message.get("params")},
    }))
    .into_response()
}

async fn spawn_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let served = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route("/mcp", post(upstream_handler))
        .route("/mcp/", post(upstream_handler))
        .with_state(Arc::clone(&served));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, served)
}

struct Worker {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Worker {
    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        self.handle.await.unwrap();
    }
}

async fn spawn_worker(worker_id: &str, upstream: SocketAddr, store: Arc<dyn CoordinationStore>) -> Worker {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("http://{addr}");

    let mut config = Config::default();
    config.server.port = addr.port();
    config.server.advertise_url = Some(url.clone());
    config.server.shutdown_timeout = Duration::from_secs(1);
    config.affinity.worker_id = Some(worker_id.to_string());
    config.affinity.forward_timeout = Duration::from_secs(2);
    config.backends.insert(
        "search".to_string(),
        BackendConfig {
            transport: TransportConfig::Http {
                http_url: format!("http://{upstream}/mcp"),
                streamable_http: true,
            },
            tools: vec!["search_*".to_string()],
            stateful: true,
            pool: Some(PoolConfig {
                strategy: PoolStrategy::Sticky,
                min_size: 0,
                max_size: 4,
                ..PoolConfig::default()
            }),
            timeout: Duration::from_secs(5),
            ..BackendConfig::default()
        },
    );

    let gateway = Gateway::with_store(config, store).unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        gateway
            .serve(listener, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });
    // Let the first heartbeat land
    tokio::time::sleep(Duration::from_millis(100)).await;

    Worker {
        url,
        shutdown: Some(tx),
        handle,
    }
}

fn call(id: u64, query: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {"name": "search_web", "arguments": {"q": query}},
    })
}

async fn post_mcp(client: &Client, worker: &Worker, session_id: &str, message: &Value) -> (StatusCode, Value) {
    let response = client
        .post(format!("{}/mcp", worker.url))
        .header("mcp-session-id", session_id)
        .json(message)
        .send()
        .await
        .unwrap();
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
    assert_eq!(
        response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok()),
        Some(session_id)
    );
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn test_session_follows_owner_and_survives_owner_loss() {
    let (upstream, served) = spawn_upstream().await;
    let memory = Arc::new(MemoryStore::new());
    let store: Arc<dyn CoordinationStore> = Arc::clone(&memory) as _;
    let a = spawn_worker("worker-a", upstream, Arc::clone(&store)).await;
    let b = spawn_worker("worker-b", upstream, Arc::clone(&store)).await;
    let client = Client::new();

    // First request claims the session for A
    let (status, body) = post_mcp(&client, &a, "sess-1", &call(1, "rust")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], json!(1));
    assert_eq!(body["result"]["params"]["arguments"]["q"], json!("rust"));
    assert_eq!(
        memory.get(&keys::pool_owner("sess-1")).await.unwrap().as_deref(),
        Some("worker-a")
    );

    // B relays to the owner instead of opening its own upstream session
    let (status, body) = post_mcp(&client, &b, "sess-1", &call(2, "tokio")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], json!(2));
    assert_eq!(body["result"]["params"]["arguments"]["q"], json!("tokio"));

    let metrics: Value = client
        .get(format!("{}/metrics/affinity", b.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["worker_id"], json!("worker-b"));
    assert_eq!(metrics["counters"]["forwards"], json!(1));
    assert_eq!(metrics["counters"]["ownership_conflicts"], json!(1));

    let pools: Value = client
        .get(format!("{}/pools", b.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let b_pool = &pools["pools"][0];
    assert_eq!(b_pool["total_connections"], json!(0));

    // A goes away; its heartbeat is retired but the ownership record stays
    a.stop().await;
    assert!(
        memory
            .get(&keys::worker_heartbeat("worker-a"))
            .await
            .unwrap()
            .is_none()
    );

    let (status, body) = post_mcp(&client, &b, "sess-1", &call(3, "axum")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], json!(3));
    assert!(body.get("error").is_none());
    assert_eq!(
        memory.get(&keys::pool_owner("sess-1")).await.unwrap().as_deref(),
        Some("worker-b")
    );
    assert_eq!(served.load(Ordering::SeqCst), 3);

    let metrics: Value = client
        .get(format!("{}/metrics/affinity", b.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metrics["counters"]["ownership_reclaims"], json!(1));

    b.stop().await;
}

#[tokio::test]
async fn test_operator_surface() {
    let (upstream, _served) = spawn_upstream().await;
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let worker = spawn_worker("worker-ops", upstream, store).await;
    let client = Client::new();

    let health: Value = client
        .get(format!("{}/health", worker.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["worker_id"], json!("worker-ops"));
    assert_eq!(health["pools"], json!(0));

    // Independent request, no session header
    let response: Value = client
        .post(format!("{}/mcp", worker.url))
        .json(&call(7, "pools"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(response["id"], json!(7));

    let pools: Value = client
        .get(format!("{}/pools", worker.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let key = pools["pools"][0]["key"].as_str().unwrap().to_string();
    assert!(key.ends_with("|streamable_http|default|anonymous"));

    let mut drain = Url::parse(&worker.url).unwrap();
    drain
        .path_segments_mut()
        .unwrap()
        .extend(["pools", key.as_str(), "drain"]);
    drain.set_query(Some("timeout=1s"));
    let drained = client.post(drain).send().await.unwrap();
    assert_eq!(drained.status().as_u16(), 200);
    let drained: Value = drained.json().await.unwrap();
    assert_eq!(drained["status"], json!("inactive"));

    let mut missing = Url::parse(&worker.url).unwrap();
    missing
        .path_segments_mut()
        .unwrap()
        .extend(["pools", "http://nowhere|stdio|default|anonymous"]);
    let missing = client.get(missing).send().await.unwrap();
    assert_eq!(missing.status().as_u16(), 404);

    worker.stop().await;
}
