#![allow(missing_docs, clippy::unwrap_used)]

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{Value, json};

use chronos_cli::api::{ApiState, create_router, seed_timer_ids};
use chronos_core::resync::wire::{ReferenceBatch, TimerReference};
use chronos_core::{
    Clock, ClusterView, InMemoryTimerStore, NodeAddr, ReplicationMessage, Replicator,
    SystemClock, Timer, TimerId, TimerStore, ViewSnapshot, replicas_for,
};

const LOCAL: &str = "10.0.0.1:9999";
const PEER_B: &str = "10.0.0.2:9999";
const PEER_C: &str = "10.0.0.3:9999";

struct NullReplicator;

#[async_trait::async_trait]
impl Replicator for NullReplicator {
    async fn replicate_timer_to_node(&self, _message: &ReplicationMessage, _node: &NodeAddr) {}
}

fn state(staying: &[&str], view_id: &str, replica_factor: usize) -> ApiState {
    let snapshot = ViewSnapshot {
        staying: staying.iter().map(|s| NodeAddr::new(*s)).collect(),
        leaving: Vec::new(),
        joining: Vec::new(),
        view_id: view_id.to_string(),
        local: NodeAddr::new(LOCAL),
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    ApiState {
        store: Arc::new(InMemoryTimerStore::new()),
        view: Arc::new(ClusterView::new(snapshot).unwrap()),
        replicator: Arc::new(NullReplicator),
        clock: clock.clone(),
        replica_factor,
        max_timers_in_response: 100,
        next_timer_id: seed_timer_ids(clock.as_ref(), 7253),
    }
}

async fn serve(state: ApiState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, create_router(state)).await.unwrap();
    });
    addr
}

fn stale_timer(id: u64, next_pop_ms: u64, old_replicas: &[&str]) -> Timer {
    Timer {
        id: TimerId(id),
        next_pop_ms,
        interval_ms: 100,
        repeat_for_ms: 200,
        sequence_number: 0,
        callback: json!({"http": {"uri": "localhost", "opaque": "stuff"}}),
        replicas: old_replicas.iter().map(|r| NodeAddr::new(*r)).collect(),
        view_id: "old-view".to_string(),
    }
}

/// Timer ids for which `target` is on the recomputed replica list.
fn ids_replicating_on(target: &str, nodes: &[&str], factor: usize, count: usize) -> Vec<u64> {
    let node_addrs: Vec<NodeAddr> = nodes.iter().map(|n| NodeAddr::new(*n)).collect();
    let target = NodeAddr::new(target);
    (0u64..)
        .filter(|id| replicas_for(TimerId(*id), &node_addrs, factor).contains(&target))
        .take(count)
        .collect()
}

#[tokio::test]
async fn health_reports_the_cluster_view() {
    let addr = serve(state(&[LOCAL], "view-1", 1)).await;
    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "up");
    assert_eq!(body["cluster-view-id"], "view-1");
}

#[tokio::test]
async fn created_timers_live_in_the_store_until_cancelled() {
    let state = state(&[LOCAL], "view-1", 1);
    let store = state.store.clone();
    let addr = serve(state).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{addr}/timers"))
        .json(&json!({
            "timing": {"interval": 10_000, "repeat-for": 10_000},
            "callback": {"http": {"uri": "localhost:5001/pop", "opaque": "stuff"}},
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    let id = body["id"].as_u64().unwrap();
    assert_eq!(store.len(), 1);
    let stored = store.get(TimerId(id)).unwrap();
    assert_eq!(stored.replicas, vec![NodeAddr::new(LOCAL)]);
    assert_eq!(stored.interval_ms, 10_000);

    let response = client
        .delete(format!("http://{addr}/timers/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 202);
    assert!(store.is_empty());

    let response = client
        .delete(format!("http://{addr}/timers/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn bodies_without_timing_or_callback_are_rejected() {
    let addr = serve(state(&[LOCAL], "view-1", 1)).await;
    let client = reqwest::Client::new();
    for body in [
        json!({"callback": {"http": {}}}),
        json!({"timing": {"interval": 100}}),
        json!({"timing": {"interval": "fast"}, "callback": {"http": {}}}),
    ] {
        let response = client
            .post(format!("http://{addr}/timers"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400, "body: {body}");
    }
}

#[tokio::test]
async fn replication_puts_install_and_tombstones_remove() {
    let state = state(&[LOCAL, PEER_B], "view-1", 2);
    let store = state.store.clone();
    let addr = serve(state).await;
    let client = reqwest::Client::new();

    let now_ms = SystemClock.now_ms();
    let timer = Timer {
        id: TimerId(55),
        next_pop_ms: now_ms + 5_000,
        interval_ms: 5_000,
        repeat_for_ms: 5_000,
        sequence_number: 0,
        callback: json!({"http": {"uri": "localhost", "opaque": "stuff"}}),
        replicas: vec![NodeAddr::new(PEER_B), NodeAddr::new(LOCAL)],
        view_id: "ignored-by-the-wire".to_string(),
    };
    let body = ReplicationMessage::Live(timer).to_json(now_ms).to_string();

    let response = client
        .put(format!("http://{addr}/timers/55"))
        .header("Content-Type", "application/json")
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let stored = store.get(TimerId(55)).unwrap();
    // Installed under the receiver's view, at the receiver's index.
    assert_eq!(stored.view_id, "view-1");
    assert_eq!(stored.replica_index(&NodeAddr::new(LOCAL)), Some(1));

    let response = client
        .put(format!("http://{addr}/timers/55"))
        .header("Content-Type", "application/json")
        .body(json!({"tombstone": true, "hold-for": 10_000}).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(store.is_empty());

    // The tombstone keeps holding the id against late replications.
    let response = client
        .put(format!("http://{addr}/timers/55"))
        .header("Content-Type", "application/json")
        .body(
            ReplicationMessage::Live(stale_timer(55, now_ms + 5_000, &[LOCAL]))
                .to_json(now_ms)
                .to_string(),
        )
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert!(store.is_empty());
}

#[tokio::test]
async fn resync_queries_page_through_stale_timers() {
    let nodes = [LOCAL, PEER_B, PEER_C];
    let state = state(&nodes, "view-1", 2);
    let store = state.store.clone();
    let addr = serve(state).await;
    let client = reqwest::Client::new();

    // Two timers PEER_B replicates under the new view, stored under an old
    // view, plus one already current that must not be served.
    let ids = ids_replicating_on(PEER_B, &nodes, 2, 2);
    store.add_timer(stale_timer(ids[0], 1_000, &[PEER_C]), 0);
    store.add_timer(stale_timer(ids[1], 2_000, &[PEER_C]), 0);
    let mut current = stale_timer(9_999, 3_000, &[PEER_C]);
    current.view_id = "view-1".to_string();
    store.add_timer(current, 0);

    let url = format!(
        "http://{addr}/timers?node-for-replicas={PEER_B};cluster-view-id=view-1"
    );
    let response = client
        .get(&url)
        .header("Range", "1")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 206);
    let body: Value = response.json().await.unwrap();
    let timers = body["Timers"].as_array().unwrap();
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0]["TimerID"].as_u64().unwrap(), ids[0]);
    assert_eq!(timers[0]["OldReplicas"], json!([PEER_C]));
    let replicas = timers[0]["Timer"]["reliability"]["replicas"]
        .as_array()
        .unwrap();
    assert!(replicas.iter().any(|r| r == PEER_B));

    // Second page, following the first timer's pop time.
    let response = client
        .get(format!("{url};time-from=1000"))
        .header("Range", "10")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    let timers = body["Timers"].as_array().unwrap();
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0]["TimerID"].as_u64().unwrap(), ids[1]);
}

#[tokio::test]
async fn resync_queries_validate_their_inputs() {
    let addr = serve(state(&[LOCAL, PEER_B], "view-1", 2)).await;
    let client = reqwest::Client::new();
    for path in [
        "/timers?cluster-view-id=view-1",
        "/timers?node-for-replicas=10.0.0.2:9999",
        "/timers?node-for-replicas=10.0.0.2:9999;cluster-view-id=some-other-view",
        "/timers?node-for-replicas=10.0.0.2:9999;cluster-view-id=view-1;time-from=soon",
    ] {
        let response = client
            .get(format!("http://{addr}{path}"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400, "path: {path}");
    }
}

#[tokio::test]
async fn dropped_references_stop_being_offered() {
    let nodes = [LOCAL, PEER_B, PEER_C];
    let state = state(&nodes, "view-1", 2);
    let store = state.store.clone();
    let addr = serve(state).await;
    let client = reqwest::Client::new();

    let ids = ids_replicating_on(PEER_B, &nodes, 2, 1);
    store.add_timer(stale_timer(ids[0], 1_000, &[PEER_C]), 0);

    let url = format!(
        "http://{addr}/timers?node-for-replicas={PEER_B};cluster-view-id=view-1"
    );
    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    let replicas = body["Timers"][0]["Timer"]["reliability"]["replicas"]
        .as_array()
        .unwrap();
    let index = replicas.iter().position(|r| r == PEER_B).unwrap() as u32;

    let response = client
        .delete(format!("http://{addr}/timers/references"))
        .json(&ReferenceBatch {
            ids: vec![TimerReference {
                id: TimerId(ids[0]),
                replica_index: index,
            }],
        })
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 202);

    let body: Value = client.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["Timers"].as_array().unwrap().len(), 0);
}
