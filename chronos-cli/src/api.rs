//! HTTP API of a Chronos node.
//!
//! Two audiences share the router: clients creating and cancelling timers,
//! and peer nodes replicating timers and running the resync protocol
//! (`GET /timers`, `DELETE /timers/references`). Resync query tokens are
//! `;`-separated inside a single query string, so that string is parsed by
//! hand rather than through the usual `&`-based extractors.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get};
use serde_json::{Value, json};
use tracing::{debug, info};

use chronos_core::cluster::assignment::replicas_for;
use chronos_core::resync::wire::{self, ReferenceBatch};
use chronos_core::{
    Clock, ClusterView, InMemoryTimerStore, NodeAddr, ReplicationMessage, Replicator, Timer,
    TimerId, TimerStore,
};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct ApiState {
    /// The node's timer store.
    pub store: Arc<InMemoryTimerStore>,
    /// Cluster membership handle.
    pub view: Arc<ClusterView>,
    /// Push-side replication.
    pub replicator: Arc<dyn Replicator>,
    /// Wall clock.
    pub clock: Arc<dyn Clock>,
    /// Replicas per timer, primary included.
    pub replica_factor: usize,
    /// Page-size cap for resync responses.
    pub max_timers_in_response: usize,
    /// Allocator for new timer ids.
    pub next_timer_id: Arc<AtomicU64>,
}

/// Error response carrying a status code and a one-line reason.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Builds the node's router.
pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/timers", get(timers_for_resync).post(create_timer))
        .route("/timers/{id}", axum::routing::put(replicate_timer).delete(delete_timer))
        .route("/timers/references", delete(drop_references))
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({
        "status": "up",
        "timers": state.store.len(),
        "cluster-view-id": state.view.view_id(),
    }))
}

/// `POST /timers`: client create.
///
/// Body: `{"timing": {"interval": ms, "repeat-for": ms}, "callback": {…}}`.
/// The replica list is computed under the current view; the local copy is
/// installed when this node is on it and live copies go to the rest.
async fn create_timer(
    State(state): State<ApiState>,
    Json(body): Json<Value>,
) -> Result<impl IntoResponse, ApiError> {
    let timing = body
        .get("timing")
        .filter(|t| t.is_object())
        .ok_or_else(|| ApiError::bad_request("missing \"timing\" object"))?;
    let interval_ms = timing
        .get("interval")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| ApiError::bad_request("\"timing.interval\" must be a u32"))?;
    let repeat_for_ms = match timing.get("repeat-for") {
        None => interval_ms,
        Some(value) => value
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| ApiError::bad_request("\"timing.repeat-for\" must be a u32"))?,
    };
    let callback = body
        .get("callback")
        .filter(|c| c.is_object())
        .ok_or_else(|| ApiError::bad_request("missing \"callback\" object"))?
        .clone();

    let snapshot = state.view.snapshot();
    let id = TimerId(state.next_timer_id.fetch_add(1, Ordering::Relaxed));
    let replicas = replicas_for(id, &snapshot.all_current_nodes(), state.replica_factor);
    let now_ms = state.clock.now_ms();
    let timer = Timer::create(
        id,
        now_ms,
        interval_ms,
        repeat_for_ms,
        callback,
        replicas,
        snapshot.view_id.clone(),
    );

    if let Some(index) = timer.replica_index(&snapshot.local) {
        state.store.add_timer(timer.clone(), index);
    }
    for node in &timer.replicas {
        if *node != snapshot.local {
            state
                .replicator
                .replicate_timer_to_node(&ReplicationMessage::Live(timer.clone()), node)
                .await;
        }
    }
    info!(timer = %id, replicas = timer.replicas.len(), "created timer");
    Ok(Json(json!({ "id": id })))
}

/// `PUT /timers/{id}`: replication receive. Installs a live copy or
/// applies a tombstone; never re-replicates.
async fn replicate_timer(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
    body: String,
) -> Result<StatusCode, ApiError> {
    let id = TimerId(id);
    let now_ms = state.clock.now_ms();
    let view_id = state.view.view_id();
    let message = ReplicationMessage::parse(id, &body, now_ms, &view_id)
        .map_err(ApiError::bad_request)?;
    match message {
        ReplicationMessage::Live(timer) => {
            let local = state.view.local();
            let index = timer.replica_index(&local).unwrap_or(0);
            state.store.add_timer(timer, index);
        }
        ReplicationMessage::Tombstone { id, hold_ms } => {
            state.store.apply_tombstone(id, hold_ms, now_ms);
        }
    }
    Ok(StatusCode::OK)
}

/// `DELETE /timers/{id}`: client cancel. Removes the local copy and
/// tombstones the other replicas.
async fn delete_timer(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
) -> Result<StatusCode, ApiError> {
    let id = TimerId(id);
    let now_ms = state.clock.now_ms();
    let Some(timer) = state.store.get(id) else {
        return Err(ApiError::not_found(format!("no timer {id}")));
    };
    state
        .store
        .apply_tombstone(id, timer.tombstone_hold_ms(), now_ms);
    let local = state.view.local();
    for node in &timer.replicas {
        if *node != local {
            state
                .replicator
                .replicate_timer_to_node(&ReplicationMessage::tombstone_for(&timer), node)
                .await;
        }
    }
    Ok(StatusCode::ACCEPTED)
}

/// `GET /timers`: resync serving side.
///
/// Returns the timers the requesting node should take over under the
/// current view, paged by next-pop time. 200 closes the listing, 206 means
/// more pages remain past the returned ones.
async fn timers_for_resync(
    State(state): State<ApiState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, ApiError> {
    let query = uri.query().unwrap_or_default();
    let mut target = None;
    let mut view_id = None;
    let mut time_from = None;
    for token in query.split(';').filter(|t| !t.is_empty()) {
        match token.split_once('=') {
            Some(("node-for-replicas", value)) => target = Some(NodeAddr::new(value)),
            Some(("cluster-view-id", value)) => view_id = Some(value.to_string()),
            Some(("time-from", value)) => {
                let parsed = value
                    .parse::<u64>()
                    .map_err(|_| ApiError::bad_request("\"time-from\" must be an integer"))?;
                time_from = Some(parsed);
            }
            _ => return Err(ApiError::bad_request(format!("unrecognised token {token:?}"))),
        }
    }
    let target = target.ok_or_else(|| ApiError::bad_request("missing \"node-for-replicas\""))?;
    let view_id = view_id.ok_or_else(|| ApiError::bad_request("missing \"cluster-view-id\""))?;

    let snapshot = state.view.snapshot();
    if view_id != snapshot.view_id {
        debug!(requested = %view_id, current = %snapshot.view_id, "resync query for a stale view");
        return Err(ApiError::bad_request("stale cluster view id"));
    }

    let max_entries = match headers.get("Range") {
        None => state.max_timers_in_response,
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or_else(|| ApiError::bad_request("unparseable Range header"))?,
    };

    let now_ms = state.clock.now_ms();
    let page = state.store.resync_page(
        &target,
        &snapshot.all_post_scale_nodes(),
        state.replica_factor,
        &snapshot.view_id,
        time_from,
        max_entries,
    );
    let status = if page.more {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    debug!(
        target = %target,
        entries = page.entries.len(),
        more = page.more,
        "served resync page"
    );
    Ok((status, Json(wire::page_json(&page.entries, now_ms))).into_response())
}

/// `DELETE /timers/references`: a peer took over the named
/// `(timer, replica-index)` entries; stop offering them to it.
async fn drop_references(
    State(state): State<ApiState>,
    Json(batch): Json<ReferenceBatch>,
) -> StatusCode {
    for reference in &batch.ids {
        state
            .store
            .drop_reference(reference.id, reference.replica_index);
    }
    if !batch.ids.is_empty() {
        debug!(references = batch.ids.len(), "dropped timer references");
    }
    StatusCode::ACCEPTED
}

/// Seeds the timer id allocator so ids are unique across nodes with
/// overwhelming probability: the node's port in the low bits, the clock in
/// the rest.
#[must_use]
pub fn seed_timer_ids(clock: &dyn Clock, port: u16) -> Arc<AtomicU64> {
    let seed = (clock.now_ms() << 20) | (u64::from(port) << 4);
    Arc::new(AtomicU64::new(seed))
}
