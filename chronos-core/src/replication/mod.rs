//! Best-effort replication of timers to peer nodes.
//!
//! Replication never blocks or fails the operation that triggered it: a
//! peer that misses an update is repaired by the next resync, and a peer
//! that misses a tombstone holds a timer that expires on its own.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::resync::client::{PeerRequest, RequestBackend, RequestMethod};
use crate::resync::wire;
use crate::timer::{NodeAddr, Timer, TimerId};

const TOMBSTONE: &str = "tombstone";
const HOLD_FOR: &str = "hold-for";
const SEQUENCE_NUMBER: &str = "sequence-number";

/// A unit of replication: either a live copy of a timer or an instruction
/// to forget one. Modelling the tombstone as its own variant keeps states
/// like "live tombstone" unrepresentable.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationMessage {
    /// Install or overwrite this timer.
    Live(Timer),
    /// Forget this timer, and refuse re-installs for `hold_ms`.
    Tombstone {
        /// Timer to forget.
        id: TimerId,
        /// How long the deletion must be remembered.
        hold_ms: u64,
    },
}

impl ReplicationMessage {
    /// Builds the tombstone that retires `timer` on a peer.
    #[must_use]
    pub fn tombstone_for(timer: &Timer) -> Self {
        Self::Tombstone {
            id: timer.id,
            hold_ms: timer.tombstone_hold_ms(),
        }
    }

    /// The timer this message concerns.
    #[must_use]
    pub fn id(&self) -> TimerId {
        match self {
            Self::Live(timer) => timer.id,
            Self::Tombstone { id, .. } => *id,
        }
    }

    /// Whether this message deletes rather than installs.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Self::Tombstone { .. })
    }

    /// Wire form sent as the body of `PUT /timers/{id}`. Pop times are
    /// carried as deltas from `now_ms` so receivers can rebase them.
    #[must_use]
    pub fn to_json(&self, now_ms: u64) -> Value {
        match self {
            Self::Live(timer) => {
                let mut body = wire::timer_json(timer, now_ms);
                body[SEQUENCE_NUMBER] = json!(timer.sequence_number);
                body
            }
            Self::Tombstone { hold_ms, .. } => json!({
                TOMBSTONE: true,
                HOLD_FOR: hold_ms,
            }),
        }
    }

    /// Parses the body of `PUT /timers/{id}`. Live timers are rebased onto
    /// `now_ms` and stamped with the receiver's `view_id`.
    pub fn parse(id: TimerId, body: &str, now_ms: u64, view_id: &str) -> Result<Self, String> {
        let value: Value =
            serde_json::from_str(body).map_err(|err| format!("body is not JSON: {err}"))?;
        if value.get(TOMBSTONE).and_then(Value::as_bool) == Some(true) {
            let hold_ms = value
                .get(HOLD_FOR)
                .and_then(Value::as_u64)
                .ok_or_else(|| format!("tombstone missing {HOLD_FOR:?}"))?;
            return Ok(Self::Tombstone { id, hold_ms });
        }
        let fields = wire::parse_timer_fields(&value)?;
        let sequence_number = value
            .get(SEQUENCE_NUMBER)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0);
        let mut timer = fields.into_timer(id, now_ms, view_id.to_string());
        timer.sequence_number = sequence_number;
        Ok(Self::Live(timer))
    }
}

/// Pushes replication messages to peers. Async and best-effort: callers
/// never learn about delivery failures, they only show up in logs and
/// counters.
#[async_trait::async_trait]
pub trait Replicator: Send + Sync {
    /// Sends `message` to `node`.
    async fn replicate_timer_to_node(&self, message: &ReplicationMessage, node: &NodeAddr);
}

/// HTTP replicator: `PUT /timers/{id}` on the peer.
pub struct HttpReplicator {
    backend: Arc<dyn RequestBackend>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl HttpReplicator {
    /// Builds a replicator on top of a request backend.
    pub fn new(backend: Arc<dyn RequestBackend>, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            backend,
            clock,
            timeout,
        }
    }
}

#[async_trait::async_trait]
impl Replicator for HttpReplicator {
    async fn replicate_timer_to_node(&self, message: &ReplicationMessage, node: &NodeAddr) {
        let id = message.id();
        let body = message.to_json(self.clock.now_ms()).to_string();
        let request = PeerRequest {
            server: node.clone(),
            path: format!("/timers/{id}"),
            method: RequestMethod::Put,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Some(body),
            timeout: self.timeout,
        };
        match self.backend.execute(request).await {
            Ok(response) if (200..300).contains(&response.status) => {
                debug!(node = %node, timer = %id, "replicated timer");
            }
            Ok(response) => {
                warn!(node = %node, timer = %id, status = response.status, "peer refused replication");
            }
            Err(err) => {
                warn!(node = %node, timer = %id, "replication failed: {err}");
            }
        }
    }
}
