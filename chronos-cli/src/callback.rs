//! Pop loop and HTTP callback delivery.
//!
//! Each replica holds the timer, but only the primary fires it on time;
//! backups wait out a per-index delay so a healthy primary always wins.
//! A successful pop re-arms recurring timers and pushes the updated state
//! to the other replicas. A failed pop removes only the local copy, and
//! deliberately does not replicate the removal, so a backup replica still
//! gets its chance.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use chronos_core::{
    Clock, InMemoryTimerStore, NodeAddr, ReplicationMessage, Replicator, Timer,
};

/// How long each successive backup replica waits past the nominal pop time
/// before firing in the primary's stead.
const BACKUP_POP_DELAY_MS: u64 = 2_000;

/// Cadence of the due-timer sweep.
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Sweeps due timers and delivers their callbacks.
pub struct CallbackWorker {
    store: Arc<InMemoryTimerStore>,
    replicator: Arc<dyn Replicator>,
    clock: Arc<dyn Clock>,
    local: NodeAddr,
    client: reqwest::Client,
}

impl CallbackWorker {
    /// Builds a worker delivering callbacks with `timeout` per request.
    pub fn new(
        store: Arc<InMemoryTimerStore>,
        replicator: Arc<dyn Replicator>,
        clock: Arc<dyn Clock>,
        local: NodeAddr,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building the callback HTTP client")?;
        Ok(Self {
            store,
            replicator,
            clock,
            local,
            client,
        })
    }

    /// Runs the sweep loop until `shutdown` fires.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("callback worker shutting down");
                            break;
                        }
                    }
                    _ = sweep.tick() => self.tick().await,
                }
            }
        })
    }

    async fn tick(&self) {
        let now_ms = self.clock.now_ms();
        for timer in self.store.due_timers(now_ms) {
            self.handle_due_timer(timer, now_ms).await;
        }
    }

    async fn handle_due_timer(&self, mut timer: Timer, now_ms: u64) {
        let Some(index) = timer.replica_index(&self.local) else {
            // Not ours any more; a resync has moved it on.
            debug!(timer = %timer.id, "dropping due timer this node no longer replicates");
            return;
        };

        // The primary fires the moment the pop is due. A backup only takes
        // over once its per-index delay has elapsed without the primary's
        // successful pop replicating the timer forward.
        if !timer.is_primary(&self.local) {
            let fire_at = timer.next_pop_ms + BACKUP_POP_DELAY_MS * index as u64;
            if now_ms < fire_at {
                self.store.reinsert(timer);
                return;
            }
            debug!(timer = %timer.id, index, "backup replica taking over an unanswered pop");
        }

        match self.deliver(&timer).await {
            Ok(()) => {
                debug!(timer = %timer.id, sequence = timer.sequence_number, "callback delivered");
                timer.advance();
                if timer.has_more_pops() {
                    self.store.reinsert(timer.clone());
                    for node in &timer.replicas {
                        if *node != self.local {
                            self.replicator
                                .replicate_timer_to_node(
                                    &ReplicationMessage::Live(timer.clone()),
                                    node,
                                )
                                .await;
                        }
                    }
                } else {
                    self.store
                        .apply_tombstone(timer.id, timer.tombstone_hold_ms(), now_ms);
                    for node in &timer.replicas {
                        if *node != self.local {
                            self.replicator
                                .replicate_timer_to_node(
                                    &ReplicationMessage::tombstone_for(&timer),
                                    node,
                                )
                                .await;
                        }
                    }
                }
            }
            Err(reason) => {
                // Drop only the local copy; the removal is not replicated
                // so another replica can still succeed.
                warn!(timer = %timer.id, "callback failed, abandoning local copy: {reason}");
            }
        }
    }

    async fn deliver(&self, timer: &Timer) -> std::result::Result<(), String> {
        let http = timer
            .callback
            .get("http")
            .ok_or_else(|| "callback has no \"http\" block".to_string())?;
        let uri = http
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| "callback has no \"http.uri\"".to_string())?;
        let url = if uri.starts_with("http://") || uri.starts_with("https://") {
            uri.to_string()
        } else {
            format!("http://{uri}")
        };
        let opaque = http
            .get("opaque")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let response = self
            .client
            .post(&url)
            .header("X-Sequence-Number", timer.sequence_number)
            .header("Content-Type", "application/octet-stream")
            .body(opaque)
            .send()
            .await
            .map_err(|err| err.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("callback returned {}", response.status()))
        }
    }
}
