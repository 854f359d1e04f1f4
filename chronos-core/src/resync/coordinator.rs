//! Orchestration of a resync run.
//!
//! A run captures one cluster view snapshot and, for each current member in
//! address order, pulls the timers the local node should now replicate in
//! next-pop-ordered pages. Each timer is handled independently: the node
//! installs it if it became more primary for it, pushes live copies to the
//! strictly-less-primary new replicas, tombstones replicas that dropped
//! off, and finally asks every involved node to drop its old reference.
//! Because every peer derives the same replica lists from the same pure
//! placement function, the per-timer work commutes across peers that all
//! report the same timer.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::cluster::view::{ClusterView, ViewSnapshot};
use crate::metrics::{AtomicCounter, AtomicGauge, CounterSink, GaugeSink};
use crate::replication::{ReplicationMessage, Replicator};
use crate::resync::client::PeerClient;
use crate::resync::wire::{self, EntryOutcome, ReferenceBatch, ResyncRecord, TimerReference};
use crate::store::TimerStore;
use crate::timer::NodeAddr;

/// Progress sinks for a resync run.
pub struct ResyncStats {
    /// Timers handled, whether or not anything was installed.
    pub timers_processed: Arc<dyn CounterSink>,
    /// Entries discarded because they failed validation.
    pub invalid_timers_processed: Arc<dyn CounterSink>,
    /// Peers still to be processed in the current run.
    pub nodes_remaining: Arc<dyn GaugeSink>,
}

impl Default for ResyncStats {
    fn default() -> Self {
        Self {
            timers_processed: Arc::new(AtomicCounter::default()),
            invalid_timers_processed: Arc::new(AtomicCounter::default()),
            nodes_remaining: Arc::new(AtomicGauge::default()),
        }
    }
}

/// Drives resynchronization against the rest of the cluster.
pub struct ResyncCoordinator {
    view: Arc<ClusterView>,
    client: PeerClient,
    store: Arc<dyn TimerStore>,
    replicator: Arc<dyn Replicator>,
    clock: Arc<dyn Clock>,
    stats: ResyncStats,
    shutdown: watch::Receiver<bool>,
}

impl ResyncCoordinator {
    /// Wires a coordinator to its collaborators. `shutdown` is observed
    /// between peers and between pages; the page in flight always
    /// completes so peers never see a half-accepted page.
    pub fn new(
        view: Arc<ClusterView>,
        client: PeerClient,
        store: Arc<dyn TimerStore>,
        replicator: Arc<dyn Replicator>,
        clock: Arc<dyn Clock>,
        stats: ResyncStats,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            view,
            client,
            store,
            replicator,
            clock,
            stats,
            shutdown,
        }
    }

    /// Runs a full resynchronization against every other current member.
    ///
    /// Never fails: per-peer failures are logged and the loop moves on.
    /// Observable through the injected stats and logs only.
    pub async fn resynchronize(&self) {
        let snapshot = self.view.snapshot();
        let mut peers = snapshot.all_current_nodes();
        peers.retain(|peer| *peer != snapshot.local);
        let total = peers.len();
        info!(view_id = %snapshot.view_id, peers = total, "starting resynchronization");

        for (index, peer) in peers.iter().enumerate() {
            if *self.shutdown.borrow() {
                info!("resynchronization cancelled");
                break;
            }
            self.stats.nodes_remaining.set((total - index) as u64);
            let status = self.resynchronise_with_single_node(peer, &snapshot).await;
            if (200..300).contains(&status) {
                debug!(peer = %peer, "resynchronized with peer");
            } else {
                warn!(peer = %peer, status, "resync with peer failed; continuing with the rest");
            }
        }
        self.stats.nodes_remaining.set(0);
    }

    /// Pulls and applies every page of timers the local node should take
    /// from `peer` under `snapshot`.
    ///
    /// Returns the last meaningful HTTP-style status: 200 on a clean run,
    /// the peer's code when a fetch fails, 400 when the peer sent
    /// something unparseable.
    pub async fn resynchronise_with_single_node(
        &self,
        peer: &NodeAddr,
        snapshot: &ViewSnapshot,
    ) -> u16 {
        let mut time_from = None;
        loop {
            let now_ms = self.clock.now_ms();
            let (status, body) = self
                .client
                .get_timers(peer, &snapshot.local, &snapshot.view_id, time_from)
                .await;
            if status != 200 && status != 206 {
                return status;
            }
            let outcomes = match wire::parse_page(&body) {
                Ok(outcomes) => outcomes,
                Err(err) => {
                    warn!(peer = %peer, "discarding timer page: {err}");
                    return 400;
                }
            };

            let mut references: BTreeMap<NodeAddr, Vec<TimerReference>> = BTreeMap::new();
            let mut latest_pop: Option<i64> = None;
            let mut page_had_invalid = false;
            for outcome in outcomes {
                match outcome {
                    EntryOutcome::Valid(record) => {
                        let pop = (now_ms as i64).saturating_add(record.fields.start_time_delta_ms);
                        latest_pop = Some(latest_pop.map_or(pop, |latest| latest.max(pop)));
                        self.process_record(record, snapshot, now_ms, &mut references)
                            .await;
                        self.stats.timers_processed.increment();
                    }
                    EntryOutcome::Invalid(reason) => {
                        debug!(peer = %peer, "skipping malformed timer entry: {reason}");
                        self.stats.invalid_timers_processed.increment();
                        page_had_invalid = true;
                    }
                }
            }

            // One DELETE per involved node, ids batched across the page.
            for (node, ids) in references {
                let delete_status = self.client.delete_references(&node, &ReferenceBatch { ids }).await;
                if !(200..300).contains(&delete_status) {
                    debug!(
                        node = %node,
                        status = delete_status,
                        "reference drop refused; stale references expire with their timers"
                    );
                }
            }

            if page_had_invalid {
                return 400;
            }
            if status == 200 {
                return 200;
            }
            if *self.shutdown.borrow() {
                info!(peer = %peer, "resync cancelled after completing the current page");
                return status;
            }
            let Some(latest_pop) = latest_pop else {
                warn!(peer = %peer, "partial page carried no timers; cannot advance the cursor");
                return status;
            };
            time_from = Some(latest_pop.saturating_add(1).max(0) as u64);
        }
    }

    /// Applies the per-timer decision procedure for one fetched entry.
    async fn process_record(
        &self,
        record: ResyncRecord,
        snapshot: &ViewSnapshot,
        now_ms: u64,
        references: &mut BTreeMap<NodeAddr, Vec<TimerReference>>,
    ) {
        let local = &snapshot.local;
        let id = record.id;
        let old_replicas = record.old_replicas;
        let new_replicas = record.fields.replicas.clone();

        let Some(new_index) = new_replicas.iter().position(|node| node == local) else {
            // The peer addressed us for a timer we do not replicate under
            // the new view. Emitting a reference drop here would carry a
            // meaningless index, so the entry is ignored outright.
            debug!(timer = %id, "peer offered a timer this node does not replicate");
            return;
        };
        let old_index = old_replicas.iter().position(|node| node == local);
        let timer = record
            .fields
            .into_timer(id, now_ms, snapshot.view_id.clone());

        // Install only on promotion (absent counts as infinitely low);
        // anything else would duplicate pops already owned by a
        // more-primary replica.
        if old_index.is_none_or(|old_index| new_index < old_index) {
            self.store.add_timer(timer.clone(), new_index);
        }

        // Push live copies down the new list, tombstones to nodes that
        // dropped off it.
        for (index, node) in new_replicas.iter().enumerate() {
            if node != local && index > new_index {
                self.replicator
                    .replicate_timer_to_node(&ReplicationMessage::Live(timer.clone()), node)
                    .await;
            }
        }
        for node in &old_replicas {
            if node != local && !new_replicas.contains(node) {
                self.replicator
                    .replicate_timer_to_node(&ReplicationMessage::tombstone_for(&timer), node)
                    .await;
            }
        }

        // Everyone who held or now holds the timer drops the reference the
        // local node has just taken over.
        let mut involved: BTreeSet<NodeAddr> = old_replicas.into_iter().collect();
        involved.extend(new_replicas);
        for node in involved {
            references.entry(node).or_default().push(TimerReference {
                id,
                replica_index: new_index as u32,
            });
        }
    }
}
