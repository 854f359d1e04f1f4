//! Next-pop-ordered timer storage.
//!
//! One store per process. Resync, replication, and the pop loop all go
//! through it; the internal lock serializes writers so callers can treat
//! every operation as atomic.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound::{Excluded, Unbounded};

use parking_lot::Mutex;

use crate::cluster::assignment::replicas_for;
use crate::timer::{NodeAddr, Timer, TimerId};

/// The seam the resync coordinator installs timers through. Mocked in
/// tests; implemented by [`InMemoryTimerStore`] in production.
pub trait TimerStore: Send + Sync {
    /// Installs (or overwrites) a timer the local node is responsible for.
    /// `replica_index` is the local node's position in the timer's replica
    /// list.
    fn add_timer(&self, timer: Timer, replica_index: usize);
}

/// One timer offered to a peer during resync: the stored replica list it
/// should migrate away from, and the timer carrying the updated list.
#[derive(Debug, Clone)]
pub struct ResyncEntry {
    /// Replica list the timer was stored under (the prior view).
    pub old_replicas: Vec<NodeAddr>,
    /// The timer with `replicas` already rewritten for the new view.
    pub timer: Timer,
}

/// A page of resync candidates plus whether more remain past it.
#[derive(Debug, Clone, Default)]
pub struct ResyncPage {
    /// Entries in ascending next-pop order.
    pub entries: Vec<ResyncEntry>,
    /// True when the page was cut short by the requested size.
    pub more: bool,
}

#[derive(Debug)]
struct Record {
    timer: Timer,
    // Replica indices (in the updated list) that have taken over this
    // timer, reported via DELETE /timers/references.
    informed: BTreeSet<u32>,
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<TimerId, Record>,
    by_pop: BTreeMap<(u64, TimerId), ()>,
    // Tombstoned ids and when the tombstone may be forgotten. Late
    // replications of a deleted timer land here and are dropped.
    tombstones: HashMap<TimerId, u64>,
}

impl StoreInner {
    fn detach(&mut self, id: TimerId) -> Option<Record> {
        let record = self.records.remove(&id)?;
        self.by_pop.remove(&(record.timer.next_pop_ms, id));
        Some(record)
    }

    fn attach(&mut self, record: Record) {
        let id = record.timer.id;
        let key = (record.timer.next_pop_ms, id);
        if let Some(previous) = self.records.insert(id, record) {
            self.by_pop.remove(&(previous.timer.next_pop_ms, id));
        }
        self.by_pop.insert(key, ());
    }
}

/// In-memory timer store.
pub struct InMemoryTimerStore {
    inner: Mutex<StoreInner>,
}

impl Default for InMemoryTimerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTimerStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Looks up a timer by id.
    #[must_use]
    pub fn get(&self, id: TimerId) -> Option<Timer> {
        self.inner.lock().records.get(&id).map(|r| r.timer.clone())
    }

    /// Removes a timer, returning it if it was present.
    pub fn remove(&self, id: TimerId) -> Option<Timer> {
        self.inner.lock().detach(id).map(|r| r.timer)
    }

    /// Removes a timer and remembers the deletion for `hold_ms` so that
    /// delayed replications cannot resurrect it.
    pub fn apply_tombstone(&self, id: TimerId, hold_ms: u64, now_ms: u64) -> Option<Timer> {
        let mut inner = self.inner.lock();
        inner.tombstones.insert(id, now_ms + hold_ms);
        inner.detach(id).map(|r| r.timer)
    }

    /// Marks that the replica at `replica_index` in the timer's updated
    /// list has taken the timer over; it will no longer be offered to that
    /// replica by [`Self::resync_page`].
    pub fn drop_reference(&self, id: TimerId, replica_index: u32) {
        if let Some(record) = self.inner.lock().records.get_mut(&id) {
            record.informed.insert(replica_index);
        }
    }

    /// Timers that `target` should pull during resync, in next-pop order.
    ///
    /// A timer qualifies when it was stored under a different view than
    /// `view_id`, `target` appears in its replica list recomputed over
    /// `post_scale_nodes`, and that position has not already been handed
    /// over. `time_from` is an exclusive lower bound on next-pop.
    #[must_use]
    pub fn resync_page(
        &self,
        target: &NodeAddr,
        post_scale_nodes: &[NodeAddr],
        replica_count: usize,
        view_id: &str,
        time_from: Option<u64>,
        max_entries: usize,
    ) -> ResyncPage {
        let inner = self.inner.lock();
        let mut page = ResyncPage::default();
        let lower = match time_from {
            Some(from) => Excluded((from, TimerId(u64::MAX))),
            None => Unbounded,
        };
        for ((_, id), ()) in inner.by_pop.range((lower, Unbounded)) {
            let Some(record) = inner.records.get(id) else {
                continue;
            };
            if record.timer.view_id == view_id {
                continue;
            }
            let updated = replicas_for(*id, post_scale_nodes, replica_count);
            let Some(target_idx) = updated.iter().position(|n| n == target) else {
                continue;
            };
            if record.informed.contains(&(target_idx as u32)) {
                continue;
            }
            if page.entries.len() == max_entries {
                page.more = true;
                break;
            }
            let mut timer = record.timer.clone();
            timer.replicas = updated;
            page.entries.push(ResyncEntry {
                old_replicas: record.timer.replicas.clone(),
                timer,
            });
        }
        page
    }

    /// Removes and returns every timer due at or before `now_ms`. Expired
    /// tombstones are purged on the same sweep.
    pub fn due_timers(&self, now_ms: u64) -> Vec<Timer> {
        let mut inner = self.inner.lock();
        let due: Vec<TimerId> = inner
            .by_pop
            .range(..=(now_ms, TimerId(u64::MAX)))
            .map(|((_, id), ())| *id)
            .collect();
        let timers = due
            .into_iter()
            .filter_map(|id| inner.detach(id).map(|r| r.timer))
            .collect();
        inner.tombstones.retain(|_, expiry| *expiry > now_ms);
        timers
    }

    /// Puts a timer back, typically after re-arming it for its next pop.
    pub fn reinsert(&self, timer: Timer) {
        self.inner.lock().attach(Record {
            timer,
            informed: BTreeSet::new(),
        });
    }

    /// Earliest next-pop across the store.
    #[must_use]
    pub fn next_pop_ms(&self) -> Option<u64> {
        self.inner.lock().by_pop.keys().next().map(|(pop, _)| *pop)
    }

    /// Number of live timers held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Whether the store holds no timers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TimerStore for InMemoryTimerStore {
    fn add_timer(&self, timer: Timer, _replica_index: usize) {
        let mut inner = self.inner.lock();
        if inner.tombstones.contains_key(&timer.id) {
            return;
        }
        inner.attach(Record {
            timer,
            informed: BTreeSet::new(),
        });
    }
}
