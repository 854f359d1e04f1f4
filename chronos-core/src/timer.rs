use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a timer, allocated by the node that accepts the
/// client request and preserved across replication and resync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of a Chronos process as `host:port`.
///
/// Equality and ordering are lexical; two addresses naming the same process
/// through different spellings are treated as different nodes, so cluster
/// configuration must use one canonical spelling per node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeAddr(String);

impl NodeAddr {
    /// Wraps a `host:port` string.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// The raw `host:port` form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeAddr {
    fn from(addr: &str) -> Self {
        Self::new(addr)
    }
}

/// A replicated timer as held by a node.
///
/// All times are absolute wall-clock milliseconds since the Unix epoch.
/// Wire forms carry pop times as deltas relative to the sender's clock and
/// receivers rebase them, so clocks only need to agree loosely.
#[derive(Debug, Clone, PartialEq)]
pub struct Timer {
    /// Timer identifier.
    pub id: TimerId,
    /// Absolute time of the next pop.
    pub next_pop_ms: u64,
    /// Interval between pops. `0` means the timer never fires again.
    pub interval_ms: u32,
    /// Total window, from the configured start, within which pops occur.
    pub repeat_for_ms: u32,
    /// Number of pops completed so far; sent with callbacks for dedup.
    pub sequence_number: u32,
    /// Opaque callback description, preserved byte-for-byte.
    pub callback: serde_json::Value,
    /// Ordered replica list; index 0 is the primary.
    pub replicas: Vec<NodeAddr>,
    /// Cluster view id the replica list was computed under.
    pub view_id: String,
}

impl Timer {
    /// Builds a freshly-created timer whose first pop is one interval from
    /// `now_ms`.
    #[must_use]
    pub fn create(
        id: TimerId,
        now_ms: u64,
        interval_ms: u32,
        repeat_for_ms: u32,
        callback: serde_json::Value,
        replicas: Vec<NodeAddr>,
        view_id: String,
    ) -> Self {
        Self {
            id,
            next_pop_ms: now_ms + u64::from(interval_ms),
            interval_ms,
            repeat_for_ms,
            sequence_number: 0,
            callback,
            replicas,
            view_id,
        }
    }

    /// Index of `node` in the replica list, if present.
    #[must_use]
    pub fn replica_index(&self, node: &NodeAddr) -> Option<usize> {
        self.replicas.iter().position(|r| r == node)
    }

    /// Whether `node` is the primary replica for this timer.
    #[must_use]
    pub fn is_primary(&self, node: &NodeAddr) -> bool {
        self.replicas.first() == Some(node)
    }

    /// Whether another pop remains after the one counted by
    /// `sequence_number`. Pop `k` (1-based) happens at offset
    /// `interval * k` and is allowed while that offset is within
    /// `repeat_for`.
    #[must_use]
    pub fn has_more_pops(&self) -> bool {
        if self.interval_ms == 0 {
            return false;
        }
        let next_offset = u64::from(self.interval_ms) * (u64::from(self.sequence_number) + 1);
        next_offset <= u64::from(self.repeat_for_ms)
    }

    /// Advances the timer past a completed pop.
    pub fn advance(&mut self) {
        self.sequence_number += 1;
        self.next_pop_ms += u64::from(self.interval_ms);
    }

    /// How long a tombstone for this timer must be held so that delayed
    /// replications cannot resurrect it.
    #[must_use]
    pub fn tombstone_hold_ms(&self) -> u64 {
        u64::from(self.interval_ms) + u64::from(self.repeat_for_ms)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn timer(interval: u32, repeat_for: u32) -> Timer {
        Timer::create(
            TimerId(1),
            1_000,
            interval,
            repeat_for,
            serde_json::json!({"http": {"uri": "localhost", "opaque": "stuff"}}),
            vec![NodeAddr::new("10.0.0.1:9999"), NodeAddr::new("10.0.0.2:9999")],
            "view-1".to_string(),
        )
    }

    #[test]
    fn one_shot_timer_pops_once() {
        let mut t = timer(100, 100);
        assert_eq!(t.next_pop_ms, 1_100);
        assert!(t.has_more_pops());
        t.advance();
        assert_eq!(t.sequence_number, 1);
        assert!(!t.has_more_pops());
    }

    #[test]
    fn recurring_timer_pops_until_repeat_for_exhausted() {
        let mut t = timer(100, 300);
        let mut pops = 0;
        while t.has_more_pops() {
            t.advance();
            pops += 1;
        }
        assert_eq!(pops, 3);
        assert_eq!(t.next_pop_ms, 1_400);
    }

    #[test]
    fn zero_interval_never_pops() {
        let t = timer(0, 100);
        assert!(!t.has_more_pops());
    }

    #[test]
    fn replica_index_and_primary() {
        let t = timer(100, 100);
        let one = NodeAddr::new("10.0.0.1:9999");
        let two = NodeAddr::new("10.0.0.2:9999");
        let other = NodeAddr::new("10.0.0.9:9999");
        assert_eq!(t.replica_index(&one), Some(0));
        assert_eq!(t.replica_index(&two), Some(1));
        assert_eq!(t.replica_index(&other), None);
        assert!(t.is_primary(&one));
        assert!(!t.is_primary(&two));
    }
}
