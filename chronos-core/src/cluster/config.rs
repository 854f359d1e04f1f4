use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::timer::NodeAddr;

/// Cluster membership as loaded from configuration.
///
/// `nodes` is the full current membership (staying plus leaving);
/// `leaving` and `joining` carve out the nodes involved in an in-flight
/// scale event. The view id may be pinned for tests; when empty, a stable
/// token is derived from the sorted sets so that all nodes sharing a
/// configuration agree without coordination.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClusterConfig {
    /// Address of the local process.
    pub localhost: String,
    /// Current members, including any that are leaving.
    pub nodes: Vec<String>,
    /// Members being scaled out.
    pub leaving: Vec<String>,
    /// Nodes being scaled in.
    pub joining: Vec<String>,
    /// Pinned view id; derived from the sets when empty.
    pub view_id: String,
    /// Replicas per timer, primary included.
    pub replica_factor: usize,
}

impl ClusterConfig {
    /// Default replica factor applied when the configuration omits one.
    pub const DEFAULT_REPLICA_FACTOR: usize = 2;

    /// Effective replica factor (never zero).
    #[must_use]
    pub fn effective_replica_factor(&self) -> usize {
        if self.replica_factor == 0 {
            Self::DEFAULT_REPLICA_FACTOR
        } else {
            self.replica_factor
        }
    }

    /// The view id to run under: the pinned one, or a token derived from
    /// the sorted membership sets.
    #[must_use]
    pub fn effective_view_id(&self) -> String {
        if !self.view_id.is_empty() {
            return self.view_id.clone();
        }
        let mut staying: Vec<&String> = self
            .nodes
            .iter()
            .filter(|n| !self.leaving.contains(n))
            .collect();
        staying.sort();
        let mut leaving: Vec<&String> = self.leaving.iter().collect();
        leaving.sort();
        let mut joining: Vec<&String> = self.joining.iter().collect();
        joining.sort();

        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for section in [&staying, &leaving, &joining] {
            for node in section {
                for byte in node.as_bytes() {
                    hash ^= u64::from(*byte);
                    hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
                }
                hash ^= 0x7c;
            }
            hash ^= 0x3b;
        }
        format!("{hash:016x}")
    }

    /// Staying members (`nodes` minus `leaving`) as addresses.
    #[must_use]
    pub fn staying_addrs(&self) -> Vec<NodeAddr> {
        self.nodes
            .iter()
            .filter(|n| !self.leaving.contains(n))
            .map(NodeAddr::new)
            .collect()
    }

    /// Leaving members as addresses.
    #[must_use]
    pub fn leaving_addrs(&self) -> Vec<NodeAddr> {
        self.leaving.iter().map(NodeAddr::new).collect()
    }

    /// Joining nodes as addresses.
    #[must_use]
    pub fn joining_addrs(&self) -> Vec<NodeAddr> {
        self.joining.iter().map(NodeAddr::new).collect()
    }
}

/// Tuning knobs for the resync subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResyncConfig {
    /// Per-request timeout for peer HTTP calls.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Maximum timers a peer may return per page.
    pub max_timers_in_response: usize,
    /// Extra attempts for retryable peer failures.
    pub retries: usize,
    /// Pause between retry attempts.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            max_timers_in_response: 100,
            retries: 2,
            retry_delay: Duration::from_millis(200),
        }
    }
}
