//! Deterministic replica placement.
//!
//! Every node must compute the same ordered replica list for a timer given
//! the same node set, with no coordination. Rendezvous (highest random
//! weight) hashing gives that, plus the property that adding or removing
//! one node only disturbs the placements that involved it.

use crate::timer::{NodeAddr, TimerId};

/// Ordered replica list for `id` drawn from `nodes`.
///
/// Pure and total over any node set: repeated calls return the same list,
/// and the list length is `min(count, distinct nodes)`. Index 0 is the
/// primary. Duplicate addresses in `nodes` are ignored.
#[must_use]
pub fn replicas_for(id: TimerId, nodes: &[NodeAddr], count: usize) -> Vec<NodeAddr> {
    let mut scored: Vec<(u64, &NodeAddr)> = nodes
        .iter()
        .map(|node| (rendezvous_score(id, node), node))
        .collect();
    // Tie-break on the address so equal scores cannot reorder across runs.
    scored.sort_by(|(score_a, node_a), (score_b, node_b)| {
        score_b.cmp(score_a).then_with(|| node_a.cmp(node_b))
    });
    scored.dedup_by(|(_, a), (_, b)| a == b);

    let mut replicas = Vec::with_capacity(count.min(scored.len()));
    for (_, node) in scored {
        if replicas.contains(node) {
            continue;
        }
        replicas.push(node.clone());
        if replicas.len() == count {
            break;
        }
    }
    replicas
}

fn rendezvous_score(id: TimerId, node: &NodeAddr) -> u64 {
    let mut hash = id.0 ^ 0x9e37_79b9_7f4a_7c15;
    for byte in node.as_str().as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0xff51_afd7_ed55_8ccd);
        hash ^= hash >> 33;
    }
    hash.wrapping_mul(0xc4ce_b9fe_1a85_ec53)
}
