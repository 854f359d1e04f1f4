//! The scale/resynchronization subsystem.
//!
//! When the cluster view changes, every node pulls the timers it should now
//! replicate from each current member, installs the ones it is most
//! responsible for, pushes copies down the new replica lists, tombstones
//! nodes that dropped off, and tells everyone involved to drop their old
//! references. The peers all compute the same placements from the same
//! pure assignment function, so the per-timer work is commutative no matter
//! which peer reports a timer first.

/// HTTP client for the peer resync API.
pub mod client;
/// Orchestration of a resync run.
pub mod coordinator;
/// Wire format of resync pages and reference batches.
pub mod wire;
