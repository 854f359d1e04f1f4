//! Core of the Chronos distributed timer service.
//!
//! Chronos nodes hold replicated timers and fire an HTTP callback when a
//! timer pops. This crate contains the pieces every node shares: the timer
//! model, the cluster view, deterministic replica placement, the in-memory
//! timer store, best-effort replication, and the scale/resynchronization
//! subsystem that moves timers between nodes when the cluster view changes.

/// Injectable millisecond clock.
pub mod clock;
/// Cluster view, replica placement, and cluster configuration.
pub mod cluster;
/// Counter and gauge sinks decoupling the core from any telemetry system.
pub mod metrics;
/// Best-effort timer replication to peer nodes.
pub mod replication;
/// The scale/resynchronization subsystem.
pub mod resync;
/// Next-pop-ordered timer storage.
pub mod store;
/// Timer model and identifiers.
pub mod timer;

pub use clock::{Clock, SystemClock};
pub use cluster::assignment::replicas_for;
pub use cluster::error::ClusterError;
pub use cluster::view::{ClusterView, ViewSnapshot};
pub use metrics::{AtomicCounter, AtomicGauge, CounterSink, GaugeSink};
pub use replication::{HttpReplicator, ReplicationMessage, Replicator};
pub use resync::client::{
    HttpBackend, PeerClient, PeerRequest, PeerResponse, RequestBackend, RequestMethod,
    TransportError,
};
pub use resync::coordinator::{ResyncCoordinator, ResyncStats};
pub use store::{InMemoryTimerStore, TimerStore};
pub use timer::{NodeAddr, Timer, TimerId};
