//! Cluster coordination primitives (view, placement, configuration).

/// Deterministic replica placement via rendezvous hashing.
pub mod assignment;
/// Cluster and resync configuration schema.
pub mod config;
/// Error types surfaced by cluster subsystems.
pub mod error;
/// Current/leaving/joining node sets with a monotonic view id.
pub mod view;

pub use assignment::replicas_for;
pub use config::{ClusterConfig, ResyncConfig};
pub use error::ClusterError;
pub use view::{ClusterView, ViewSnapshot};
