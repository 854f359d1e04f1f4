use thiserror::Error;

use crate::timer::NodeAddr;

/// Errors raised while validating or applying cluster state.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A node address appears in more than one of the staying, leaving, and
    /// joining sets.
    #[error("node {node} appears in more than one cluster set")]
    OverlappingSets {
        /// The duplicated address.
        node: NodeAddr,
    },
    /// The local node is neither staying nor joining.
    #[error("local node {local} is not a member of the staying or joining sets")]
    LocalNotMember {
        /// The configured local address.
        local: NodeAddr,
    },
    /// The view id is empty or contains non-printable characters.
    #[error("invalid cluster view id {view_id:?}")]
    InvalidViewId {
        /// The rejected view id.
        view_id: String,
    },
    /// Generic configuration issue preventing the cluster view from being
    /// built.
    #[error("cluster configuration error: {0}")]
    Configuration(String),
}
