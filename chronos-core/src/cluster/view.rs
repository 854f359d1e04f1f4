use parking_lot::RwLock;

use crate::cluster::error::ClusterError;
use crate::timer::NodeAddr;

/// Immutable capture of the cluster membership at a point in time.
///
/// Every resync run takes one snapshot at entry and uses it throughout; a
/// view change mid-run does not abort the run, it just triggers another
/// resync with the newer snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewSnapshot {
    /// Nodes that are members now and will remain members.
    pub staying: Vec<NodeAddr>,
    /// Nodes that are members now but are being scaled out.
    pub leaving: Vec<NodeAddr>,
    /// Nodes that are not members yet but are being scaled in.
    pub joining: Vec<NodeAddr>,
    /// Opaque token naming this membership; changes whenever the sets do.
    pub view_id: String,
    /// Address of the local node.
    pub local: NodeAddr,
}

impl ViewSnapshot {
    /// Nodes holding timers today: `staying ∪ leaving`, sorted and deduped.
    /// These are the targets resync pulls timers from.
    #[must_use]
    pub fn all_current_nodes(&self) -> Vec<NodeAddr> {
        Self::sorted_union(&self.staying, &self.leaving)
    }

    /// Nodes that will hold timers after the scale event:
    /// `staying ∪ joining`, sorted and deduped. Replica lists for the new
    /// view are computed over this set.
    #[must_use]
    pub fn all_post_scale_nodes(&self) -> Vec<NodeAddr> {
        Self::sorted_union(&self.staying, &self.joining)
    }

    fn sorted_union(a: &[NodeAddr], b: &[NodeAddr]) -> Vec<NodeAddr> {
        let mut nodes: Vec<NodeAddr> = a.iter().chain(b.iter()).cloned().collect();
        nodes.sort();
        nodes.dedup();
        nodes
    }

    fn validate(&self) -> Result<(), ClusterError> {
        if self.view_id.is_empty() || !self.view_id.chars().all(|c| c.is_ascii_graphic()) {
            return Err(ClusterError::InvalidViewId {
                view_id: self.view_id.clone(),
            });
        }
        for node in &self.staying {
            if self.leaving.contains(node) || self.joining.contains(node) {
                return Err(ClusterError::OverlappingSets { node: node.clone() });
            }
        }
        for node in &self.leaving {
            if self.joining.contains(node) {
                return Err(ClusterError::OverlappingSets { node: node.clone() });
            }
        }
        if !self.staying.contains(&self.local) && !self.joining.contains(&self.local) {
            return Err(ClusterError::LocalNotMember {
                local: self.local.clone(),
            });
        }
        Ok(())
    }
}

/// Process-wide cluster membership handle.
///
/// Read-mostly: the only writer is the configuration (re)load path, which
/// replaces the whole snapshot atomically. Readers never observe a
/// half-applied change.
pub struct ClusterView {
    inner: RwLock<ViewSnapshot>,
}

impl ClusterView {
    /// Builds a view from an initial snapshot, validating set disjointness
    /// and local membership.
    pub fn new(snapshot: ViewSnapshot) -> Result<Self, ClusterError> {
        snapshot.validate()?;
        Ok(Self {
            inner: RwLock::new(snapshot),
        })
    }

    /// Returns a copy of the current membership.
    #[must_use]
    pub fn snapshot(&self) -> ViewSnapshot {
        self.inner.read().clone()
    }

    /// The current view id.
    #[must_use]
    pub fn view_id(&self) -> String {
        self.inner.read().view_id.clone()
    }

    /// The local node address.
    #[must_use]
    pub fn local(&self) -> NodeAddr {
        self.inner.read().local.clone()
    }

    /// Replaces the membership with a new validated snapshot. The local
    /// address cannot change across reloads.
    pub fn apply(&self, snapshot: ViewSnapshot) -> Result<(), ClusterError> {
        snapshot.validate()?;
        let mut inner = self.inner.write();
        if snapshot.local != inner.local {
            return Err(ClusterError::Configuration(format!(
                "local address cannot change across reloads ({} -> {})",
                inner.local, snapshot.local
            )));
        }
        *inner = snapshot;
        Ok(())
    }
}
