//! Point-in-time snapshot of the cluster as seen by every node.

use std::collections::{BTreeMap, BTreeSet};

use super::node::{Node, Nodes};
use super::slot::Slot;
use crate::error::RedisError;

/// What one node reports: itself plus every peer it knows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfos {
    pub node: Node,
    pub friends: Nodes,
}

impl NodeInfos {
    /// Parse the full `CLUSTER NODES` reply of one node.
    pub fn parse(raw: &str) -> Result<Self, RedisError> {
        let mut myself = None;
        let mut friends = Vec::new();
        for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let node = Node::from_cluster_nodes_line(line)?;
            if node.is_myself() && myself.is_none() {
                myself = Some(node);
            } else {
                friends.push(node);
            }
        }
        let node = myself.ok_or_else(|| {
            RedisError::Protocol("CLUSTER NODES reply has no 'myself' entry".to_string())
        })?;
        Ok(Self { node, friends })
    }

    /// Membership and slot ownership as this node believes it to be.
    fn view(&self) -> BTreeMap<String, BTreeSet<Slot>> {
        std::iter::once(&self.node)
            .chain(self.friends.iter())
            .map(|n| {
                let slots = if n.is_master() { n.slots.clone() } else { BTreeSet::new() };
                (n.id.clone(), slots)
            })
            .collect()
    }
}

/// Agreement between the per-node views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterInfosStatus {
    /// Every node answered and all agree on membership and slot ownership.
    Consistent,
    /// Every node answered but views differ (not joined yet, or still propagating).
    Inconsistent,
    /// At least one node could not be queried.
    Partial,
}

/// Snapshot of every reachable node, keyed by `ip:port`.
///
/// Rebuilt on every reconcile tick and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfos {
    pub infos: BTreeMap<String, NodeInfos>,
    pub status: ClusterInfosStatus,
}

impl Default for ClusterInfos {
    fn default() -> Self {
        Self {
            infos: BTreeMap::new(),
            status: ClusterInfosStatus::Partial,
        }
    }
}

impl ClusterInfos {
    /// Build a snapshot from the views that were collected; `unreachable` counts
    /// the nodes that did not answer.
    pub fn from_views(infos: BTreeMap<String, NodeInfos>, unreachable: usize) -> Self {
        let mut snapshot = Self {
            infos,
            status: ClusterInfosStatus::Partial,
        };
        snapshot.status = if unreachable > 0 || snapshot.infos.is_empty() {
            ClusterInfosStatus::Partial
        } else {
            snapshot.compute_status()
        };
        snapshot
    }

    fn compute_status(&self) -> ClusterInfosStatus {
        let mut views = self.infos.values().map(NodeInfos::view);
        let Some(first) = views.next() else {
            return ClusterInfosStatus::Partial;
        };
        if views.all(|v| v == first) {
            ClusterInfosStatus::Consistent
        } else {
            ClusterInfosStatus::Inconsistent
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.status == ClusterInfosStatus::Consistent
    }

    /// Fails with [`RedisError::Inconsistent`] unless all nodes agree.
    pub fn ensure_consistent(&self) -> Result<(), RedisError> {
        match self.status {
            ClusterInfosStatus::Consistent => Ok(()),
            ClusterInfosStatus::Inconsistent => Err(RedisError::Inconsistent(
                "nodes disagree about cluster membership or slot ownership".to_string(),
            )),
            ClusterInfosStatus::Partial => Err(RedisError::Inconsistent(
                "not every node could be queried".to_string(),
            )),
        }
    }

    /// Any node of the snapshot, used as the meeting point when joining.
    pub fn first_node(&self) -> Option<&Node> {
        self.infos.values().next().map(|i| &i.node)
    }

    /// Every node's own view of itself, ordered by address.
    pub fn nodes(&self) -> Nodes {
        self.infos.values().map(|i| i.node.clone()).collect()
    }

    pub fn node_by_ip(&self, ip: &str) -> Option<&Node> {
        self.infos.values().map(|i| &i.node).find(|n| n.ip == ip)
    }

    pub fn node_by_id(&self, id: &str) -> Option<&Node> {
        self.infos.values().map(|i| &i.node).find(|n| n.id == id)
    }

    pub fn masters_with_slots(&self) -> Nodes {
        self.infos
            .values()
            .map(|i| &i.node)
            .filter(|n| n.is_master() && n.has_slots())
            .cloned()
            .collect()
    }

    fn replicas_per_master(&self) -> Vec<usize> {
        self.masters_with_slots()
            .iter()
            .map(|m| {
                self.infos
                    .values()
                    .filter(|i| i.node.master_ref.as_deref() == Some(m.id.as_str()))
                    .count()
            })
            .collect()
    }

    /// Fewest replicas attached to any slot-owning master (0 without masters).
    pub fn min_replication_factor(&self) -> i32 {
        self.replicas_per_master().into_iter().min().unwrap_or(0) as i32
    }

    pub fn max_replication_factor(&self) -> i32 {
        self.replicas_per_master().into_iter().max().unwrap_or(0) as i32
    }

    /// Number of slots owned by some master.
    pub fn assigned_slots(&self) -> usize {
        self.masters_with_slots()
            .iter()
            .flat_map(|m| m.slots.iter().copied())
            .collect::<BTreeSet<_>>()
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: &str = "aaaa 10.0.0.1:6379@16379 myself,master - 0 0 1 connected 0-8191\n\
                     bbbb 10.0.0.2:6379@16379 master - 0 0 2 connected 8192-16383\n\
                     cccc 10.0.0.3:6379@16379 slave aaaa 0 0 1 connected\n";
    const B: &str = "aaaa 10.0.0.1:6379@16379 master - 0 0 1 connected 0-8191\n\
                     bbbb 10.0.0.2:6379@16379 myself,master - 0 0 2 connected 8192-16383\n\
                     cccc 10.0.0.3:6379@16379 slave aaaa 0 0 1 connected\n";
    const C: &str = "aaaa 10.0.0.1:6379@16379 master - 0 0 1 connected 0-8191\n\
                     bbbb 10.0.0.2:6379@16379 master - 0 0 2 connected 8192-16383\n\
                     cccc 10.0.0.3:6379@16379 myself,slave aaaa 0 0 1 connected\n";

    fn snapshot(views: &[(&str, &str)], unreachable: usize) -> ClusterInfos {
        let infos = views
            .iter()
            .map(|(addr, raw)| (addr.to_string(), NodeInfos::parse(raw).unwrap()))
            .collect();
        ClusterInfos::from_views(infos, unreachable)
    }

    #[test]
    fn test_consistent_snapshot() {
        let infos = snapshot(&[("10.0.0.1:6379", A), ("10.0.0.2:6379", B), ("10.0.0.3:6379", C)], 0);
        assert!(infos.is_consistent());
        assert_eq!(infos.masters_with_slots().len(), 2);
        assert_eq!(infos.assigned_slots(), 16384);
        assert_eq!(infos.min_replication_factor(), 0);
        assert_eq!(infos.max_replication_factor(), 1);
        assert_eq!(infos.node_by_ip("10.0.0.3").unwrap().id, "cccc");
    }

    #[test]
    fn test_unjoined_nodes_are_inconsistent() {
        let lone_a = "aaaa 10.0.0.1:6379@16379 myself,master - 0 0 0 connected\n";
        let lone_b = "bbbb 10.0.0.2:6379@16379 myself,master - 0 0 0 connected\n";
        let infos = snapshot(&[("10.0.0.1:6379", lone_a), ("10.0.0.2:6379", lone_b)], 0);
        assert_eq!(infos.status, ClusterInfosStatus::Inconsistent);
        assert!(infos.ensure_consistent().is_err());
        assert_eq!(infos.first_node().unwrap().id, "aaaa");
    }

    #[test]
    fn test_unreachable_node_makes_partial() {
        let infos = snapshot(&[("10.0.0.1:6379", A)], 1);
        assert_eq!(infos.status, ClusterInfosStatus::Partial);
        assert_eq!(ClusterInfos::default().status, ClusterInfosStatus::Partial);
    }

    #[test]
    fn test_parse_requires_myself() {
        let raw = "aaaa 10.0.0.1:6379@16379 master - 0 0 1 connected\n";
        assert!(NodeInfos::parse(raw).is_err());
    }
}
