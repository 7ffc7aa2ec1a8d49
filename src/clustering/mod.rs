//! Topology planning: which nodes are masters, where replicas go and how the
//! hash slots are spread over the masters.
//!
//! A [`TopologyContext`] lives for one reconcile tick. It is built from a fresh
//! [`ClusterInfos`] snapshot plus the nodes of every group (one StatefulSet per
//! master), computes a plan and applies it through an [`Admin`]. Applied steps
//! are mirrored into the context so later steps of the same tick see their effect.
//!
//! [`Admin`]: crate::redisutil::Admin

mod placement;
mod slots;

pub use placement::Placement;
pub use slots::{plan_slot_moves, split_slot_space, SlotMove};

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::redisutil::{ClusterInfos, Node, Nodes};

/// Plan state for one reconcile tick.
#[derive(Debug, Clone)]
pub struct TopologyContext {
    cluster_name: String,
    expected_masters: usize,
    replicas: usize,
    /// Every known node, by id.
    nodes: BTreeMap<String, Node>,
    /// Group ordinal of each node backed by a known pod.
    group_of: BTreeMap<String, usize>,
    current_masters: Vec<String>,
    /// New master of each group ordinal below `expected_masters`.
    new_masters: BTreeMap<usize, String>,
    placements: Vec<Placement>,
}

impl TopologyContext {
    /// `groups` maps a group ordinal to the nodes running in that group's pods.
    pub fn new(
        cluster_name: impl Into<String>,
        infos: &ClusterInfos,
        groups: &BTreeMap<usize, Nodes>,
        expected_masters: usize,
        replicas: usize,
    ) -> Self {
        let mut nodes: BTreeMap<String, Node> =
            infos.nodes().into_iter().map(|n| (n.id.clone(), n)).collect();
        let mut group_of = BTreeMap::new();
        for (&ordinal, members) in groups {
            for node in members {
                group_of.insert(node.id.clone(), ordinal);
                nodes.entry(node.id.clone()).or_insert_with(|| node.clone()).pod_name =
                    node.pod_name.clone();
            }
        }

        Self {
            cluster_name: cluster_name.into(),
            expected_masters,
            replicas,
            nodes,
            group_of,
            current_masters: Vec::new(),
            new_masters: BTreeMap::new(),
            placements: Vec::new(),
        }
    }

    /// Masters that currently own slots, by group ordinal.
    pub fn current_masters(&self) -> Nodes {
        self.collect(&self.current_masters)
    }

    /// Target master set, one per group below the expected master count.
    pub fn new_masters(&self) -> Nodes {
        let ids: Vec<String> = self.new_masters.values().cloned().collect();
        self.collect(&ids)
    }

    /// Nodes of every group, reflecting the steps applied so far.
    pub fn group_nodes(&self) -> BTreeMap<usize, Nodes> {
        let mut groups: BTreeMap<usize, Nodes> = BTreeMap::new();
        for id in self.sorted_ids(self.nodes.keys()) {
            if let Some(&ordinal) = self.group_of.get(&id) {
                groups.entry(ordinal).or_default().push(self.nodes[&id].clone());
            }
        }
        groups
    }

    pub fn group_of(&self, node_id: &str) -> Option<usize> {
        self.group_of.get(node_id).copied()
    }

    fn collect(&self, ids: &[String]) -> Nodes {
        ids.iter().filter_map(|id| self.nodes.get(id)).cloned().collect()
    }

    /// Deterministic ordering: group ordinal, then pod name, then address, then id.
    fn sorted_ids<'a>(&self, ids: impl Iterator<Item = &'a String>) -> Vec<String> {
        let mut ids: Vec<String> = ids.cloned().collect();
        ids.sort_by_key(|id| {
            let node = &self.nodes[id];
            (
                self.group_of.get(id).copied().unwrap_or(usize::MAX),
                node.pod_name.clone().unwrap_or_default(),
                node.ip_port(),
                node.id.clone(),
            )
        });
        ids
    }

    /// Split the known nodes into the current master set and the target master set.
    ///
    /// Existing slot-owning masters keep their role; a group without one gets
    /// its first slot-less master as the new master. Running this twice on the
    /// same input yields the same split.
    pub fn dispatch_masters(&mut self) -> Result<()> {
        let owners = self
            .nodes
            .values()
            .filter(|n| n.is_master() && n.has_slots())
            .map(|n| &n.id);
        self.current_masters = self.sorted_ids(owners);

        let mut new_masters = BTreeMap::new();
        for ordinal in 0..self.expected_masters {
            let members = self.sorted_ids(
                self.group_of
                    .iter()
                    .filter(|(_, &g)| g == ordinal)
                    .map(|(id, _)| id),
            );
            if members.is_empty() {
                return Err(Error::topology(format!(
                    "group {} of cluster {} has no redis node",
                    ordinal, self.cluster_name
                )));
            }

            let with_slots = members
                .iter()
                .find(|id| self.nodes[*id].is_master() && self.nodes[*id].has_slots());
            let empty_master = members
                .iter()
                .find(|id| self.nodes[*id].is_master() && self.nodes[*id].master_ref.is_none());
            let Some(master) = with_slots.or(empty_master) else {
                return Err(Error::topology(format!(
                    "group {} of cluster {} has no master candidate",
                    ordinal, self.cluster_name
                )));
            };
            debug!(group = ordinal, node = %master, "Selected master");
            new_masters.insert(ordinal, master.clone());
        }
        self.new_masters = new_masters;

        info!(
            cluster = %self.cluster_name,
            current = self.current_masters.len(),
            target = self.new_masters.len(),
            "Dispatched masters"
        );
        Ok(())
    }

    fn is_new_master(&self, id: &str) -> bool {
        self.new_masters.values().any(|m| m == id)
    }

    /// Mirror a slot ownership change into the plan state.
    fn move_slots_locally(&mut self, from: Option<&str>, to: &str, slots: &[u16]) {
        if let Some(from) = from.and_then(|id| self.nodes.get_mut(id)) {
            for slot in slots {
                from.slots.remove(slot);
            }
        }
        if let Some(to) = self.nodes.get_mut(to) {
            to.slots.extend(slots.iter().copied());
        }
    }

    /// Slot ownership of every master that holds slots or is a target master.
    fn slot_holders(&self) -> Vec<(String, BTreeSet<u16>)> {
        let mut ids = self.current_masters.clone();
        for id in self.new_masters.values() {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids.into_iter()
            .filter_map(|id| self.nodes.get(&id).map(|n| (id, n.slots.clone())))
            .collect()
    }
}
