//! Replica placement over the target masters.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use super::TopologyContext;
use crate::error::{Error, Result};
use crate::redisutil::Admin;

/// A replica to attach and the master it goes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub slave: String,
    pub master: String,
}

impl TopologyContext {
    /// Pick a master for every node that is neither a target master nor
    /// already replicating one.
    ///
    /// A node first goes to the master of its own group while that master is
    /// below the replication factor. Otherwise it goes to the master with the
    /// fewest replicas, preferring one that has no replica from the same group.
    /// Only groups below the expected master count take part; retiring groups
    /// are left alone.
    pub fn place_slaves(&mut self) -> Result<()> {
        if self.new_masters.len() != self.expected_masters {
            return Err(Error::topology("masters must be dispatched before placing replicas"));
        }
        let mut attached: BTreeMap<String, usize> = BTreeMap::new();
        let mut groups_of_master: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();
        for master in self.new_masters.values() {
            attached.insert(master.clone(), 0);
            groups_of_master.insert(master.clone(), BTreeSet::new());
        }
        for (id, node) in &self.nodes {
            if let Some(master) = node.master_ref.as_ref().filter(|m| attached.contains_key(*m)) {
                *attached.entry(master.clone()).or_default() += 1;
                if let Some(&g) = self.group_of.get(id) {
                    groups_of_master.entry(master.clone()).or_default().insert(g);
                }
            }
        }

        let candidates = self.sorted_ids(self.nodes.keys().filter(|id| {
            let node = &self.nodes[*id];
            let in_scope = self
                .group_of
                .get(*id)
                .map_or(false, |&g| g < self.expected_masters);
            let replicating = node
                .master_ref
                .as_ref()
                .map_or(false, |m| attached.contains_key(m));
            in_scope && !self.is_new_master(id) && !replicating
        }));

        let mut placements = Vec::new();
        for id in candidates {
            if self.nodes[&id].has_slots() {
                warn!(node = %id, "Slot owner outside the target master set, not placing it");
                continue;
            }
            let group = self.group_of[&id];
            let own = &self.new_masters[&group];

            let master = if attached[own] < self.replicas {
                own.clone()
            } else {
                let order: Vec<&String> = self.new_masters.values().collect();
                order
                    .into_iter()
                    .min_by_key(|m| {
                        (
                            attached[*m] >= self.replicas,
                            groups_of_master[*m].contains(&group),
                            attached[*m],
                        )
                    })
                    .cloned()
                    .unwrap_or_else(|| own.clone())
            };

            *attached.entry(master.clone()).or_default() += 1;
            groups_of_master.entry(master.clone()).or_default().insert(group);
            placements.push(Placement { slave: id, master });
        }

        info!(
            cluster = %self.cluster_name,
            count = placements.len(),
            "Placed replicas"
        );
        self.placements = placements;
        Ok(())
    }

    /// Placements computed by the last [`place_slaves`](Self::place_slaves).
    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    /// Apply the placements. Replicas already attached to their master are skipped.
    pub async fn attach_slaves_to_master(&mut self, admin: &dyn Admin) -> Result<()> {
        for placement in self.placements.clone() {
            let slave = self.node(&placement.slave)?;
            let master = self.node(&placement.master)?;
            if slave.master_ref.as_deref() == Some(master.id.as_str()) {
                continue;
            }
            admin.attach_slave_to_master(&slave, &master).await?;
            if let Some(node) = self.nodes.get_mut(&placement.slave) {
                node.set_replica_of(&placement.master);
            }
        }
        Ok(())
    }
}
