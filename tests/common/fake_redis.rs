// In-memory Redis cluster for integration tests
// Applies admin commands to a shared node table and serves snapshots of it

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use redis_cluster_operator::error::RedisError;
use redis_cluster_operator::redisutil::{
    Admin, ClusterInfos, Node, NodeInfos, Slot, HASH_SLOTS,
};

pub const CLUSTER: &str = "cache";

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, Node>,
    /// Ids of nodes that joined the cluster.
    members: BTreeSet<String>,
    /// Addresses with an open admin connection.
    pooled: BTreeSet<String>,
    /// Nodes whose outgoing migrations are silently dropped.
    stuck: BTreeSet<String>,
    ops: Vec<String>,
}

/// Simulated cluster of `groups` StatefulSets with `per_group` pods each.
pub struct FakeRedis {
    state: Mutex<State>,
}

pub fn node_id(group: usize, index: usize) -> String {
    format!("node-{}-{}", group, index)
}

impl FakeRedis {
    /// Fresh nodes: all masters, no slots, not joined, not pooled.
    pub fn new(groups: usize, per_group: usize) -> Self {
        let mut state = State::default();
        for g in 0..groups {
            for i in 0..per_group {
                let mut node = Node::new(node_id(g, i), format!("10.1.{}.{}", g, i + 1), 6379);
                node.pod_name = Some(format!("drc-{}-{}-{}", CLUSTER, g, i));
                state.nodes.insert(node.id.clone(), node);
            }
        }
        Self {
            state: Mutex::new(state),
        }
    }

    /// Join every node and split the slot space over the first node of groups `0..masters`.
    pub fn bootstrapped(groups: usize, per_group: usize, masters: usize) -> Self {
        let fake = Self::new(groups, per_group);
        {
            let mut state = fake.state.lock().unwrap();
            let ranges = redis_cluster_operator::clustering::split_slot_space(masters).unwrap();
            for (g, range) in ranges.into_iter().enumerate() {
                let node = state.nodes.get_mut(&node_id(g, 0)).unwrap();
                node.slots.extend(range.start..=range.end);
            }
            state.members = state.nodes.keys().cloned().collect();
        }
        fake
    }

    pub fn attach(&self, replica: &str, master: &str) {
        let mut state = self.state.lock().unwrap();
        state.nodes.get_mut(replica).unwrap().set_replica_of(master);
    }

    pub fn stick(&self, id: &str) {
        self.state.lock().unwrap().stuck.insert(id.to_string());
    }

    pub fn unstick(&self, id: &str) {
        self.state.lock().unwrap().stuck.remove(id);
    }

    /// Reassign every slot of `from` to `to`, as a manual reshard would.
    pub fn hand_over_slots(&self, from: &str, to: &str) {
        let mut state = self.state.lock().unwrap();
        let slots = std::mem::take(&mut state.nodes.get_mut(from).unwrap().slots);
        state.nodes.get_mut(to).unwrap().slots.extend(slots);
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.state.lock().unwrap().nodes.values().cloned().collect()
    }

    pub fn node(&self, id: &str) -> Node {
        self.state.lock().unwrap().nodes[id].clone()
    }

    /// Slot-owning masters that are still cluster members, by id.
    pub fn masters(&self) -> Vec<Node> {
        let state = self.state.lock().unwrap();
        state
            .nodes
            .values()
            .filter(|n| state.members.contains(&n.id) && n.is_master() && n.has_slots())
            .cloned()
            .collect()
    }

    pub fn members(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().members.clone()
    }

    pub fn pooled(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().pooled.clone()
    }

    /// Commands received, e.g. `add_slots 10.1.0.1:6379 5462`.
    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn ops_named(&self, name: &str) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter(|op| op.split(' ').next() == Some(name))
            .collect()
    }

    /// Every slot owned by exactly one member master.
    pub fn assert_slots_covered(&self) {
        let mut seen = BTreeSet::new();
        for master in self.masters() {
            for slot in &master.slots {
                assert!(seen.insert(*slot), "slot {} owned twice", slot);
            }
        }
        assert_eq!(seen.len(), HASH_SLOTS as usize, "slot space not fully assigned");
    }
}

fn id_by_addr(state: &State, addr: &str) -> Result<String, RedisError> {
    state
        .nodes
        .values()
        .find(|n| n.ip_port() == addr)
        .map(|n| n.id.clone())
        .ok_or_else(|| RedisError::UnknownNode(addr.to_string()))
}

fn ensure_pooled(state: &State, addr: &str) -> Result<(), RedisError> {
    if state.pooled.contains(addr) {
        Ok(())
    } else {
        Err(RedisError::NoConnection(addr.to_string()))
    }
}

#[async_trait]
impl Admin for FakeRedis {
    async fn cluster_infos(&self) -> Result<ClusterInfos, RedisError> {
        let state = self.state.lock().unwrap();
        if state.pooled.is_empty() {
            return Err(RedisError::NoConnection("no pooled node".to_string()));
        }
        let mut infos = BTreeMap::new();
        for addr in &state.pooled {
            let id = id_by_addr(&state, addr)?;
            let node = state.nodes[&id].clone();
            let friends = if state.members.contains(&id) {
                state
                    .members
                    .iter()
                    .filter(|m| **m != id)
                    .map(|m| state.nodes[m].clone())
                    .collect()
            } else {
                Vec::new()
            };
            infos.insert(addr.clone(), NodeInfos { node, friends });
        }
        Ok(ClusterInfos::from_views(infos, 0))
    }

    async fn attach_node_to_cluster(&self, addr: &str) -> Result<(), RedisError> {
        let mut state = self.state.lock().unwrap();
        ensure_pooled(&state, addr)?;
        let joined: Vec<String> = state
            .pooled
            .iter()
            .filter_map(|a| id_by_addr(&state, a).ok())
            .collect();
        state.members.extend(joined);
        state.ops.push(format!("meet {}", addr));
        Ok(())
    }

    async fn attach_slave_to_master(&self, slave: &Node, master: &Node) -> Result<(), RedisError> {
        let mut state = self.state.lock().unwrap();
        ensure_pooled(&state, &slave.ip_port())?;
        let node = state
            .nodes
            .get_mut(&slave.id)
            .ok_or_else(|| RedisError::UnknownNode(slave.id.clone()))?;
        if !node.slots.is_empty() {
            return Err(RedisError::Server {
                addr: slave.ip_port(),
                message: "ERR To set a master the node must be empty".to_string(),
            });
        }
        node.set_replica_of(&master.id);
        state.ops.push(format!("replicate {} {}", slave.id, master.id));
        Ok(())
    }

    async fn add_slots(&self, addr: &str, slots: &[Slot]) -> Result<(), RedisError> {
        let mut state = self.state.lock().unwrap();
        ensure_pooled(&state, addr)?;
        let id = id_by_addr(&state, addr)?;
        for slot in slots {
            if let Some(owner) = state.nodes.values().find(|n| n.slots.contains(slot)) {
                return Err(RedisError::Server {
                    addr: addr.to_string(),
                    message: format!("ERR Slot {} is already busy ({})", slot, owner.id),
                });
            }
        }
        state.nodes.get_mut(&id).unwrap().slots.extend(slots.iter().copied());
        state.ops.push(format!("add_slots {} {}", addr, slots.len()));
        Ok(())
    }

    async fn migrate_slots(
        &self,
        source: &Node,
        target: &Node,
        slots: &[Slot],
    ) -> Result<(), RedisError> {
        let mut state = self.state.lock().unwrap();
        ensure_pooled(&state, &source.ip_port())?;
        ensure_pooled(&state, &target.ip_port())?;
        state
            .ops
            .push(format!("migrate {} {} {}", source.id, target.id, slots.len()));
        if state.stuck.contains(&source.id) {
            return Ok(());
        }
        for slot in slots {
            if !state.nodes[&source.id].slots.contains(slot) {
                return Err(RedisError::Server {
                    addr: source.ip_port(),
                    message: format!("ERR I'm not the owner of hash slot {}", slot),
                });
            }
        }
        for slot in slots {
            state.nodes.get_mut(&source.id).unwrap().slots.remove(slot);
            state.nodes.get_mut(&target.id).unwrap().slots.insert(*slot);
        }
        Ok(())
    }

    async fn forget_node(&self, id: &str) -> Result<(), RedisError> {
        let mut state = self.state.lock().unwrap();
        state.members.remove(id);
        state.ops.push(format!("forget {}", id));
        Ok(())
    }

    async fn add_node_connection(&self, addr: &str) -> Result<(), RedisError> {
        let mut state = self.state.lock().unwrap();
        id_by_addr(&state, addr)?;
        state.pooled.insert(addr.to_string());
        Ok(())
    }

    async fn remove_node_connection(&self, addr: &str) {
        self.state.lock().unwrap().pooled.remove(addr);
    }
}
