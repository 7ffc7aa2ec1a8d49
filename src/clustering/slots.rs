//! Hash slot allocation and movement planning.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use super::TopologyContext;
use crate::error::{Error, Result};
use crate::redisutil::{Admin, Node, Slot, SlotRange, HASH_SLOTS};

/// One batch of slots changing owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotMove {
    /// Current owner; `None` for slots nobody owns yet.
    pub from: Option<String>,
    pub to: String,
    pub slots: Vec<Slot>,
}

/// Split the slot space into `masters` contiguous ranges whose sizes differ by
/// at most one. Larger ranges come first.
pub fn split_slot_space(masters: usize) -> Result<Vec<SlotRange>> {
    if masters == 0 || masters > HASH_SLOTS as usize {
        return Err(Error::topology(format!(
            "cannot split {} slots over {} masters",
            HASH_SLOTS, masters
        )));
    }
    let total = HASH_SLOTS as usize;
    let base = total / masters;
    let extra = total % masters;

    let mut start = 0usize;
    Ok((0..masters)
        .map(|i| {
            let len = if i < extra { base + 1 } else { base };
            let range = SlotRange::new(start as Slot, (start + len - 1) as Slot);
            start += len;
            range
        })
        .collect())
}

/// Plan the moves that leave every target with an even share of the slot space
/// and every other holder with nothing.
///
/// `holders` lists current owners and their slots; `targets` the ids that must
/// end up owning everything. Slots owned by nobody are handed out as well. The
/// shares that round up go to the targets already holding the most, which keeps
/// movement to a minimum.
pub fn plan_slot_moves(
    holders: &[(String, BTreeSet<Slot>)],
    targets: &[String],
) -> Result<Vec<SlotMove>> {
    if targets.is_empty() {
        return Err(Error::topology("no target master to own slots"));
    }
    let total = HASH_SLOTS as usize;
    let base = total / targets.len();
    let extra = total % targets.len();

    let mut owner: BTreeMap<Slot, &str> = BTreeMap::new();
    for (id, slots) in holders {
        for &slot in slots {
            if let Some(other) = owner.insert(slot, id.as_str()) {
                return Err(Error::topology(format!(
                    "slot {} is owned by both {} and {}",
                    slot, other, id
                )));
            }
        }
    }
    let holding = |id: &str| {
        holders
            .iter()
            .find(|(h, _)| h == id)
            .map_or(0, |(_, slots)| slots.len())
    };

    // Targets ordered by current holding, largest first, get the rounded-up shares.
    let mut by_holding: Vec<usize> = (0..targets.len()).collect();
    by_holding.sort_by_key(|&i| std::cmp::Reverse(holding(&targets[i])));
    let mut desired = vec![base; targets.len()];
    for &i in by_holding.iter().take(extra) {
        desired[i] += 1;
    }

    // Slots to hand out: unowned first, then everything over a holder's share.
    let mut pool: Vec<(Option<&str>, Slot)> = (0..HASH_SLOTS)
        .filter(|s| !owner.contains_key(s))
        .map(|s| (None, s))
        .collect();
    for (id, slots) in holders {
        let keep = targets
            .iter()
            .position(|t| t == id)
            .map_or(0, |i| desired[i]);
        pool.extend(slots.iter().skip(keep).map(|&s| (Some(id.as_str()), s)));
    }

    let mut moves: Vec<SlotMove> = Vec::new();
    let mut pool = pool.into_iter();
    for (i, target) in targets.iter().enumerate() {
        let deficit = desired[i].saturating_sub(holding(target));
        for (from, slot) in pool.by_ref().take(deficit) {
            match moves.last_mut() {
                Some(last) if last.from.as_deref() == from && &last.to == target => {
                    last.slots.push(slot)
                }
                _ => moves.push(SlotMove {
                    from: from.map(str::to_string),
                    to: target.clone(),
                    slots: vec![slot],
                }),
            }
        }
    }
    Ok(moves)
}

impl TopologyContext {
    /// Give every master of `masters` a contiguous, even share of the slot space.
    ///
    /// Used when the cluster has no slot owner yet. With three masters the
    /// shares are 5462, 5461 and 5461 slots.
    pub async fn alloc_slots(&mut self, admin: &dyn Admin, masters: &[Node]) -> Result<()> {
        let ranges = split_slot_space(masters.len())?;
        for (master, range) in masters.iter().zip(ranges) {
            let slots: Vec<Slot> = range.iter().collect();
            info!(master = %master.ip_port(), slots = %range, "Allocating slots");
            admin.add_slots(&master.ip_port(), &slots).await?;
            self.move_slots_locally(None, &master.id, &slots);
        }
        Ok(())
    }

    /// Spread the slots of the current masters evenly over `new_masters`,
    /// a superset of them.
    pub async fn rebalance_cluster(&mut self, admin: &dyn Admin, new_masters: &[Node]) -> Result<()> {
        let current = self.current_masters();
        if let Some(missing) = current
            .iter()
            .find(|c| !new_masters.iter().any(|m| m.id == c.id))
        {
            return Err(Error::topology(format!(
                "rebalance would drop slot owner {}",
                missing.id
            )));
        }
        info!(
            cluster = %self.cluster_name,
            from = current.len(),
            to = new_masters.len(),
            "Rebalancing slots"
        );
        self.apply_slot_plan(admin, new_masters).await
    }

    /// Move every slot owned outside `new_masters` onto them, leaving each with
    /// an even share. `current_masters` are the present owners and
    /// `all_masters` every master node known to the cluster.
    pub async fn dispatch_slots_to_new_masters(
        &mut self,
        admin: &dyn Admin,
        new_masters: &[Node],
        current_masters: &[Node],
        all_masters: &[Node],
    ) -> Result<()> {
        let retiring: Vec<&str> = current_masters
            .iter()
            .chain(all_masters)
            .filter(|m| m.has_slots() && !new_masters.iter().any(|n| n.id == m.id))
            .map(|m| m.id.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        info!(
            cluster = %self.cluster_name,
            retiring = ?retiring,
            targets = new_masters.len(),
            "Dispatching slots to new masters"
        );
        self.apply_slot_plan(admin, new_masters).await
    }

    async fn apply_slot_plan(&mut self, admin: &dyn Admin, targets: &[Node]) -> Result<()> {
        let holders = self.slot_holders();
        let target_ids: Vec<String> = targets.iter().map(|t| t.id.clone()).collect();
        let moves = plan_slot_moves(&holders, &target_ids)?;

        for mv in moves {
            let to = self.node(&mv.to)?;
            match &mv.from {
                None => {
                    debug!(to = %to.ip_port(), count = mv.slots.len(), "Adding unowned slots");
                    admin.add_slots(&to.ip_port(), &mv.slots).await?;
                }
                Some(from) => {
                    let from = self.node(from)?;
                    admin.migrate_slots(&from, &to, &mv.slots).await?;
                }
            }
            self.move_slots_locally(mv.from.as_deref(), &mv.to, &mv.slots);
        }
        Ok(())
    }

    pub(super) fn node(&self, id: &str) -> Result<Node> {
        self.nodes
            .get(id)
            .cloned()
            .ok_or_else(|| Error::topology(format!("unknown node {}", id)))
    }
}
