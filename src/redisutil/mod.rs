//! Redis cluster administration: runtime topology model, slot helpers, the
//! administrative protocol and its connection pool.

mod admin;
mod client;
mod cluster_infos;
mod connections;
mod node;
pub mod resp;
mod slot;

pub use admin::{Admin, AdminOptions};
#[cfg(test)]
pub use admin::MockAdmin;
pub use client::{RedisAdmin, RespConnection};
pub use cluster_infos::{ClusterInfos, ClusterInfosStatus, NodeInfos};
pub use connections::{AdminConnections, ConnectionHandle};
pub use node::{Node, NodeRole, Nodes};
pub use slot::{format_slots, parse_slot_field, ranges_from_slots, Slot, SlotRange, HASH_SLOTS};
