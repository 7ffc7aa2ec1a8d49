//! Administrative operations on a Redis cluster.

use std::time::Duration;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use super::cluster_infos::ClusterInfos;
use super::node::Node;
use super::slot::Slot;
use crate::error::RedisError;

/// Administrative protocol used by the reconcile phases.
///
/// Implementations route every command through a per-node connection pool; a
/// node removed from the pool receives no further commands.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Admin: Send + Sync {
    /// Query every pooled node and assemble a snapshot.
    ///
    /// Unreachable nodes make the snapshot `Partial` rather than failing the call;
    /// an error means no node could be queried at all.
    async fn cluster_infos(&self) -> Result<ClusterInfos, RedisError>;

    /// Ask every pooled node to meet the node at `addr`.
    async fn attach_node_to_cluster(&self, addr: &str) -> Result<(), RedisError>;

    /// Make `slave` replicate `master`. No-op if it already does.
    async fn attach_slave_to_master(&self, slave: &Node, master: &Node) -> Result<(), RedisError>;

    /// Assign unowned slots to the master at `addr`.
    async fn add_slots(&self, addr: &str, slots: &[Slot]) -> Result<(), RedisError>;

    /// Move `slots`, keys included, from `source` to `target`.
    async fn migrate_slots(
        &self,
        source: &Node,
        target: &Node,
        slots: &[Slot],
    ) -> Result<(), RedisError>;

    /// Remove node `id` from the membership table of every other pooled node.
    async fn forget_node(&self, id: &str) -> Result<(), RedisError>;

    /// Open a pooled connection to `addr` if there is none yet.
    async fn add_node_connection(&self, addr: &str) -> Result<(), RedisError>;

    /// Close the pooled connection to `addr`, waiting for an in-flight command to finish.
    async fn remove_node_connection(&self, addr: &str);
}

/// Tunables of the administrative client.
#[derive(Debug, Clone)]
pub struct AdminOptions {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// `AUTH` password; never logged.
    pub password: Option<String>,
    /// Keys fetched per `GETKEYSINSLOT` during migration.
    pub migrate_batch: usize,
    /// `MIGRATE` timeout in milliseconds.
    pub migrate_timeout_millis: u64,
}

impl Default for AdminOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_secs(10),
            password: None,
            migrate_batch: 100,
            migrate_timeout_millis: 30_000,
        }
    }
}
