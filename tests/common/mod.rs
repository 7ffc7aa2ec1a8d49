//! Common test utilities for integration tests.

pub mod fake_redis;
pub mod fixtures;

use redis_cluster_operator::redisutil::Admin;
use redis_cluster_operator::sync::PodEndpoint;

pub use fake_redis::*;
pub use fixtures::*;

/// Open pooled connections to every pod, as the controller does before a tick.
pub async fn connect_all(admin: &dyn Admin, pods: &[PodEndpoint]) {
    for pod in pods {
        admin.add_node_connection(&pod.addr()).await.unwrap();
    }
}
