//! Prometheus metrics for the Redis cluster operator

use std::net::SocketAddr;

use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec, TextEncoder,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::info;

lazy_static::lazy_static! {
    /// Total reconciliations
    pub static ref RECONCILIATIONS: CounterVec = register_counter_vec!(
        "redis_operator_reconciliations_total",
        "Total number of reconciliations",
        &["cluster", "result"]
    ).expect("register reconciliations counter");

    /// Reconciliation duration
    pub static ref RECONCILIATION_DURATION: HistogramVec = register_histogram_vec!(
        "redis_operator_reconciliation_duration_seconds",
        "Duration of reconciliations",
        &["cluster"]
    ).expect("register reconciliation histogram");

    /// Reconcile failures by error kind and step
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "redis_operator_errors_total",
        "Total number of reconcile errors",
        &["kind", "step"]
    ).expect("register errors counter");

    /// Masters owning slots, per cluster
    pub static ref MASTERS: GaugeVec = register_gauge_vec!(
        "redis_operator_cluster_masters",
        "Number of masters owning slots",
        &["namespace", "cluster"]
    ).expect("register masters gauge");

    /// Topology actions taken by sync
    pub static ref TOPOLOGY_ACTIONS: CounterVec = register_counter_vec!(
        "redis_operator_topology_actions_total",
        "Topology changes applied to clusters",
        &["cluster", "action"]
    ).expect("register topology actions counter");
}

/// Serve the registry on `port` until the process exits.
pub async fn run_metrics_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "Metrics server started");

    loop {
        if let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;

                let metrics = encode();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
                    metrics.len(),
                    metrics
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    }
}

/// Text exposition of every registered metric.
pub fn encode() -> String {
    TextEncoder::new()
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}

pub fn record_reconciliation_success(cluster: &str, duration_secs: f64) {
    RECONCILIATIONS.with_label_values(&[cluster, "success"]).inc();
    RECONCILIATION_DURATION
        .with_label_values(&[cluster])
        .observe(duration_secs);
}

pub fn record_reconciliation_failure(cluster: &str, duration_secs: f64) {
    RECONCILIATIONS.with_label_values(&[cluster, "failure"]).inc();
    RECONCILIATION_DURATION
        .with_label_values(&[cluster])
        .observe(duration_secs);
}

pub fn record_error(kind: &str, step: &str) {
    ERRORS.with_label_values(&[kind, step]).inc();
}

pub fn record_topology_action(cluster: &str, action: &str) {
    TOPOLOGY_ACTIONS.with_label_values(&[cluster, action]).inc();
}

pub fn set_masters(namespace: &str, cluster: &str, count: usize) {
    MASTERS
        .with_label_values(&[namespace, cluster])
        .set(count as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_exposed() {
        record_reconciliation_success("metrics-test", 0.5);
        record_error("requeue", "CheckRedisNodeNum");
        set_masters("default", "metrics-test", 3);

        let text = encode();
        assert!(text.contains("redis_operator_reconciliations_total"));
        assert!(text.contains(r#"step="CheckRedisNodeNum""#));
        assert!(text.contains("redis_operator_cluster_masters"));
    }
}
