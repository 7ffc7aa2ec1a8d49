//! Redis Cluster Kubernetes Operator
//!
//! Reconciles DistributedRedisCluster resources into sharded, replicated Redis clusters.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use redis_cluster_operator::config::OperatorConfig;
use redis_cluster_operator::controller::Controller;
use redis_cluster_operator::metrics;
use redis_cluster_operator::redisutil::AdminOptions;

#[derive(Parser, Debug)]
#[command(name = "redis-cluster-operator")]
#[command(about = "Kubernetes Operator for sharded Redis clusters")]
struct Args {
    /// Namespace to watch (empty for all namespaces)
    #[arg(short, long, default_value = "", env = "WATCH_NAMESPACE")]
    namespace: String,

    /// Metrics server port
    #[arg(short, long, default_value = "8080")]
    metrics_port: u16,

    /// Health check port
    #[arg(short = 'H', long, default_value = "8081")]
    health_port: u16,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Operator configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Environment variable holding the Redis AUTH password
    #[arg(long, default_value = "REDIS_PASSWORD")]
    redis_password_env: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &args.config {
        Some(path) => OperatorConfig::from_file(path)?,
        None => OperatorConfig::default(),
    };
    let admin_options = AdminOptions {
        password: std::env::var(&args.redis_password_env)
            .ok()
            .filter(|p| !p.is_empty()),
        ..Default::default()
    };

    info!("Starting Redis Cluster Operator");
    info!(namespace = %args.namespace, "Watching namespace");

    let metrics_handle = tokio::spawn(metrics::run_metrics_server(args.metrics_port));
    let health_handle = tokio::spawn(run_health_server(args.health_port));

    let controller = Controller::new(args.namespace, config, admin_options).await?;
    let controller_handle = tokio::spawn(async move {
        if let Err(e) = controller.run().await {
            error!(error = %e, "Cluster controller error");
        }
    });

    info!("Controller started");

    tokio::select! {
        _ = controller_handle => info!("Cluster controller stopped"),
        res = metrics_handle => match res {
            Ok(Err(e)) => error!(error = %e, "Metrics server failed"),
            _ => info!("Metrics server stopped"),
        },
        res = health_handle => match res {
            Ok(Err(e)) => error!(error = %e, "Health server failed"),
            _ => info!("Health server stopped"),
        },
    }

    Ok(())
}

async fn run_health_server(port: u16) -> std::io::Result<()> {
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(port = %port, "Health server started");

    loop {
        if let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;

                let response = "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    }
}
