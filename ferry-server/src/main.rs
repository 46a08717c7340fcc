//! Ferry proxy server binary.
//!
//! Wires the connection pool, dispatcher, and accept loop together, loads
//! the initial slot table from the startup nodes, and serves until ctrl-c.

#![deny(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ferry_proxy::{ConnPool, Dispatcher, Proxy, ProxyConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Ferry - clustered key-value protocol proxy.
#[derive(Parser, Debug)]
#[command(name = "ferry")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on for client connections.
    #[arg(long, default_value = "7600")]
    port: u16,

    /// Cluster nodes queried for the topology, comma separated.
    #[arg(long, value_delimiter = ',', required = true)]
    startup_nodes: Vec<String>,

    /// Seconds an idle client connection is kept open.
    #[arg(long, default_value = "120")]
    client_idle_timeout_secs: u64,

    /// Milliseconds to wait for one backend reply.
    #[arg(long, default_value = "5000")]
    backend_read_timeout_ms: u64,

    /// Minimum milliseconds between topology reloads.
    #[arg(long, default_value = "1000")]
    slot_reload_interval_ms: u64,

    /// Persistent connections per backend.
    #[arg(long, default_value = "2")]
    backend_connections: usize,

    /// Idle connections kept per backend in the pool.
    #[arg(long, default_value = "8")]
    pool_max_idle: usize,

    /// Milliseconds allowed for dialing a backend.
    #[arg(long, default_value = "1000")]
    pool_dial_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let startup_nodes = args
        .startup_nodes
        .iter()
        .map(|node| Arc::from(node.as_str()))
        .collect();
    let config = ProxyConfig::new(args.port, startup_nodes)
        .with_client_idle_timeout(Duration::from_secs(args.client_idle_timeout_secs))
        .with_backend_read_timeout(Duration::from_millis(args.backend_read_timeout_ms))
        .with_slot_reload_interval(Duration::from_millis(args.slot_reload_interval_ms))
        .with_backend_connections(args.backend_connections);
    config.validate()?;
    let config = Arc::new(config);

    info!(
        port = config.port,
        nodes = args.startup_nodes.len(),
        "starting ferry proxy"
    );

    let pool = ConnPool::new(
        args.pool_max_idle,
        Duration::from_millis(args.pool_dial_timeout_ms),
    );
    let (dispatcher, handle) = Dispatcher::new(Arc::clone(&config), pool);
    dispatcher.init_slot_table().await?;
    tokio::spawn(dispatcher.run());

    let proxy = Proxy::new(config, handle);
    let shutdown = proxy.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.notify_one();
        }
    });

    proxy.run().await?;
    Ok(())
}
