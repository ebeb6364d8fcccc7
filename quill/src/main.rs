#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use quill::{Agent, Config};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "quill")]
#[command(about = "Distributed, replicated, append-only commit log")]
#[command(version)]
struct Args {
    /// TOML config file; flags below override nothing when this is set.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Unique node name, also the Raft server id.
    #[arg(short, long, default_value = "quill-0")]
    node_name: String,

    /// UDP gossip bind address.
    #[arg(short, long, default_value = "127.0.0.1:8401")]
    bind_addr: SocketAddr,

    /// TCP port shared by client RPCs and Raft.
    #[arg(short, long, default_value = "8400")]
    rpc_port: u16,

    /// Gossip addresses of existing members to join through.
    #[arg(long, value_delimiter = ',')]
    join: Vec<String>,

    /// Seed a fresh single-node cluster.
    #[arg(long)]
    bootstrap: bool,

    #[arg(long, default_value = "0")]
    max_store_bytes: u64,

    #[arg(long, default_value = "0")]
    max_index_bytes: u64,
}

impl Args {
    fn into_config(self) -> Config {
        Config {
            data_dir: self.data_dir,
            node_name: self.node_name,
            bind_addr: self.bind_addr,
            rpc_port: self.rpc_port,
            start_point_addrs: self.join,
            bootstrap: self.bootstrap,
            max_store_bytes: self.max_store_bytes,
            max_index_bytes: self.max_index_bytes,
            ..Config::default()
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing();

    let config = match args.config.clone() {
        Some(path) => match Config::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                error!(
                    target: "quill",
                    path = %path.display(),
                    error = %e,
                    "failed to load config file"
                );
                std::process::exit(1);
            }
        },
        None => args.into_config(),
    };

    info!(
        target: "quill",
        node = %config.node_name,
        data_dir = %config.data_dir.display(),
        rpc = %config.rpc_addr(),
        "starting quill"
    );

    let agent = match Agent::new(config).await {
        Ok(agent) => agent,
        Err(e) => {
            error!(target: "quill", error = %e, "startup failed");
            std::process::exit(1);
        }
    };

    wait_for_signal().await;

    if let Err(e) = agent.shutdown().await {
        error!(target: "quill", error = %e, "shutdown failed");
        std::process::exit(1);
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(target: "quill", error = %e, "installing SIGTERM handler");
            std::process::exit(1);
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(target: "quill", error = %e, "installing SIGINT handler");
            std::process::exit(1);
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!(target: "quill", "received SIGTERM"),
        _ = sigint.recv() => info!(target: "quill", "received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!(target: "quill", "received interrupt");
}
