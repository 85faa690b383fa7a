//! Raft server binary
//!
//! Runs a single Raft node with separate addresses for cluster transport and client API.
//!
//! Example for a 3-node cluster (node id = position in `--peers`):
//!   raftline-server --id 0 --peers 127.0.0.1:19000,127.0.0.1:19001,127.0.0.1:19002 --api-addr 127.0.0.1:20000
//!   raftline-server --id 1 --peers 127.0.0.1:19000,127.0.0.1:19001,127.0.0.1:19002 --api-addr 127.0.0.1:20001
//!   raftline-server --id 2 --peers 127.0.0.1:19000,127.0.0.1:19001,127.0.0.1:19002 --api-addr 127.0.0.1:20002
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use raftline::api::client_http::create_client_router;
use raftline::core::config::RaftConfig;
use raftline::core::controller::RaftController;
use raftline::transport::tcp::TcpDispatcher;

#[derive(Debug, Parser)]
#[command(name = "raftline-server", about = "Run one node of a Raft cluster")]
struct Args {
    /// This node's id (index into --peers)
    #[arg(long)]
    id: usize,

    /// Raft transport address of every node, in id order
    #[arg(long, value_delimiter = ',', required = true)]
    peers: Vec<SocketAddr>,

    /// Address for the client HTTP API
    #[arg(long)]
    api_addr: Option<SocketAddr>,

    /// Fixed part of the election timeout in milliseconds
    #[arg(long, default_value_t = 3000)]
    election_timeout_ms: u64,

    /// Upper bound of the random election timeout extra in milliseconds
    #[arg(long, default_value_t = 500)]
    election_spread_ms: u64,

    /// Leader heartbeat interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    heartbeat_ms: u64,

    /// Deny votes to candidates whose log is behind ours
    #[arg(long)]
    strict_votes: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = RaftConfig::default()
        .with_cluster_size(args.peers.len())
        .with_election_timeout(
            Duration::from_millis(args.election_timeout_ms),
            Duration::from_millis(args.election_spread_ms),
        )
        .with_heartbeat_interval(Duration::from_millis(args.heartbeat_ms))
        .with_candidate_log_check(args.strict_votes);
    config.validate_node(args.id)?;

    info!(id = args.id, peers = ?args.peers, "starting node");

    // Create transport
    let dispatcher = TcpDispatcher::bind(args.id, args.peers.clone()).await?;

    // The application side of this binary only records what was committed
    let id = args.id;
    let applicator = Box::new(move |entries: Vec<raftline::core::message::LogEntry>| {
        for entry in entries {
            info!(node = id, term = entry.term, command = %entry.command, "applied");
        }
    });

    let controller = RaftController::new(args.id, config, dispatcher.clone(), applicator)?;
    let handle = controller.start();

    // Start API server (for client requests)
    let (api_shutdown_tx, api_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let api_task = match args.api_addr {
        Some(addr) => {
            let listener = TcpListener::bind(addr).await?;
            info!(%addr, "client API listening");
            info!("  POST /client/submit  - Submit a command");
            info!("  GET  /client/leader  - Get leader info");
            info!("  GET  /client/status  - Get node status");
            let app = create_client_router(handle.clone());
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = api_shutdown_rx.await;
                    })
                    .await
            }))
        }
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    let _ = api_shutdown_tx.send(());
    if let Some(task) = api_task {
        task.await??;
    }
    handle.shutdown().await;
    dispatcher.shutdown().await;
    Ok(())
}
