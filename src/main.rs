//! raftkv node binary.
//!
//! ```bash
//! # First node bootstraps a new cluster
//! raftkv --id node0 --raft-dir /var/lib/raftkv/node0
//!
//! # Further nodes join through any member's command port
//! raftkv --id node1 --raft-dir /var/lib/raftkv/node1 \
//!     --tcp-addr localhost:3002 --raft-addr localhost:4002 --join localhost:3001
//! ```
//!
//! Set LOG_FORMAT=json for JSON output suitable for log aggregators.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use raftkv::config::NodeConfig;
use raftkv::join::join_cluster;
use raftkv::raft::RaftNode;
use raftkv::server::CommandServer;
use raftkv::telemetry::{LogFormat, init_logging};
use tracing::{error, info};

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Exit status for configuration, storage and join failures during startup.
const STARTUP_FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_logging(LogFormat::from_env()) {
        eprintln!("failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    let config = NodeConfig::parse();
    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_fatal() => {
            error!(error = %e, "Startup failed");
            ExitCode::from(STARTUP_FAILURE)
        }
        Err(e) => {
            error!(error = %e, "Node stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: NodeConfig) -> raftkv::Result<()> {
    info!(
        node = %config.node_id,
        tcp_addr = %config.tcp_addr,
        raft_addr = %config.raft_addr,
        raft_dir = %config.raft_dir.display(),
        in_memory = config.in_memory,
        join = ?config.join,
        "Starting raftkv node"
    );

    let node = Arc::new(RaftNode::open(&config, config.bootstrap()).await?);

    let server = Arc::new(
        CommandServer::with_config(&config.tcp_addr, node.clone(), config.max_connections)
            .await?,
    );
    let server_task = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    if let Some(join_addr) = &config.join {
        if let Err(e) = join_cluster(
            join_addr,
            &config.node_id,
            node.raft_addr(),
            config.join_retries,
        )
        .await
        {
            error!(join_addr = %join_addr, error = %e, "Failed to join cluster");
            server.shutdown();
            node.shutdown().await?;
            return Err(e);
        }
    }

    info!(node = %config.node_id, "Node is running");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Received interrupt, shutting down");
        }
        result = server_task => {
            // The accept loop only exits on shutdown or a fatal error.
            if let Ok(Err(e)) = result {
                error!(error = %e, "Command server failed");
            }
        }
    }

    server.shutdown_and_wait(SHUTDOWN_DRAIN_TIMEOUT).await;
    node.shutdown().await
}
