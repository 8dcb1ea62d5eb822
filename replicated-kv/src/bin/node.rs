//! Runs one replicated key-value node.
//!
//! Start a three-node cluster on one machine:
//! ```bash
//! # first node bootstraps a single-node cluster
//! cargo run --bin node -- --id n1 ~/kv/n1
//!
//! # the others join it through its HTTP gateway
//! cargo run --bin node -- --id n2 --http-addr 127.0.0.1:11001 \
//!   --raft-addr 127.0.0.1:12001 --join 127.0.0.1:11000 ~/kv/n2
//! cargo run --bin node -- --id n3 --http-addr 127.0.0.1:11002 \
//!   --raft-addr 127.0.0.1:12002 --join 127.0.0.1:11000 ~/kv/n3
//!
//! curl -XPUT localhost:11000/kv/user1 -d batman
//! curl localhost:11001/kv/user1
//! ```

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use crossbeam_channel::Receiver;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

use replicated_kv::cli::Cli;
use replicated_kv::config::NodeConfig;
use replicated_kv::consensus::{Halt, RaftHandle, spawn_node};
use replicated_kv::engine::{Configuration, ConsensusEngine, EngineError};
use replicated_kv::fsm::KvFsm;
use replicated_kv::gateway::{self, JoinRequest, JoinResponse};
use replicated_kv::store::Store;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Cli::parse().into_config();
    let fsm = Arc::new(KvFsm::new());
    let (handle, halt) = spawn_node(&config, Arc::clone(&fsm))?;
    info!(
        node = %config.member(),
        data_dir = %config.data_dir.display(),
        "raft node started"
    );

    let result = run(&config, fsm, handle.clone(), halt).await;
    handle.shutdown();
    if let Err(err) = &result {
        warn!("node exited with error: {err:#}");
    }
    result
}

async fn run(
    config: &NodeConfig,
    fsm: Arc<KvFsm>,
    handle: RaftHandle,
    halt: Receiver<Halt>,
) -> Result<()> {
    if config.join.is_none() {
        bootstrap(config, handle.clone()).await?;
    }

    let store = Arc::new(
        Store::new(&config.node_id, fsm, handle).with_timeout(config.apply_timeout),
    );
    let listener = TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind http address {}", config.http_addr))?;

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(gateway::serve(listener, store, async move {
        let _ = shutdown_rx.await;
    }));

    if let Some(leader) = &config.join {
        join_cluster(leader, config).await?;
    }

    let mut halted = tokio::task::spawn_blocking(move || halt.recv());
    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
            Ok(())
        }
        result = &mut halted => match result {
            Ok(Ok(halt)) => Err(anyhow!("raft node halted: {}", halt.reason)),
            _ => Err(anyhow!("raft worker stopped unexpectedly")),
        },
        served = &mut server => {
            return served.context("http gateway task failed")?;
        }
    };

    let _ = shutdown_tx.send(());
    server.await.context("http gateway task failed")??;
    outcome
}

/// Makes this node the sole voter of a new cluster. A node restarted on an
/// existing data dir already has cluster state and skips this.
async fn bootstrap(config: &NodeConfig, handle: RaftHandle) -> Result<()> {
    let configuration = Configuration::single(config.member());
    let result = tokio::task::spawn_blocking(move || handle.bootstrap_cluster(configuration))
        .await
        .context("bootstrap task failed")?;
    match result {
        Ok(()) => info!("bootstrapped single-node cluster"),
        Err(EngineError::AlreadyBootstrapped) => {
            info!("existing cluster state found, skipping bootstrap")
        }
        Err(err) => return Err(err).context("failed to bootstrap cluster"),
    }
    Ok(())
}

async fn join_cluster(leader: &str, config: &NodeConfig) -> Result<()> {
    let url = format!("http://{leader}/join");
    let response = reqwest::Client::new()
        .post(&url)
        .json(&JoinRequest {
            id: config.node_id.clone(),
            addr: config.raft_addr.clone(),
        })
        .send()
        .await
        .with_context(|| format!("failed to reach {url}"))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(anyhow!("join via {leader} failed with {status}: {body}"));
    }
    match response.json::<JoinResponse>().await? {
        JoinResponse::AlreadyMember => info!(leader, "already a cluster member"),
        JoinResponse::Added { removed } => {
            for member in &removed {
                info!(member = %member, "stale member replaced");
            }
            info!(leader, "joined cluster");
        }
    }
    Ok(())
}
