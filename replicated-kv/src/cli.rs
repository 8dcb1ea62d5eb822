//! Command-line flags of the `node` binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueHint};

use crate::config::{
    DEFAULT_HTTP_ADDR, DEFAULT_RAFT_ADDR, DEFAULT_SNAPSHOT_THRESHOLD, DEFAULT_TRAILING_LOGS,
    NodeConfig,
};
use crate::snapshot_store::DEFAULT_RETAIN;

/// Replicated key-value node.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Directory holding this node's snapshots.
    #[arg(value_hint = ValueHint::DirPath)]
    pub data_dir: PathBuf,

    /// Node id, unique within the cluster. Defaults to the Raft address.
    #[arg(long)]
    pub id: Option<String>,

    /// Address the HTTP gateway binds to.
    #[arg(long, default_value = DEFAULT_HTTP_ADDR)]
    pub http_addr: String,

    /// Address used for Raft traffic between nodes.
    #[arg(long, default_value = DEFAULT_RAFT_ADDR)]
    pub raft_addr: String,

    /// HTTP address of a cluster node to join. Without it the node
    /// bootstraps a single-node cluster.
    #[arg(long)]
    pub join: Option<String>,

    /// Applied entries between snapshots.
    #[arg(long, default_value_t = DEFAULT_SNAPSHOT_THRESHOLD)]
    pub snapshot_threshold: u64,

    /// Log entries kept behind the latest snapshot.
    #[arg(long, default_value_t = DEFAULT_TRAILING_LOGS)]
    pub trailing_logs: u64,

    /// Snapshots kept on disk.
    #[arg(long, default_value_t = DEFAULT_RETAIN)]
    pub retain_snapshots: usize,

    /// Seconds a write or join may wait for commitment.
    #[arg(long, default_value_t = 10)]
    pub apply_timeout_secs: u64,
}

impl Cli {
    pub fn into_config(self) -> NodeConfig {
        let node_id = self.id.unwrap_or_else(|| self.raft_addr.clone());
        let mut config = NodeConfig::new(node_id, self.raft_addr, self.data_dir);
        config.http_addr = self.http_addr;
        config.join = self.join;
        config.snapshot_threshold = self.snapshot_threshold;
        config.trailing_logs = self.trailing_logs;
        config.retain_snapshots = self.retain_snapshots;
        config.apply_timeout = Duration::from_secs(self.apply_timeout_secs);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_config_defaults() {
        let config = Cli::parse_from(["node", "/tmp/n1"]).into_config();
        assert_eq!(config.node_id, "127.0.0.1:12000");
        assert_eq!(config.http_addr, "127.0.0.1:11000");
        assert_eq!(config.join, None);
        assert_eq!(config.apply_timeout, Duration::from_secs(10));
        assert_eq!(config.retain_snapshots, 2);
    }

    #[test]
    fn flags_override_defaults() {
        let config = Cli::parse_from([
            "node",
            "--id",
            "n2",
            "--raft-addr",
            "127.0.0.1:12001",
            "--http-addr",
            "127.0.0.1:11001",
            "--join",
            "127.0.0.1:11000",
            "--snapshot-threshold",
            "64",
            "--apply-timeout-secs",
            "3",
            "/tmp/n2",
        ])
        .into_config();

        assert_eq!(config.member().to_string(), "n2@127.0.0.1:12001");
        assert_eq!(config.join.as_deref(), Some("127.0.0.1:11000"));
        assert_eq!(config.snapshot_threshold, 64);
        assert_eq!(config.apply_timeout, Duration::from_secs(3));
        assert_eq!(config.data_dir, PathBuf::from("/tmp/n2"));
    }
}
