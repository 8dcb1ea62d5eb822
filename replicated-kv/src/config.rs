//! Runtime configuration of a node.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, ensure};

use crate::engine::ClusterMember;
use crate::snapshot_store::DEFAULT_RETAIN;
use crate::store::DEFAULT_APPLY_TIMEOUT;

pub const DEFAULT_HTTP_ADDR: &str = "127.0.0.1:11000";
pub const DEFAULT_RAFT_ADDR: &str = "127.0.0.1:12000";
/// Applied entries between two snapshots.
pub const DEFAULT_SNAPSHOT_THRESHOLD: u64 = 8192;
/// Log entries kept behind a snapshot so slightly lagging followers can
/// catch up without one.
pub const DEFAULT_TRAILING_LOGS: u64 = 10240;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable identity of this node within the cluster.
    pub node_id: String,
    /// Address peers use for Raft traffic.
    pub raft_addr: String,
    /// Address of the HTTP gateway.
    pub http_addr: String,
    /// Where snapshots are kept.
    pub data_dir: PathBuf,
    /// HTTP address of an existing node to join, if any.
    pub join: Option<String>,
    pub snapshot_threshold: u64,
    pub trailing_logs: u64,
    pub retain_snapshots: usize,
    /// Upper bound on a write or membership change.
    pub apply_timeout: Duration,
}

impl NodeConfig {
    /// A config with every tunable at its default.
    pub fn new(
        node_id: impl Into<String>,
        raft_addr: impl Into<String>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            raft_addr: raft_addr.into(),
            http_addr: DEFAULT_HTTP_ADDR.to_string(),
            data_dir: data_dir.into(),
            join: None,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            trailing_logs: DEFAULT_TRAILING_LOGS,
            retain_snapshots: DEFAULT_RETAIN,
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
        }
    }

    /// This node as a cluster member.
    pub fn member(&self) -> ClusterMember {
        ClusterMember::new(&self.node_id, &self.raft_addr)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.node_id.is_empty(), "node id must not be empty");
        ensure!(!self.raft_addr.is_empty(), "raft address must not be empty");
        ensure!(
            self.snapshot_threshold > 0,
            "snapshot threshold must be at least 1"
        );
        ensure!(
            self.retain_snapshots > 0,
            "must retain at least one snapshot"
        );
        ensure!(
            !self.apply_timeout.is_zero(),
            "apply timeout must be positive"
        );
        Ok(())
    }
}
