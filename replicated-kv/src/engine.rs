//! The surface the store needs from a consensus engine.
//!
//! Leader election, log replication and quorum commitment live behind
//! [`ConsensusEngine`]. The store only asks four things of it: commit a
//! command, report the local role, read the membership, and change the
//! membership. Every call blocks until the engine answers or its timeout
//! elapses.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Local role as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Leader,
    Follower,
    Candidate,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Leader => "leader",
            Role::Follower => "follower",
            Role::Candidate => "candidate",
        };
        f.write_str(name)
    }
}

/// A voting member of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterMember {
    pub id: String,
    pub address: String,
}

impl ClusterMember {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for ClusterMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// Membership as of the last applied configuration change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    /// Log index of the change that produced this membership, 0 if none.
    pub index: u64,
    pub members: Vec<ClusterMember>,
}

impl Configuration {
    pub fn single(member: ClusterMember) -> Self {
        Self {
            index: 0,
            members: vec![member],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("node is not the leader")]
    NotLeader,
    #[error("timed out waiting for the engine")]
    Timeout,
    #[error("leadership lost before the entry committed")]
    LeadershipLost,
    #[error("configuration changed: expected index {expected}, found {actual}")]
    ConfigurationChanged { expected: u64, actual: u64 },
    #[error("cluster already has state, refusing to bootstrap")]
    AlreadyBootstrapped,
    #[error("engine rejected the request: {0}")]
    Rejected(String),
    #[error("engine has shut down")]
    Stopped,
}

/// Client API of the consensus engine.
///
/// `prev_index` on membership calls guards against racing configuration
/// changes: a non-zero value must equal [`Configuration::index`] at the time
/// the change is applied. Zero skips the check.
pub trait ConsensusEngine: Send + Sync {
    /// Appends `command` to the log and returns once it is committed.
    fn apply(&self, command: Vec<u8>, timeout: Duration) -> Result<(), EngineError>;

    /// Current role. Never blocks on replication.
    fn state(&self) -> Role;

    /// The member currently believed to be leader, if any.
    fn leader(&self) -> Option<ClusterMember>;

    fn configuration(&self) -> Result<Configuration, EngineError>;

    fn add_voter(
        &self,
        id: &str,
        address: &str,
        prev_index: u64,
        timeout: Duration,
    ) -> Result<(), EngineError>;

    fn remove_server(&self, id: &str, prev_index: u64, timeout: Duration)
    -> Result<(), EngineError>;

    /// One-time initialisation of a brand new cluster.
    fn bootstrap_cluster(&self, configuration: Configuration) -> Result<(), EngineError>;
}

impl<E: ConsensusEngine + ?Sized> ConsensusEngine for std::sync::Arc<E> {
    fn apply(&self, command: Vec<u8>, timeout: Duration) -> Result<(), EngineError> {
        (**self).apply(command, timeout)
    }

    fn state(&self) -> Role {
        (**self).state()
    }

    fn leader(&self) -> Option<ClusterMember> {
        (**self).leader()
    }

    fn configuration(&self) -> Result<Configuration, EngineError> {
        (**self).configuration()
    }

    fn add_voter(
        &self,
        id: &str,
        address: &str,
        prev_index: u64,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        (**self).add_voter(id, address, prev_index, timeout)
    }

    fn remove_server(
        &self,
        id: &str,
        prev_index: u64,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        (**self).remove_server(id, prev_index, timeout)
    }

    fn bootstrap_cluster(&self, configuration: Configuration) -> Result<(), EngineError> {
        (**self).bootstrap_cluster(configuration)
    }
}
