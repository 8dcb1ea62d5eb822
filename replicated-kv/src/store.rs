//! Public read/write/membership operations of a node.
//!
//! [`Store`] ties the local state machine to the consensus engine:
//!
//! - reads are served from the local map and may be stale on a lagging
//!   replica; there is no read-your-writes guarantee across replicas
//! - writes are only accepted on the leader and return once committed
//! - joins reconcile conflicting members before adding the new voter
//!
//! Engine errors are handed back unchanged. Retrying, possibly against
//! another node, is the caller's call.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::command::Command;
use crate::engine::{ClusterMember, Configuration, ConsensusEngine, EngineError, Role};
use crate::fsm::KvFsm;
use crate::membership::{self, JoinOutcome, MembershipError};

/// How long a write or membership change may wait for the engine.
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum StoreError {
    /// Writes and joins must go to the leader; nothing is forwarded.
    #[error("node is not the leader")]
    NotLeader { leader: Option<ClusterMember> },
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error("failed to encode command: {0}")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Membership(#[from] MembershipError),
}

/// Snapshot of a node's current state, served by `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: String,
    pub role: Role,
    pub leader: Option<ClusterMember>,
    pub keys: usize,
    pub configuration: Configuration,
}

pub struct Store<E> {
    node_id: String,
    fsm: Arc<KvFsm>,
    engine: E,
    timeout: Duration,
}

impl<E: ConsensusEngine> Store<E> {
    pub fn new(node_id: impl Into<String>, fsm: Arc<KvFsm>, engine: E) -> Self {
        Self {
            node_id: node_id.into(),
            fsm,
            engine,
            timeout: DEFAULT_APPLY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Reads the locally applied value for `key`.
    ///
    /// `None` means the key was never set on this replica (as far as it has
    /// applied the log), which is distinct from a stored empty string.
    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        validate_key(key)?;
        Ok(self.fsm.get(key))
    }

    /// Replicates `key = value` and waits until it is committed.
    pub fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.ensure_leader()?;

        let command = Command::set(key, value)
            .encode()
            .map_err(StoreError::Encode)?;
        self.engine.apply(command, self.timeout)?;
        debug!(key, "write committed");
        Ok(())
    }

    /// Adds `node_id@address` as a voter. Joining an identical member again
    /// succeeds without touching the configuration.
    pub fn join(&self, node_id: &str, address: &str) -> Result<JoinOutcome, StoreError> {
        if node_id.is_empty() {
            return Err(StoreError::InvalidInput("node id must not be empty"));
        }
        if address.is_empty() {
            return Err(StoreError::InvalidInput("address must not be empty"));
        }
        self.ensure_leader()?;

        Ok(membership::reconcile_join(
            &self.engine,
            node_id,
            address,
            self.timeout,
        )?)
    }

    pub fn status(&self) -> Result<NodeStatus, StoreError> {
        Ok(NodeStatus {
            node_id: self.node_id.clone(),
            role: self.engine.state(),
            leader: self.engine.leader(),
            keys: self.fsm.len(),
            configuration: self.engine.configuration()?,
        })
    }

    fn ensure_leader(&self) -> Result<(), StoreError> {
        match self.engine.state() {
            Role::Leader => Ok(()),
            _ => Err(StoreError::NotLeader {
                leader: self.engine.leader(),
            }),
        }
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidInput("key must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{EngineCall, MockEngine};

    fn leader_store() -> Store<Arc<MockEngine>> {
        let fsm = Arc::new(KvFsm::new());
        let engine = Arc::new(MockEngine::with_fsm(Arc::clone(&fsm)));
        engine
            .bootstrap_cluster(Configuration::single(ClusterMember::new(
                "n1",
                "127.0.0.1:12000",
            )))
            .unwrap();
        Store::new("n1", fsm, engine)
    }

    #[test]
    fn set_then_get_on_leader() {
        let store = leader_store();
        store.set("a", "1").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn absent_key_is_none_and_empty_value_is_some() {
        let store = leader_store();
        store.set("empty", "").unwrap();
        assert_eq!(store.get("missing").unwrap(), None);
        assert_eq!(store.get("empty").unwrap().as_deref(), Some(""));
    }

    #[test]
    fn followers_reject_writes_without_touching_state() {
        let store = leader_store();
        store.engine().set_role(Role::Follower);

        let err = store.set("a", "1").unwrap_err();

        assert!(matches!(err, StoreError::NotLeader { .. }));
        assert_eq!(store.get("a").unwrap(), None);
        assert!(store.engine().calls().is_empty());
    }

    #[test]
    fn candidates_reject_writes_too() {
        let store = leader_store();
        store.engine().set_role(Role::Candidate);
        assert!(matches!(
            store.set("a", "1"),
            Err(StoreError::NotLeader { .. })
        ));
    }

    #[test]
    fn engine_errors_pass_through_unchanged() {
        let store = leader_store();
        store.engine().fail_apply(EngineError::Timeout);

        let err = store.set("a", "1").unwrap_err();

        assert!(matches!(err, StoreError::Engine(EngineError::Timeout)));
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.engine().calls().len(), 1, "no local retry");
    }

    #[test]
    fn writes_are_encoded_as_set_commands() {
        let store = leader_store();
        store.set("k", "v").unwrap();
        let calls = store.engine().calls();
        let [EngineCall::Apply { command }] = calls.as_slice() else {
            panic!("expected one apply, got {calls:?}");
        };
        assert_eq!(Command::decode(command).unwrap(), Command::set("k", "v"));
    }

    #[test]
    fn empty_keys_are_rejected() {
        let store = leader_store();
        assert!(matches!(store.get(""), Err(StoreError::InvalidInput(_))));
        assert!(matches!(store.set("", "v"), Err(StoreError::InvalidInput(_))));
        assert!(store.engine().calls().is_empty());
    }

    #[test]
    fn join_is_idempotent() {
        let store = leader_store();

        let first = store.join("n2", "127.0.0.1:12001").unwrap();
        let config = store.engine().configuration().unwrap();
        let second = store.join("n2", "127.0.0.1:12001").unwrap();

        assert!(matches!(first, JoinOutcome::Added { .. }));
        assert_eq!(second, JoinOutcome::AlreadyMember);
        assert_eq!(store.engine().configuration().unwrap(), config);
    }

    #[test]
    fn join_requires_leadership() {
        let store = leader_store();
        store.engine().set_role(Role::Follower);
        assert!(matches!(
            store.join("n2", "127.0.0.1:12001"),
            Err(StoreError::NotLeader { .. })
        ));
    }

    #[test]
    fn join_rejects_blank_identity() {
        let store = leader_store();
        assert!(matches!(
            store.join("", "127.0.0.1:12001"),
            Err(StoreError::InvalidInput(_))
        ));
        assert!(matches!(
            store.join("n2", ""),
            Err(StoreError::InvalidInput(_))
        ));
    }

    #[test]
    fn status_reports_role_and_membership() {
        let store = leader_store();
        store.set("a", "1").unwrap();

        let status = store.status().unwrap();

        assert_eq!(status.node_id, "n1");
        assert_eq!(status.role, Role::Leader);
        assert_eq!(status.keys, 1);
        assert_eq!(status.configuration.members.len(), 1);
    }
}
