//! Join reconciliation against the engine's current configuration.
//!
//! A node may rejoin with a new address, or an address may be reused by a
//! different node id. Either leaves a stale entry that shares one identity
//! axis with the joiner. The reconciler removes such entries before asking
//! the engine to add the joiner, so the last join attempt always wins. A
//! member matching on both id and address is already present and nothing
//! changes.
//!
//! The configuration is always read fresh from the engine; nothing here is
//! cached between joins.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::engine::{ClusterMember, ConsensusEngine, EngineError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The joiner was already a member with the same id and address.
    AlreadyMember,
    /// The joiner was added after removing the listed conflicting members.
    Added { removed: Vec<ClusterMember> },
}

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("failed to read cluster configuration: {0}")]
    Configuration(#[source] EngineError),
    #[error("failed to remove conflicting node {node_id} at {address}: {source}")]
    RemoveConflict {
        node_id: String,
        address: String,
        #[source]
        source: EngineError,
    },
    #[error("failed to add voter {node_id} at {address}: {source}")]
    AddVoter {
        node_id: String,
        address: String,
        #[source]
        source: EngineError,
    },
}

impl MembershipError {
    /// The engine error underneath, preserved as-is.
    pub fn engine_error(&self) -> &EngineError {
        match self {
            MembershipError::Configuration(source)
            | MembershipError::RemoveConflict { source, .. }
            | MembershipError::AddVoter { source, .. } => source,
        }
    }
}

/// Makes `node_id@address` a voter, resolving id or address conflicts first.
pub fn reconcile_join<E>(
    engine: &E,
    node_id: &str,
    address: &str,
    timeout: Duration,
) -> Result<JoinOutcome, MembershipError>
where
    E: ConsensusEngine + ?Sized,
{
    let configuration = engine
        .configuration()
        .map_err(MembershipError::Configuration)?;

    let mut removed = Vec::new();
    for srv in configuration.members {
        let same_id = srv.id == node_id;
        let same_address = srv.address == address;

        if same_id && same_address {
            debug!(node_id, address, "node already a member, ignoring join");
            return Ok(JoinOutcome::AlreadyMember);
        }

        if same_id || same_address {
            info!(
                conflicting_id = %srv.id,
                conflicting_address = %srv.address,
                node_id,
                address,
                "removing conflicting member before join"
            );
            engine.remove_server(&srv.id, 0, timeout).map_err(|source| {
                MembershipError::RemoveConflict {
                    node_id: srv.id.clone(),
                    address: srv.address.clone(),
                    source,
                }
            })?;
            removed.push(srv);
        }
    }

    engine
        .add_voter(node_id, address, 0, timeout)
        .map_err(|source| MembershipError::AddVoter {
            node_id: node_id.to_string(),
            address: address.to_string(),
            source,
        })?;
    info!(node_id, address, "node joined cluster");

    Ok(JoinOutcome::Added { removed })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Configuration;
    use crate::test_utils::{EngineCall, MockEngine};

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn engine_with(members: &[(&str, &str)]) -> MockEngine {
        let engine = MockEngine::new();
        engine
            .bootstrap_cluster(Configuration {
                index: 0,
                members: members
                    .iter()
                    .map(|(id, addr)| ClusterMember::new(*id, *addr))
                    .collect(),
            })
            .unwrap();
        engine
    }

    #[test]
    fn identical_member_is_a_no_op() {
        let engine = engine_with(&[("n1", "10.0.0.1:9000")]);

        let outcome = reconcile_join(&engine, "n1", "10.0.0.1:9000", TIMEOUT).unwrap();

        assert_eq!(outcome, JoinOutcome::AlreadyMember);
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn new_member_is_added_without_removals() {
        let engine = engine_with(&[("n1", "10.0.0.1:9000")]);

        let outcome = reconcile_join(&engine, "n2", "10.0.0.2:9000", TIMEOUT).unwrap();

        assert_eq!(outcome, JoinOutcome::Added { removed: vec![] });
        assert_eq!(
            engine.calls(),
            vec![EngineCall::AddVoter {
                id: "n2".into(),
                address: "10.0.0.2:9000".into()
            }]
        );
    }

    #[test]
    fn rejoin_with_new_address_removes_old_entry_first() {
        let engine = engine_with(&[("N1", "10.0.0.1:9000"), ("N2", "10.0.0.3:9000")]);

        let outcome = reconcile_join(&engine, "N1", "10.0.0.2:9000", TIMEOUT).unwrap();

        assert_eq!(
            outcome,
            JoinOutcome::Added {
                removed: vec![ClusterMember::new("N1", "10.0.0.1:9000")]
            }
        );
        assert_eq!(
            engine.calls(),
            vec![
                EngineCall::RemoveServer { id: "N1".into() },
                EngineCall::AddVoter {
                    id: "N1".into(),
                    address: "10.0.0.2:9000".into()
                },
            ]
        );
        let members = engine.configuration().unwrap().members;
        assert!(!members.iter().any(|m| m.address == "10.0.0.1:9000"));
        assert_eq!(
            members.iter().filter(|m| m.id == "N1").collect::<Vec<_>>(),
            vec![&ClusterMember::new("N1", "10.0.0.2:9000")]
        );
    }

    #[test]
    fn reused_address_evicts_previous_owner() {
        let engine = engine_with(&[("old", "10.0.0.1:9000")]);

        reconcile_join(&engine, "new", "10.0.0.1:9000", TIMEOUT).unwrap();

        let members = engine.configuration().unwrap().members;
        assert_eq!(members, vec![ClusterMember::new("new", "10.0.0.1:9000")]);
    }

    #[test]
    fn conflicts_on_both_axes_are_all_removed() {
        let engine = engine_with(&[("a", "10.0.0.1:9000"), ("b", "10.0.0.2:9000")]);

        let outcome = reconcile_join(&engine, "a", "10.0.0.2:9000", TIMEOUT).unwrap();

        let JoinOutcome::Added { removed } = outcome else {
            panic!("expected an add");
        };
        assert_eq!(removed.len(), 2);
        assert_eq!(
            engine.configuration().unwrap().members,
            vec![ClusterMember::new("a", "10.0.0.2:9000")]
        );
    }

    #[test]
    fn configuration_failure_aborts_join() {
        let engine = engine_with(&[("n1", "10.0.0.1:9000")]);
        engine.fail_configuration(EngineError::Stopped);

        let err = reconcile_join(&engine, "n2", "10.0.0.2:9000", TIMEOUT).unwrap_err();

        assert!(matches!(err, MembershipError::Configuration(EngineError::Stopped)));
        assert!(engine.calls().is_empty());
    }

    #[test]
    fn removal_failure_names_the_conflicting_node() {
        let engine = engine_with(&[("n1", "10.0.0.1:9000")]);
        engine.fail_remove(EngineError::Timeout);

        let err = reconcile_join(&engine, "n1", "10.0.0.9:9000", TIMEOUT).unwrap_err();

        let message = err.to_string();
        assert!(message.contains("n1"), "{message}");
        assert!(message.contains("10.0.0.1:9000"), "{message}");
        assert_eq!(err.engine_error(), &EngineError::Timeout);
        assert!(
            !engine
                .calls()
                .iter()
                .any(|call| matches!(call, EngineCall::AddVoter { .. })),
            "must not add after a failed removal"
        );
    }

    #[test]
    fn add_voter_failure_is_returned_unchanged() {
        let engine = engine_with(&[("n1", "10.0.0.1:9000")]);
        engine.fail_add(EngineError::NotLeader);

        let err = reconcile_join(&engine, "n2", "10.0.0.2:9000", TIMEOUT).unwrap_err();

        assert!(matches!(
            err,
            MembershipError::AddVoter {
                source: EngineError::NotLeader,
                ..
            }
        ));
    }

    #[test]
    fn joining_twice_only_changes_configuration_once() {
        let engine = engine_with(&[("n1", "10.0.0.1:9000")]);

        reconcile_join(&engine, "n2", "10.0.0.2:9000", TIMEOUT).unwrap();
        let after_first = engine.configuration().unwrap();
        let second = reconcile_join(&engine, "n2", "10.0.0.2:9000", TIMEOUT).unwrap();

        assert_eq!(second, JoinOutcome::AlreadyMember);
        assert_eq!(engine.configuration().unwrap(), after_first);
    }
}
