//! In-process stand-in for the consensus engine.
//!
//! [`MockEngine`] commits every command immediately, as a single-node log
//! would, and keeps the configuration in a plain vector. Tests flip its role
//! and inject failures to drive the store and the reconciler through their
//! error paths without a network.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::engine::{ClusterMember, Configuration, ConsensusEngine, EngineError, Role};
use crate::fsm::KvFsm;

/// Mutating calls observed by the engine, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Apply { command: Vec<u8> },
    AddVoter { id: String, address: String },
    RemoveServer { id: String },
}

#[derive(Default)]
struct MockState {
    role: Option<Role>,
    configuration: Configuration,
    calls: Vec<EngineCall>,
    fail_apply: Option<EngineError>,
    fail_configuration: Option<EngineError>,
    fail_add: Option<EngineError>,
    fail_remove: Option<EngineError>,
}

#[derive(Default)]
pub struct MockEngine {
    fsm: Option<Arc<KvFsm>>,
    state: Mutex<MockState>,
}

impl MockEngine {
    /// A leader with no state machine attached.
    pub fn new() -> Self {
        Self::default()
    }

    /// A leader that applies committed commands to `fsm`.
    pub fn with_fsm(fsm: Arc<KvFsm>) -> Self {
        Self {
            fsm: Some(fsm),
            state: Mutex::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_role(&self, role: Role) {
        self.lock().role = Some(role);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.lock().calls.clone()
    }

    /// Makes the next `apply` fail with `err`.
    pub fn fail_apply(&self, err: EngineError) {
        self.lock().fail_apply = Some(err);
    }

    pub fn fail_configuration(&self, err: EngineError) {
        self.lock().fail_configuration = Some(err);
    }

    pub fn fail_add(&self, err: EngineError) {
        self.lock().fail_add = Some(err);
    }

    pub fn fail_remove(&self, err: EngineError) {
        self.lock().fail_remove = Some(err);
    }

    fn check_prev_index(state: &MockState, prev_index: u64) -> Result<(), EngineError> {
        let actual = state.configuration.index;
        if prev_index != 0 && prev_index != actual {
            return Err(EngineError::ConfigurationChanged {
                expected: prev_index,
                actual,
            });
        }
        Ok(())
    }
}

impl ConsensusEngine for MockEngine {
    fn apply(&self, command: Vec<u8>, _timeout: Duration) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::Apply {
            command: command.clone(),
        });
        if let Some(err) = state.fail_apply.take() {
            return Err(err);
        }
        if let Some(fsm) = &self.fsm {
            fsm.apply(&command)
                .map_err(|err| EngineError::Rejected(err.to_string()))?;
        }
        Ok(())
    }

    fn state(&self) -> Role {
        self.lock().role.unwrap_or(Role::Leader)
    }

    fn leader(&self) -> Option<ClusterMember> {
        let state = self.lock();
        match state.role.unwrap_or(Role::Leader) {
            Role::Leader => state.configuration.members.first().cloned(),
            _ => None,
        }
    }

    fn configuration(&self) -> Result<Configuration, EngineError> {
        let mut state = self.lock();
        if let Some(err) = state.fail_configuration.take() {
            return Err(err);
        }
        Ok(state.configuration.clone())
    }

    fn add_voter(
        &self,
        id: &str,
        address: &str,
        prev_index: u64,
        _timeout: Duration,
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::AddVoter {
            id: id.to_string(),
            address: address.to_string(),
        });
        if let Some(err) = state.fail_add.take() {
            return Err(err);
        }
        Self::check_prev_index(&state, prev_index)?;
        state.configuration.members.retain(|m| m.id != id);
        state
            .configuration
            .members
            .push(ClusterMember::new(id, address));
        state.configuration.index += 1;
        Ok(())
    }

    fn remove_server(
        &self,
        id: &str,
        prev_index: u64,
        _timeout: Duration,
    ) -> Result<(), EngineError> {
        let mut state = self.lock();
        state.calls.push(EngineCall::RemoveServer { id: id.to_string() });
        if let Some(err) = state.fail_remove.take() {
            return Err(err);
        }
        Self::check_prev_index(&state, prev_index)?;
        state.configuration.members.retain(|m| m.id != id);
        state.configuration.index += 1;
        Ok(())
    }

    fn bootstrap_cluster(&self, configuration: Configuration) -> Result<(), EngineError> {
        let mut state = self.lock();
        if !state.configuration.members.is_empty() {
            return Err(EngineError::AlreadyBootstrapped);
        }
        state.configuration = Configuration {
            index: 1,
            members: configuration.members,
        };
        Ok(())
    }
}
