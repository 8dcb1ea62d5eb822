//! Raft node driving the replicated map.
//!
//! [`RaftNode`] wraps tikv/raft's `RawNode` and owns everything that must
//! move in lockstep with the log: the state machine, the member registry and
//! the local snapshot store. It is not thread-safe; the runtime's worker
//! thread is its only user.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use prost::Message as ProstMessage;
use raft::prelude::{
    ConfChange, ConfChangeType, ConfState, Config, Entry, EntryType, HardState, Message, RawNode,
    Snapshot,
};
use raft::{StateRole, Storage};
use slog::{Logger, o};
use tracing::{debug, error, info, warn};

use super::storage::{KvStorage, SnapshotPayload, raft_snapshot};
use super::{raft_id, role_from};
use crate::config::NodeConfig;
use crate::engine::{ClusterMember, Configuration, EngineError, Role};
use crate::fsm::{FsmSnapshot, KvFsm, SnapshotSink};
use crate::snapshot_store::FileSnapshotStore;

/// Creates a logger that discards all output.
///
/// The tikv/raft library requires a logger, but logging happens through
/// `tracing` at this level instead.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Where a proposal landed in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Proposal {
    pub index: u64,
    pub term: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Add(ClusterMember),
    Remove(String),
}

/// What a committed entry turned out to be once applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedKind {
    Command,
    Membership,
    /// Leader no-op, or a configuration change raft refused because another
    /// one was still pending.
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub index: u64,
    pub term: u64,
    pub kind: AppliedKind,
}

/// Output of one round of ready processing.
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<Applied>,
    /// Set when enough entries were applied to warrant a snapshot. The
    /// caller runs it off-thread and hands the result to
    /// [`RaftNode::install_snapshot`].
    pub snapshot: Option<SnapshotJob>,
}

/// A state machine copy waiting to be written to disk.
pub struct SnapshotJob {
    state: FsmSnapshot,
    index: u64,
    term: u64,
    voters: Vec<u64>,
    configuration: Configuration,
    store: FileSnapshotStore,
}

impl SnapshotJob {
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Persists the copy and returns it as a snapshot raft can ship.
    pub fn run(self) -> Result<Snapshot> {
        let SnapshotJob {
            state,
            index,
            term,
            voters,
            configuration,
            store,
        } = self;

        let sink = store
            .create(index, term, voters, configuration)
            .context("failed to create snapshot")?;
        let id = sink.id().to_string();
        state
            .persist(sink)
            .with_context(|| format!("failed to persist snapshot {id}"))?;
        state.release();

        let (meta, file) = store.open_snapshot(&id)?;
        raft_snapshot(&meta, file)
    }
}

pub struct RaftNode {
    id: u64,
    raw: RawNode<KvStorage>,
    storage: KvStorage,
    raft_config: Config,
    fsm: Arc<KvFsm>,
    snapshots: FileSnapshotStore,
    members: BTreeMap<u64, ClusterMember>,
    config_index: u64,
    applied_index: u64,
    applied_term: u64,
    since_snapshot: u64,
    snapshot_threshold: u64,
    trailing_logs: u64,
    snapshotting: bool,
}

impl RaftNode {
    /// Creates the node, restoring the newest local snapshot if there is one.
    ///
    /// The log itself lives in memory, so a restarted node comes back at its
    /// last snapshot and catches up from the leader.
    ///
    /// Raft timing assumes a tick every 100ms: heartbeats every 300ms and
    /// elections after roughly one second without a leader.
    pub fn new(config: &NodeConfig, fsm: Arc<KvFsm>) -> Result<Self> {
        let id = raft_id(&config.node_id);
        let snapshots = FileSnapshotStore::open(&config.data_dir, config.retain_snapshots)
            .with_context(|| {
                format!("failed to open snapshot store in {}", config.data_dir.display())
            })?;
        let storage = KvStorage::new();

        let mut members = BTreeMap::new();
        let mut config_index = 0;
        let mut applied = (0, 0);
        if let Some((meta, mut file)) = snapshots.open_latest()? {
            let mut state = Vec::new();
            file.read_to_end(&mut state)
                .with_context(|| format!("failed to read snapshot {}", meta.id))?;
            fsm.restore(state.as_slice())
                .with_context(|| format!("failed to restore snapshot {}", meta.id))?;
            let snapshot = raft_snapshot(&meta, state.as_slice())?;
            storage
                .wl()
                .apply_snapshot(snapshot.clone())
                .context("failed to load snapshot into raft storage")?;
            storage.set_snapshot(snapshot);

            members = registry(&meta.configuration);
            config_index = meta.configuration.index;
            applied = (meta.index, meta.term);
            info!(
                snapshot = %meta.id,
                index = meta.index,
                keys = fsm.len(),
                "restored from snapshot"
            );
        }

        let raft_config = Config {
            id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            pre_vote: true,
            applied: applied.0,
            ..Default::default()
        };
        let raw = RawNode::new(&raft_config, storage.clone(), &silent_logger())
            .with_context(|| format!("failed to construct RawNode {}", config.node_id))?;

        Ok(Self {
            id,
            raw,
            storage,
            raft_config,
            fsm,
            snapshots,
            members,
            config_index,
            applied_index: applied.0,
            applied_term: applied.1,
            since_snapshot: 0,
            snapshot_threshold: config.snapshot_threshold,
            trailing_logs: config.trailing_logs,
            snapshotting: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_initialized(&self) -> Result<bool> {
        self.storage.is_initialized()
    }

    /// Seeds a brand new cluster with `configuration`.
    ///
    /// Each member becomes a conf-change entry at index 1.. in term 1, already
    /// committed and applied, so every founding node starts from the same
    /// log. A sole founder elects itself straight away.
    pub fn bootstrap(&mut self, configuration: &Configuration) -> Result<()> {
        if self.is_initialized()? {
            bail!(EngineError::AlreadyBootstrapped);
        }
        if configuration.members.is_empty() {
            bail!(EngineError::Rejected("configuration has no members".into()));
        }

        let mut entries = Vec::with_capacity(configuration.members.len());
        for (offset, member) in configuration.members.iter().enumerate() {
            let cc = conf_change(&MembershipChange::Add(member.clone()))?;
            let mut entry = Entry::default();
            entry.set_entry_type(EntryType::EntryConfChange);
            entry.index = offset as u64 + 1;
            entry.term = 1;
            entry.data = cc.encode_to_vec().into();
            entries.push(entry);
        }
        let last = entries.len() as u64;
        let registry = registry(configuration);
        let voters: Vec<u64> = registry.keys().copied().collect();

        {
            let mut core = self.storage.wl();
            core.append(&entries).context("failed to append bootstrap entries")?;
            core.set_conf_state(ConfState::from((voters.clone(), vec![])));
            let mut hard_state = HardState::default();
            hard_state.term = 1;
            hard_state.commit = last;
            core.set_hardstate(hard_state);
        }

        self.raft_config.applied = last;
        self.raw = RawNode::new(&self.raft_config, self.storage.clone(), &silent_logger())
            .context("failed to rebuild RawNode after bootstrap")?;
        self.members = registry;
        self.config_index = last;
        self.applied_index = last;
        self.applied_term = 1;

        info!(members = voters.len(), "bootstrapped cluster");
        if voters == [self.id] {
            self.raw.campaign().context("campaign failed")?;
        }
        Ok(())
    }

    /// Advances raft's logical clock by one tick.
    pub fn tick(&mut self) {
        self.raw.tick();
    }

    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).context("step failed")
    }

    pub fn role(&self) -> Role {
        role_from(self.raw.raft.state)
    }

    pub fn is_leader(&self) -> bool {
        self.raw.raft.state == StateRole::Leader
    }

    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn leader_id(&self) -> u64 {
        self.raw.raft.leader_id
    }

    pub fn leader(&self) -> Option<ClusterMember> {
        self.members.get(&self.raw.raft.leader_id).cloned()
    }

    pub fn configuration(&self) -> Configuration {
        Configuration {
            index: self.config_index,
            members: self.members.values().cloned().collect(),
        }
    }

    pub fn config_index(&self) -> u64 {
        self.config_index
    }

    pub fn member_address(&self, id: u64) -> Option<&str> {
        self.members.get(&id).map(|member| member.address.as_str())
    }

    /// Appends a state machine command to the log.
    ///
    /// Success only means the entry was appended locally; the runtime waits
    /// for it to show up in [`ReadyBundle::applied`].
    pub fn propose(&mut self, data: Vec<u8>) -> Result<Proposal, EngineError> {
        if !self.is_leader() {
            return Err(EngineError::NotLeader);
        }
        self.raw
            .propose(vec![], data)
            .map_err(|err| EngineError::Rejected(err.to_string()))?;
        Ok(self.last_proposal())
    }

    /// Appends a single-step membership change to the log.
    ///
    /// While another change is still uncommitted, raft swaps this one for an
    /// empty entry; it then applies as [`AppliedKind::Empty`].
    ///
    /// The leader never removes itself and the last voter is never removed;
    /// both are refused before anything reaches the log.
    pub fn propose_membership(&mut self, change: MembershipChange) -> Result<Proposal, EngineError> {
        if !self.is_leader() {
            return Err(EngineError::NotLeader);
        }
        if let MembershipChange::Remove(node_id) = &change {
            self.check_removal(node_id)?;
        }
        let cc = conf_change(&change).map_err(|err| EngineError::Rejected(err.to_string()))?;
        self.raw
            .propose_conf_change(vec![], cc)
            .map_err(|err| EngineError::Rejected(err.to_string()))?;
        Ok(self.last_proposal())
    }

    fn check_removal(&self, node_id: &str) -> Result<(), EngineError> {
        let target = raft_id(node_id);
        if target == self.id {
            return Err(EngineError::Rejected(format!("leader {node_id} cannot remove itself")));
        }
        let voters = self
            .storage
            .conf_state()
            .map_err(|err| EngineError::Rejected(format!("{err:#}")))?
            .voters;
        if voters == [target] {
            return Err(EngineError::Rejected(format!("{node_id} is the last voter")));
        }
        Ok(())
    }

    fn last_proposal(&self) -> Proposal {
        Proposal {
            index: self.raw.raft.raft_log.last_index(),
            term: self.raw.raft.term,
        }
    }

    /// Handles one Ready/LightReady round, if raft has anything for us.
    ///
    /// Order follows raft's contract: outbound leader messages, snapshot,
    /// committed entries, new entries, hard state, then the messages that
    /// had to wait for persistence. Committed entries released by the light
    /// ready are applied in the same call, so `applied` is always in log
    /// order.
    ///
    /// An `ApplyError` from the state machine is returned as-is inside the
    /// `anyhow::Error`; nothing past the failing entry is applied.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut messages = ready.take_messages();
        let mut applied = Vec::new();

        if !ready.snapshot().is_empty() {
            self.restore_snapshot(ready.snapshot().clone())?;
        }

        applied.extend(self.apply_entries(ready.take_committed_entries())?);

        if !ready.entries().is_empty() {
            self.storage
                .wl()
                .append(ready.entries())
                .context("append entries failed")?;
        }
        if let Some(hard_state) = ready.hs() {
            self.storage.wl().set_hardstate(hard_state.clone());
        }
        messages.extend(ready.take_persisted_messages());

        let mut light_ready = self.raw.advance(ready);
        if let Some(commit) = light_ready.commit_index() {
            self.storage.wl().mut_hard_state().set_commit(commit);
        }
        messages.extend(light_ready.take_messages());
        applied.extend(self.apply_entries(light_ready.take_committed_entries())?);
        self.raw.advance_apply();

        let snapshot = self.maybe_snapshot()?;
        Ok(Some(ReadyBundle {
            messages,
            applied,
            snapshot,
        }))
    }

    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<Vec<Applied>> {
        let mut applied = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.index <= self.applied_index {
                continue;
            }
            let kind = match entry.entry_type() {
                EntryType::EntryNormal if entry.data.is_empty() => AppliedKind::Empty,
                EntryType::EntryNormal => {
                    if let Err(err) = self.fsm.apply(&entry.data[..]) {
                        error!(index = entry.index, error = %err, "halting apply stream");
                        return Err(err.into());
                    }
                    AppliedKind::Command
                }
                EntryType::EntryConfChange => {
                    if self.apply_membership(&entry)? {
                        AppliedKind::Membership
                    } else {
                        AppliedKind::Empty
                    }
                }
                EntryType::EntryConfChangeV2 => {
                    bail!("joint consensus entry at index {} is not supported", entry.index)
                }
            };
            self.applied_index = entry.index;
            self.applied_term = entry.term;
            self.since_snapshot += 1;
            applied.push(Applied {
                index: entry.index,
                term: entry.term,
                kind,
            });
        }
        Ok(applied)
    }

    /// Applies a committed conf change. Returns `false` when raft refuses
    /// it; every replica refuses the same entry, so the configuration stays
    /// as it was and the log keeps flowing.
    fn apply_membership(&mut self, entry: &Entry) -> Result<bool> {
        let cc = ConfChange::decode(&entry.data[..])
            .with_context(|| format!("corrupt conf change at index {}", entry.index))?;
        let conf_state = match self.raw.apply_conf_change(&cc) {
            Ok(conf_state) => conf_state,
            Err(err) => {
                warn!(
                    index = entry.index,
                    node = cc.node_id,
                    error = %err,
                    "conf change refused, configuration unchanged"
                );
                return Ok(false);
            }
        };
        self.storage.wl().set_conf_state(conf_state);

        match cc.change_type() {
            ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                let member: ClusterMember = serde_json::from_slice(&cc.context[..])
                    .with_context(|| format!("corrupt member at index {}", entry.index))?;
                info!(member = %member, index = entry.index, "member added");
                self.members.insert(cc.node_id, member);
            }
            ConfChangeType::RemoveNode => {
                if let Some(member) = self.members.remove(&cc.node_id) {
                    info!(member = %member, index = entry.index, "member removed");
                }
            }
        }
        self.config_index = entry.index;
        Ok(true)
    }

    /// Replaces local state with a snapshot shipped by the leader and keeps
    /// a copy on disk.
    fn restore_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let (index, term, voters) = {
            let meta = snapshot.get_metadata();
            (meta.index, meta.term, meta.get_conf_state().voters.clone())
        };
        let (configuration, state) = SnapshotPayload::decode(&snapshot.data[..])?;

        self.fsm
            .restore(state)
            .with_context(|| format!("failed to restore snapshot at index {index}"))?;
        self.storage
            .wl()
            .apply_snapshot(snapshot.clone())
            .context("failed to apply snapshot to raft storage")?;

        let mut sink = self
            .snapshots
            .create(index, term, voters, configuration.clone())
            .context("failed to create snapshot")?;
        if let Err(err) = sink.write_all(state) {
            if let Err(cancel_err) = sink.cancel() {
                warn!(error = %cancel_err, "failed to cancel snapshot sink");
            }
            return Err(err).context("failed to persist received snapshot");
        }
        sink.close().context("failed to persist received snapshot")?;
        self.storage.set_snapshot(snapshot);

        self.members = registry(&configuration);
        self.config_index = configuration.index;
        self.applied_index = index;
        self.applied_term = term;
        self.since_snapshot = 0;
        info!(index, keys = self.fsm.len(), "installed snapshot from leader");
        Ok(())
    }

    fn maybe_snapshot(&mut self) -> Result<Option<SnapshotJob>> {
        if self.snapshotting || self.applied_index == 0 {
            return Ok(None);
        }
        let requested = self.storage.take_snapshot_request();
        if self.since_snapshot < self.snapshot_threshold && !requested {
            return Ok(None);
        }
        let voters = self.storage.conf_state()?.voters;
        self.snapshotting = true;
        self.since_snapshot = 0;
        debug!(index = self.applied_index, requested, "starting snapshot");

        Ok(Some(SnapshotJob {
            state: self.fsm.snapshot(),
            index: self.applied_index,
            term: self.applied_term,
            voters,
            configuration: self.configuration(),
            store: self.snapshots.clone(),
        }))
    }

    /// Takes the outcome of a [`SnapshotJob`] back.
    ///
    /// A successful snapshot becomes the one served to followers and the log
    /// is compacted up to `trailing_logs` entries behind it.
    pub fn install_snapshot(&mut self, outcome: Result<Snapshot>) -> Result<()> {
        self.snapshotting = false;
        let snapshot = match outcome {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "snapshot failed");
                return Ok(());
            }
        };

        let index = snapshot.get_metadata().index;
        let newer_installed = self
            .storage
            .latest_snapshot()
            .is_some_and(|latest| latest.get_metadata().index >= index);
        if !newer_installed {
            self.storage.set_snapshot(snapshot);
        }

        let compact_to = index.saturating_sub(self.trailing_logs);
        if compact_to > self.storage.first_index()? {
            self.storage
                .wl()
                .compact(compact_to)
                .context("failed to compact log")?;
            debug!(compact_to, "compacted log");
        }
        Ok(())
    }
}

fn registry(configuration: &Configuration) -> BTreeMap<u64, ClusterMember> {
    configuration
        .members
        .iter()
        .map(|member| (raft_id(&member.id), member.clone()))
        .collect()
}

fn conf_change(change: &MembershipChange) -> Result<ConfChange> {
    let mut cc = ConfChange::default();
    match change {
        MembershipChange::Add(member) => {
            cc.set_change_type(ConfChangeType::AddNode);
            cc.node_id = raft_id(&member.id);
            cc.context = serde_json::to_vec(member)
                .context("failed to encode member")?
                .into();
        }
        MembershipChange::Remove(id) => {
            cc.set_change_type(ConfChangeType::RemoveNode);
            cc.node_id = raft_id(id);
        }
    }
    Ok(cc)
}
