//! Raft log storage that can hand real snapshots to lagging followers.
//!
//! `MemStorage` keeps the log, hard state and conf state, but the snapshot it
//! builds carries metadata only. [`KvStorage`] delegates everything to it
//! except [`Storage::snapshot`], which returns the last snapshot persisted
//! on this node, payload included.
//!
//! Raft drops a snapshot whose conf state does not name the recipient. When
//! the persisted snapshot predates a peer's membership, the request is
//! refused as temporarily unavailable and flagged, so the node takes a fresh
//! one; raft asks again on a later heartbeat.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};

use anyhow::{Context, Result, ensure};
use raft::prelude::{ConfState, Entry, Snapshot};
use raft::storage::{MemStorage, MemStorageCore};
use raft::{GetEntriesContext, RaftState, Storage, StorageError};

use crate::engine::Configuration;
use crate::snapshot_store::SnapshotMeta;

#[derive(Clone)]
pub struct KvStorage {
    mem: MemStorage,
    latest: Arc<RwLock<Option<Snapshot>>>,
    wanted: Arc<AtomicBool>,
}

impl Default for KvStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStorage {
    pub fn new() -> Self {
        Self {
            mem: MemStorage::new(),
            latest: Arc::new(RwLock::new(None)),
            wanted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Write access to the underlying log, hard state and conf state.
    pub fn wl(&self) -> RwLockWriteGuard<'_, MemStorageCore> {
        self.mem.wl()
    }

    /// Whether this node already holds cluster state, either from a
    /// snapshot, log entries, or an initial configuration.
    pub fn is_initialized(&self) -> Result<bool> {
        let state = self.initial_state()?;
        Ok(!state.conf_state.voters.is_empty()
            || self.last_index()? > 0
            || self.latest_snapshot().is_some())
    }

    pub fn conf_state(&self) -> Result<ConfState> {
        Ok(self.initial_state()?.conf_state)
    }

    /// Installs `snapshot` as the one served to followers.
    pub fn set_snapshot(&self, snapshot: Snapshot) {
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
    }

    pub fn latest_snapshot(&self) -> Option<Snapshot> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether raft asked for a snapshot that was missing or stale since
    /// the last call. Clears the flag.
    pub fn take_snapshot_request(&self) -> bool {
        self.wanted.swap(false, Ordering::AcqRel)
    }
}

impl Storage for KvStorage {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        let usable = self.latest_snapshot().filter(|snapshot| {
            let meta = snapshot.get_metadata();
            let conf_state = meta.get_conf_state();
            meta.index >= request_index
                && (conf_state.voters.contains(&to) || conf_state.learners.contains(&to))
        });
        match usable {
            Some(snapshot) => Ok(snapshot),
            None => {
                self.wanted.store(true, Ordering::Release);
                Err(raft::Error::Store(StorageError::SnapshotTemporarilyUnavailable))
            }
        }
    }
}

/// Snapshot payload shipped between nodes.
///
/// Raft's snapshot metadata only knows numeric voter ids, so the membership
/// (ids and addresses) travels in front of the state machine bytes:
///
/// - 4 bytes: configuration length (big-endian u32)
/// - N bytes: JSON-encoded [`Configuration`]
/// - rest: state machine payload, opaque to the engine
pub struct SnapshotPayload;

impl SnapshotPayload {
    pub fn encode(configuration: &Configuration, state: &[u8]) -> Result<Vec<u8>> {
        let config = serde_json::to_vec(configuration).context("encode configuration")?;
        let len = u32::try_from(config.len()).context("configuration too large")?;
        let mut buf = Vec::with_capacity(4 + config.len() + state.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&config);
        buf.extend_from_slice(state);
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<(Configuration, &[u8])> {
        ensure!(data.len() >= 4, "snapshot payload truncated");
        let (len, rest) = data.split_at(4);
        let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
        ensure!(rest.len() >= len, "snapshot configuration truncated");
        let (config, state) = rest.split_at(len);
        let configuration =
            serde_json::from_slice(config).context("decode snapshot configuration")?;
        Ok((configuration, state))
    }
}

/// Builds the Raft snapshot for a persisted snapshot.
pub fn raft_snapshot(meta: &SnapshotMeta, mut state: impl Read) -> Result<Snapshot> {
    let mut bytes = Vec::new();
    state
        .read_to_end(&mut bytes)
        .with_context(|| format!("read snapshot {}", meta.id))?;

    let mut snapshot = Snapshot::default();
    snapshot.data = SnapshotPayload::encode(&meta.configuration, &bytes)?.into();
    let metadata = snapshot.mut_metadata();
    metadata.index = meta.index;
    metadata.term = meta.term;
    metadata.set_conf_state(ConfState::from((meta.voters.clone(), vec![])));
    Ok(snapshot)
}
