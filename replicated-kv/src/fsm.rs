//! The replicated map: the finite-state machine fed by the committed log.
//!
//! Every replica owns one [`KvFsm`]. The consensus engine calls
//! [`KvFsm::apply`] once per committed entry, strictly in log order, so two
//! replicas that have applied the same prefix of the log hold the same map.
//! Reads go straight to the map and may lag the leader.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::warn;

use crate::command::{Command, CommandError, Op};

/// A log entry the state machine could not apply.
///
/// This is never recoverable: a replica that skips an entry it does not
/// understand diverges from every replica that did not. Hosts must stop
/// applying when they see one.
#[derive(Debug, Error)]
#[error("fatal: refusing to apply log entry: {0}")]
pub struct ApplyError(#[from] pub CommandError);

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode snapshot: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Destination for a persisted snapshot, supplied by the consensus engine.
///
/// Bytes written are not visible until [`SnapshotSink::close`] succeeds.
/// [`SnapshotSink::cancel`] discards everything written so far. If `close`
/// itself fails the sink is responsible for cleaning up after itself.
pub trait SnapshotSink: Write {
    fn id(&self) -> &str;

    fn close(self) -> io::Result<()>
    where
        Self: Sized;

    fn cancel(self) -> io::Result<()>
    where
        Self: Sized;
}

/// Thread-safe key-value map driven by committed commands.
///
/// A plain `Mutex` guards the map. Applies, snapshots and reads all take it
/// for the length of their critical section; no lock is held while a
/// snapshot is being written out.
#[derive(Default)]
pub struct KvFsm {
    data: Mutex<BTreeMap<String, String>>,
}

impl KvFsm {
    /// Creates an empty state machine.
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decodes and applies one committed log entry.
    ///
    /// Returns the applied command so the caller can report it.
    pub fn apply(&self, data: &[u8]) -> Result<Command, ApplyError> {
        let command = Command::decode(data)?;
        match command.op {
            Op::Set => {
                self.map()
                    .insert(command.key.clone(), command.value.clone());
            }
        }
        Ok(command)
    }

    /// Local read of the last applied value for `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        self.map().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    /// Captures the map at a single instant.
    ///
    /// The copy is taken under the lock and the lock is released before the
    /// snapshot is persisted, so applies keep flowing while it is written.
    pub fn snapshot(&self) -> FsmSnapshot {
        FsmSnapshot {
            data: self.map().clone(),
        }
    }

    /// Replaces the whole map with the one encoded in `source`.
    ///
    /// On a decode failure the current state is left untouched.
    pub fn restore<R: Read>(&self, source: R) -> Result<(), SnapshotError> {
        let restored: BTreeMap<String, String> =
            serde_json::from_reader(source).map_err(SnapshotError::Decode)?;
        *self.map() = restored;
        Ok(())
    }
}

/// Immutable point-in-time copy of the map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsmSnapshot {
    data: BTreeMap<String, String>,
}

impl FsmSnapshot {
    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.data
    }

    /// Serializes the copy into `sink` as a JSON object and closes it.
    ///
    /// Any failure before the close cancels the sink, so a half-written
    /// snapshot is never committed.
    pub fn persist<S: SnapshotSink>(&self, mut sink: S) -> Result<(), SnapshotError> {
        let written = serde_json::to_vec(&self.data)
            .map_err(SnapshotError::Encode)
            .and_then(|bytes| sink.write_all(&bytes).map_err(SnapshotError::from))
            .and_then(|()| sink.flush().map_err(SnapshotError::from));

        match written {
            Ok(()) => sink.close().map_err(SnapshotError::from),
            Err(err) => {
                let id = sink.id().to_string();
                if let Err(cancel_err) = sink.cancel() {
                    warn!(snapshot = %id, error = %cancel_err, "failed to cancel snapshot sink");
                }
                Err(err)
            }
        }
    }

    /// Nothing to give back: the copy owns no external resources.
    pub fn release(self) {}
}
