//! File-backed snapshot storage.
//!
//! Each snapshot lives in its own directory under `<data dir>/snapshots`:
//!
//! ```text
//! snapshots/
//!   3-120-1718000000000/
//!     meta.json    index, term, voters and membership at that index
//!     state.bin    opaque state machine payload
//! ```
//!
//! A sink writes into `<id>.tmp` and only renames it into place on
//! [`SnapshotSink::close`], so readers never observe a partial snapshot.
//! After every successful close the oldest snapshots beyond the retention
//! count are deleted.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::engine::Configuration;
use crate::fsm::SnapshotSink;

const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.bin";
const TMP_SUFFIX: &str = ".tmp";

/// Snapshots kept on disk when no retention count is configured.
pub const DEFAULT_RETAIN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: String,
    pub index: u64,
    pub term: u64,
    /// Raft ids of the voters at `index`.
    pub voters: Vec<u64>,
    pub configuration: Configuration,
    /// Size of `state.bin` in bytes, filled in on close.
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl FileSnapshotStore {
    /// Opens (creating if needed) the store under `data_dir/snapshots`.
    ///
    /// Leftover temporary directories from an interrupted write are removed.
    pub fn open(data_dir: impl AsRef<Path>, retain: usize) -> io::Result<Self> {
        if retain == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "must retain at least one snapshot",
            ));
        }
        let dir = data_dir.as_ref().join("snapshots");
        fs::create_dir_all(&dir)?;

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if is_tmp(&path) {
                warn!(path = %path.display(), "removing incomplete snapshot");
                fs::remove_dir_all(&path)?;
            }
        }

        Ok(Self { dir, retain })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Starts a new snapshot. Nothing is visible until the sink is closed.
    pub fn create(
        &self,
        index: u64,
        term: u64,
        voters: Vec<u64>,
        configuration: Configuration,
    ) -> io::Result<FileSnapshotSink> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let id = format!("{term}-{index}-{millis}");
        let tmp_dir = self.dir.join(format!("{id}{TMP_SUFFIX}"));
        fs::create_dir_all(&tmp_dir)?;
        let file = File::create(tmp_dir.join(STATE_FILE))?;

        debug!(snapshot = %id, "creating snapshot");
        Ok(FileSnapshotSink {
            store: self.clone(),
            meta: SnapshotMeta {
                id,
                index,
                term,
                voters,
                configuration,
                size: 0,
            },
            tmp_dir,
            writer: BufWriter::new(file),
        })
    }

    /// All complete snapshots, newest first.
    pub fn list(&self) -> io::Result<Vec<SnapshotMeta>> {
        let mut metas = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_dir() || is_tmp(&path) {
                continue;
            }
            match read_meta(&path) {
                Ok(meta) => metas.push(meta),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable snapshot")
                }
            }
        }
        metas.sort_by(|a, b| (b.term, b.index, &b.id).cmp(&(a.term, a.index, &a.id)));
        Ok(metas)
    }

    /// Opens the state payload of snapshot `id`.
    pub fn open_snapshot(&self, id: &str) -> io::Result<(SnapshotMeta, File)> {
        let path = self.dir.join(id);
        let meta = read_meta(&path)?;
        let file = File::open(path.join(STATE_FILE))?;
        Ok((meta, file))
    }

    /// Opens the newest snapshot, if any exists.
    pub fn open_latest(&self) -> io::Result<Option<(SnapshotMeta, File)>> {
        match self.list()?.into_iter().next() {
            Some(meta) => self.open_snapshot(&meta.id).map(Some),
            None => Ok(None),
        }
    }

    fn reap(&self) -> io::Result<()> {
        for stale in self.list()?.into_iter().skip(self.retain) {
            info!(snapshot = %stale.id, "reaping snapshot");
            fs::remove_dir_all(self.dir.join(&stale.id))?;
        }
        Ok(())
    }
}

/// Write side of a snapshot being created by [`FileSnapshotStore::create`].
pub struct FileSnapshotSink {
    store: FileSnapshotStore,
    meta: SnapshotMeta,
    tmp_dir: PathBuf,
    writer: BufWriter<File>,
}

impl FileSnapshotSink {
    pub fn meta(&self) -> &SnapshotMeta {
        &self.meta
    }

    fn finish(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.meta.size = self.writer.get_ref().metadata()?.len();

        let meta_file = File::create(self.tmp_dir.join(META_FILE))?;
        let mut meta_writer = BufWriter::new(meta_file);
        serde_json::to_writer_pretty(&mut meta_writer, &self.meta).map_err(to_io_error)?;
        meta_writer.flush()?;
        meta_writer.get_ref().sync_all()?;

        fs::rename(&self.tmp_dir, self.store.dir.join(&self.meta.id))
    }
}

impl Write for FileSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn close(mut self) -> io::Result<()> {
        if let Err(err) = self.finish() {
            let _ = fs::remove_dir_all(&self.tmp_dir);
            return Err(err);
        }
        info!(
            snapshot = %self.meta.id,
            index = self.meta.index,
            size = self.meta.size,
            "snapshot persisted"
        );
        // The snapshot is in place; a failed reap only leaves extra copies.
        if let Err(err) = self.store.reap() {
            warn!(snapshot = %self.meta.id, error = %err, "failed to reap old snapshots");
        }
        Ok(())
    }

    fn cancel(self) -> io::Result<()> {
        debug!(snapshot = %self.meta.id, "cancelling snapshot");
        drop(self.writer);
        fs::remove_dir_all(&self.tmp_dir)
    }
}

fn read_meta(dir: &Path) -> io::Result<SnapshotMeta> {
    let bytes = fs::read(dir.join(META_FILE))?;
    serde_json::from_slice(&bytes).map_err(to_io_error)
}

fn is_tmp(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(TMP_SUFFIX))
}

fn to_io_error(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
