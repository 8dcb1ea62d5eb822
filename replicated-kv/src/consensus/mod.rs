//! A [`ConsensusEngine`](crate::engine::ConsensusEngine) built on tikv/raft.
//!
//! The engine runs on its own threads:
//!
//! - **Worker thread**: owns the [`node::RaftNode`], ticks it every 100ms,
//!   serves requests from [`RaftHandle`] and applies committed entries
//! - **Listener thread** plus one reader thread per inbound connection
//! - **One sender thread per peer**, holding a persistent connection
//! - **Snapshot threads**: short-lived, write a state machine copy to disk
//!   while the worker keeps applying
//!
//! Threads talk over crossbeam channels so the Raft state stays
//! single-threaded.
//!
//! # Modules
//!
//! - [`node`]: `RawNode` wrapper applying entries to the state machine
//! - [`storage`]: `raft::Storage` that can serve real snapshots
//! - [`transport`]: length-prefixed TCP framing of Raft messages
//! - [`runtime`]: worker loop and the [`RaftHandle`] client

use raft::StateRole;

use crate::engine::Role;

pub mod node;
pub mod runtime;
pub mod storage;
pub mod transport;

pub use runtime::{Halt, RaftHandle, spawn_node};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Maps a string node id onto the numeric id Raft uses.
///
/// FNV-1a is stable across builds and platforms, so every replica derives
/// the same number for the same id. Zero is reserved by Raft for "no node".
pub fn raft_id(node_id: &str) -> u64 {
    let hash = node_id.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
    });
    if hash == raft::INVALID_ID { 1 } else { hash }
}

pub(crate) fn role_from(state: StateRole) -> Role {
    match state {
        StateRole::Leader => Role::Leader,
        StateRole::Follower => Role::Follower,
        StateRole::Candidate | StateRole::PreCandidate => Role::Candidate,
    }
}
