//! Raft-replicated key-value node.
//!
//! Each node keeps a string map that is only ever changed by applying
//! committed log entries, so replicas that have applied the same prefix of
//! the log hold the same map. Writes and membership changes go through the
//! leader; reads are served locally and may lag.
//!
//! # Architecture
//!
//! - **HTTP gateway** (tokio + axum): maps requests onto [`store::Store`]
//! - **Store**: leader checks, command encoding, join reconciliation
//! - **Consensus engine**: anything implementing [`engine::ConsensusEngine`].
//!   [`consensus`] provides one on tikv/raft, running on its own threads
//!   and talking to the async side only through blocking calls
//! - **State machine**: [`fsm::KvFsm`], fed by the engine's apply stream
//!
//! Blocking engine calls are moved off the async runtime with
//! `spawn_blocking`; the Raft worker itself never touches tokio.
//!
//! # Modules
//!
//! - [`command`]: commands replicated through the log
//! - [`fsm`]: the replicated map, snapshots and restore
//! - [`engine`]: consensus engine surface and its errors
//! - [`membership`]: join reconciliation
//! - [`store`]: public get/set/join operations
//! - [`gateway`]: HTTP routes and error mapping
//! - [`snapshot_store`]: file-backed snapshot retention
//! - [`consensus`]: the tikv/raft engine
//! - [`config`] and [`cli`]: node configuration

pub mod cli;
pub mod command;
pub mod config;
pub mod consensus;
pub mod engine;
pub mod fsm;
pub mod gateway;
pub mod membership;
pub mod snapshot_store;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
