//! Worker thread and the [`RaftHandle`] client.
//!
//! The worker owns the [`RaftNode`] and is the only thread that touches it.
//! Everything else talks to it over crossbeam channels:
//!
//! - requests from [`RaftHandle`] (proposals, membership, bootstrap)
//! - decoded messages from the transport's reader threads
//! - finished snapshots from snapshot threads
//!
//! Role and leader are published through a shared cell after every loop
//! iteration so [`ConsensusEngine::state`] never waits on the worker.

use std::collections::{BTreeMap, HashMap};
use std::net::TcpListener;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use raft::prelude::{Message, Snapshot};
use tracing::{debug, error, info, warn};

use super::node::{Applied, AppliedKind, MembershipChange, Proposal, RaftNode, SnapshotJob};
use super::transport::{self, Inbound, Outbox};
use crate::config::NodeConfig;
use crate::engine::{ClusterMember, Configuration, ConsensusEngine, EngineError, Role};
use crate::fsm::{ApplyError, KvFsm};

/// Raft logical clock interval.
///
/// The worker calls `node.tick()` every 100ms, which drives Raft's timeouts:
/// - Heartbeat timeout: 3 ticks = 300ms
/// - Election timeout: 10 ticks = 1000ms
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// How long reads of worker state (configuration, bootstrap) may take.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Why the worker stopped applying the log. Sent once on the channel
/// returned by [`spawn_node`]; the host should exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Halt {
    pub reason: String,
}

type Reply = Sender<Result<(), EngineError>>;

enum Request {
    Propose {
        data: Vec<u8>,
        deadline: Instant,
        respond_to: Reply,
    },
    ChangeMembership {
        change: MembershipChange,
        prev_index: u64,
        deadline: Instant,
        respond_to: Reply,
    },
    Configuration {
        respond_to: Sender<Configuration>,
    },
    Bootstrap {
        configuration: Configuration,
        respond_to: Reply,
    },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProposalKind {
    Command,
    Membership,
}

/// A proposal appended to the log whose caller is still waiting.
struct Pending {
    term: u64,
    kind: ProposalKind,
    deadline: Instant,
    respond_to: Reply,
}

#[derive(Debug, Clone)]
struct Observed {
    role: Role,
    leader: Option<ClusterMember>,
}

/// Client side of a running node. Cheap to clone.
#[derive(Clone)]
pub struct RaftHandle {
    requests: Sender<Request>,
    observed: Arc<Mutex<Observed>>,
}

impl RaftHandle {
    /// Asks the worker to stop. Waiting callers see [`EngineError::Stopped`].
    pub fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown);
    }

    fn observed(&self) -> Observed {
        self.observed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn call<T>(
        &self,
        timeout: Duration,
        request: impl FnOnce(Sender<T>) -> Request,
    ) -> Result<T, EngineError> {
        let (respond_to, response) = bounded(1);
        self.requests
            .send(request(respond_to))
            .map_err(|_| EngineError::Stopped)?;
        response.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => EngineError::Timeout,
            RecvTimeoutError::Disconnected => EngineError::Stopped,
        })
    }

    fn change_membership(
        &self,
        change: MembershipChange,
        prev_index: u64,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let deadline = Instant::now() + timeout;
        self.call(timeout, |respond_to| Request::ChangeMembership {
            change,
            prev_index,
            deadline,
            respond_to,
        })?
    }
}

impl ConsensusEngine for RaftHandle {
    fn apply(&self, command: Vec<u8>, timeout: Duration) -> Result<(), EngineError> {
        let deadline = Instant::now() + timeout;
        self.call(timeout, |respond_to| Request::Propose {
            data: command,
            deadline,
            respond_to,
        })?
    }

    fn state(&self) -> Role {
        self.observed().role
    }

    fn leader(&self) -> Option<ClusterMember> {
        self.observed().leader
    }

    fn configuration(&self) -> Result<Configuration, EngineError> {
        self.call(QUERY_TIMEOUT, |respond_to| Request::Configuration {
            respond_to,
        })
    }

    fn add_voter(
        &self,
        id: &str,
        address: &str,
        prev_index: u64,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let member = ClusterMember::new(id, address);
        self.change_membership(MembershipChange::Add(member), prev_index, timeout)
    }

    fn remove_server(
        &self,
        id: &str,
        prev_index: u64,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.change_membership(MembershipChange::Remove(id.to_string()), prev_index, timeout)
    }

    fn bootstrap_cluster(&self, configuration: Configuration) -> Result<(), EngineError> {
        self.call(QUERY_TIMEOUT, |respond_to| Request::Bootstrap {
            configuration,
            respond_to,
        })?
    }
}

/// Starts a node: binds the Raft listener, restores local snapshots and
/// spawns the worker.
///
/// The returned receiver yields a [`Halt`] if the worker stops on its own,
/// most importantly when a committed entry cannot be applied.
pub fn spawn_node(config: &NodeConfig, fsm: Arc<KvFsm>) -> Result<(RaftHandle, Receiver<Halt>)> {
    config.validate()?;
    let node = RaftNode::new(config, fsm)?;

    let listener = TcpListener::bind(&config.raft_addr)
        .with_context(|| format!("failed to bind raft address {}", config.raft_addr))?;
    let (inbound_tx, inbound_rx) = unbounded();
    transport::spawn_listener(listener, inbound_tx)?;

    let (request_tx, request_rx) = unbounded();
    let (halt_tx, halt_rx) = bounded(1);
    let observed = Arc::new(Mutex::new(Observed {
        role: node.role(),
        leader: node.leader(),
    }));

    let mut worker = Worker::new(
        node,
        &config.raft_addr,
        request_rx,
        inbound_rx,
        Arc::clone(&observed),
    );
    let shared = Arc::clone(&observed);
    thread::Builder::new()
        .name(format!("raft-worker-{}", config.node_id))
        .spawn(move || {
            if let Err(err) = worker.run() {
                if err.downcast_ref::<ApplyError>().is_some() {
                    error!(error = %format!("{err:#}"), "apply stream halted");
                } else {
                    error!(error = %format!("{err:#}"), "raft worker crashed");
                }
                *shared.lock().unwrap_or_else(PoisonError::into_inner) = Observed {
                    role: Role::Follower,
                    leader: None,
                };
                let _ = halt_tx.send(Halt {
                    reason: format!("{err:#}"),
                });
            }
        })
        .context("failed to spawn raft worker")?;

    Ok((
        RaftHandle {
            requests: request_tx,
            observed,
        },
        halt_rx,
    ))
}

struct Worker {
    node: RaftNode,
    requests: Receiver<Request>,
    inbound: Receiver<Inbound>,
    snapshot_tx: Sender<Result<Snapshot>>,
    snapshot_rx: Receiver<Result<Snapshot>>,
    outbox: Outbox,
    /// Addresses learned from inbound frames, for peers not (yet) in the
    /// applied configuration.
    routes: HashMap<u64, String>,
    pending: BTreeMap<u64, Pending>,
    observed: Arc<Mutex<Observed>>,
    last_role: Role,
    last_leader: u64,
}

impl Worker {
    fn new(
        node: RaftNode,
        raft_addr: &str,
        requests: Receiver<Request>,
        inbound: Receiver<Inbound>,
        observed: Arc<Mutex<Observed>>,
    ) -> Self {
        let (snapshot_tx, snapshot_rx) = unbounded();
        let last_role = node.role();
        let last_leader = node.leader_id();
        Self {
            node,
            requests,
            inbound,
            snapshot_tx,
            snapshot_rx,
            outbox: Outbox::new(raft_addr),
            routes: HashMap::new(),
            pending: BTreeMap::new(),
            observed,
            last_role,
            last_leader,
        }
    }

    /// Runs the event loop until shutdown or a fatal error.
    ///
    /// Each iteration waits for at most one event, ticks if a tick is due,
    /// drains ready state and publishes the resulting role.
    fn run(&mut self) -> Result<()> {
        let mut last_tick = Instant::now();
        loop {
            let timeout = TICK_INTERVAL
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::ZERO);

            crossbeam_channel::select! {
                recv(self.requests) -> req => match req {
                    Ok(Request::Shutdown) | Err(_) => {
                        info!("raft worker shutting down");
                        return Ok(());
                    }
                    Ok(req) => self.handle_request(req)?,
                },
                recv(self.inbound) -> inbound => {
                    if let Ok(inbound) = inbound {
                        self.handle_inbound(inbound);
                    }
                }
                recv(self.snapshot_rx) -> outcome => {
                    if let Ok(outcome) = outcome {
                        self.node.install_snapshot(outcome)?;
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.node.tick();
                self.expire_pending();
                last_tick = Instant::now();
            }

            self.process_ready()?;
            self.observe();
        }
    }

    fn handle_request(&mut self, req: Request) -> Result<()> {
        match req {
            Request::Propose {
                data,
                deadline,
                respond_to,
            } => match self.node.propose(data) {
                Ok(proposal) => {
                    self.track(proposal, ProposalKind::Command, deadline, respond_to)
                }
                Err(err) => {
                    let _ = respond_to.send(Err(err));
                }
            },
            Request::ChangeMembership {
                change,
                prev_index,
                deadline,
                respond_to,
            } => {
                let actual = self.node.config_index();
                if prev_index != 0 && prev_index != actual {
                    let _ = respond_to.send(Err(EngineError::ConfigurationChanged {
                        expected: prev_index,
                        actual,
                    }));
                    return Ok(());
                }
                match self.node.propose_membership(change) {
                    Ok(proposal) => {
                        self.track(proposal, ProposalKind::Membership, deadline, respond_to)
                    }
                    Err(err) => {
                        let _ = respond_to.send(Err(err));
                    }
                }
            }
            Request::Configuration { respond_to } => {
                let _ = respond_to.send(self.node.configuration());
            }
            Request::Bootstrap {
                configuration,
                respond_to,
            } => {
                let result = self.node.bootstrap(&configuration).map_err(|err| {
                    err.downcast_ref::<EngineError>()
                        .cloned()
                        .unwrap_or_else(|| EngineError::Rejected(format!("{err:#}")))
                });
                let _ = respond_to.send(result);
            }
            Request::Shutdown => {}
        }
        Ok(())
    }

    fn track(
        &mut self,
        proposal: Proposal,
        kind: ProposalKind,
        deadline: Instant,
        respond_to: Reply,
    ) {
        debug!(index = proposal.index, term = proposal.term, ?kind, "proposal appended");
        self.pending.insert(
            proposal.index,
            Pending {
                term: proposal.term,
                kind,
                deadline,
                respond_to,
            },
        );
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        let Inbound { from_addr, message } = inbound;
        if self.routes.get(&message.from) != Some(&from_addr) {
            debug!(peer = message.from, addr = %from_addr, "learned peer address");
            self.routes.insert(message.from, from_addr);
        }
        if let Err(err) = self.node.step(message) {
            debug!(error = %format!("{err:#}"), "ignored raft message");
        }
    }

    /// Drains all ready state from Raft.
    ///
    /// Messages go out before callers are answered so replication is not
    /// held up by client bookkeeping.
    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch(msg)?;
            }
            for applied in bundle.applied {
                self.resolve(applied);
            }
            if let Some(job) = bundle.snapshot {
                self.spawn_snapshot(job)?;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, msg: Message) -> Result<()> {
        if msg.to == self.node.id() {
            if let Err(err) = self.node.step(msg) {
                debug!(error = %format!("{err:#}"), "ignored local raft message");
            }
            return Ok(());
        }

        let to = msg.to;
        let addr = self
            .node
            .member_address(to)
            .map(str::to_string)
            .or_else(|| self.routes.get(&to).cloned());
        match addr {
            Some(addr) => self.outbox.send(&addr, &msg),
            None => debug!(peer = to, "no address for peer, dropping message"),
        }
        Ok(())
    }

    fn resolve(&mut self, applied: Applied) {
        let Some(pending) = self.pending.remove(&applied.index) else {
            return;
        };
        let result = if pending.term != applied.term {
            // Another leader's entry replaced ours at this index.
            Err(EngineError::LeadershipLost)
        } else {
            match (pending.kind, applied.kind) {
                (ProposalKind::Command, AppliedKind::Command)
                | (ProposalKind::Membership, AppliedKind::Membership) => Ok(()),
                (ProposalKind::Membership, AppliedKind::Empty) => Err(EngineError::Rejected(
                    "configuration change was not applied".into(),
                )),
                (kind, found) => Err(EngineError::Rejected(format!(
                    "expected {kind:?} entry at index {}, found {found:?}",
                    applied.index
                ))),
            }
        };
        let _ = pending.respond_to.send(result);
    }

    fn spawn_snapshot(&mut self, job: SnapshotJob) -> Result<()> {
        let index = job.index();
        let tx = self.snapshot_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("raft-snapshot-{index}"))
            .spawn(move || {
                let _ = tx.send(job.run());
            });
        if let Err(err) = spawned {
            self.node
                .install_snapshot(Err(err).context("failed to spawn snapshot thread"))?;
        }
        Ok(())
    }

    fn expire_pending(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(index, _)| *index)
            .collect();
        for index in expired {
            if let Some(pending) = self.pending.remove(&index) {
                let _ = pending.respond_to.send(Err(EngineError::Timeout));
            }
        }
    }

    fn fail_pending(&mut self, err: EngineError) {
        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.respond_to.send(Err(err.clone()));
        }
    }

    /// Publishes role and leader, and fails waiting proposals when this node
    /// stops being leader.
    fn observe(&mut self) {
        let role = self.node.role();
        let leader_id = self.node.leader_id();
        if role != self.last_role {
            info!(
                from = %self.last_role,
                to = %role,
                term = self.node.term(),
                "role changed"
            );
            if self.last_role == Role::Leader && !self.pending.is_empty() {
                warn!(pending = self.pending.len(), "leadership lost with proposals in flight");
                self.fail_pending(EngineError::LeadershipLost);
            }
            self.last_role = role;
        }
        if leader_id != self.last_leader {
            match self.node.leader() {
                Some(leader) => info!(leader = %leader, "leader changed"),
                None => info!(leader = leader_id, "leader unknown"),
            }
            self.last_leader = leader_id;
        }

        *self.observed.lock().unwrap_or_else(PoisonError::into_inner) = Observed {
            role,
            leader: self.node.leader(),
        };
    }
}
