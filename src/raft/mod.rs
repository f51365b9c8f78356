// Raft node core.
//
// Concurrency model: one event-loop task serializes every state transition
// (incoming RPCs, client proposals, timer fires); timers and outbound sends
// run as independent tasks feeding it; a dedicated apply task owns the FSM.
// Shared state lives behind async RwLocks for the read-side API, but the
// locks are never held across transport or storage I/O: handlers mutate
// memory, drop the guards, persist, then reply.

pub mod election;
pub mod replication;

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::fsm::Fsm;
use crate::log::{EntryPayload, RaftLog};
use crate::message::Message;
use crate::observer::{EventBus, RaftEvent, RaftMetrics};
use crate::storage::{SnapshotBlob, Storage};
use crate::transport::{Envelope, Transport};
use election::{ElectionManager, ElectionTimer};
use replication::ReplicationManager;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Notify, RwLock};
use tokio::task::JoinHandle;

/// Opaque, stable node identifier.
pub type NodeId = String;

/// Monotonic election epoch.
pub type Term = u64;

/// 1-based log position; 0 is the synthetic sentinel.
pub type LogIndex = u64;

/// Role of a node within its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    /// Passively replicates the leader's log.
    Follower,

    /// Requesting votes for leadership.
    Candidate,

    /// Drives replication and commit advancement.
    Leader,
}

impl fmt::Display for RaftRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// Mutable consensus state, guarded by the core lock.
#[derive(Debug)]
pub(crate) struct RaftState {
    pub role: RaftRole,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub members: HashSet<NodeId>,
    pub next_index: HashMap<NodeId, LogIndex>,
    pub match_index: HashMap<NodeId, LogIndex>,
    pub votes_received: HashSet<NodeId>,
}

impl RaftState {
    pub(crate) fn new(members: HashSet<NodeId>) -> Self {
        Self {
            role: RaftRole::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            commit_index: 0,
            last_applied: 0,
            members,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: HashSet::new(),
        }
    }

    /// Strict majority of the current member set.
    pub(crate) fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub(crate) fn peers(&self, self_id: &NodeId) -> Vec<NodeId> {
        self.members.iter().filter(|id| *id != self_id).cloned().collect()
    }
}

/// Shared context handed to the managers and background tasks.
pub(crate) struct NodeContext {
    pub id: NodeId,
    pub config: RaftConfig,
    pub state: RwLock<RaftState>,
    pub log: RwLock<RaftLog>,
    pub storage: Arc<dyn Storage>,
    pub transport: Arc<dyn Transport>,
    pub events: EventBus,
    pub apply_notify: Notify,
    pub shutdown_tx: watch::Sender<bool>,
    pub timer: ElectionTimer,
}

impl NodeContext {
    pub(crate) fn emit(&self, event: RaftEvent) {
        self.events.emit(event);
    }

    /// Revert to follower, adopting `term` if it is newer. Mutates memory
    /// only; the caller persists term/vote after dropping the lock and
    /// resets the election timer when this returns true.
    pub(crate) fn become_follower_locked(&self, state: &mut RaftState, term: Term) -> bool {
        let term_changed = term > state.current_term;
        if term_changed {
            state.current_term = term;
            state.voted_for = None;
            self.emit(RaftEvent::TermAdvanced { node: self.id.clone(), term });
        }
        if state.role != RaftRole::Follower {
            let from = state.role;
            state.role = RaftRole::Follower;
            tracing::info!(
                node_id = %self.id,
                term = state.current_term,
                from = %from,
                "stepping down to follower"
            );
            self.emit(RaftEvent::RoleChanged {
                node: self.id.clone(),
                from,
                to: RaftRole::Follower,
                term: state.current_term,
            });
        }
        state.leader_id = None;
        state.votes_received.clear();
        term_changed
    }

    /// Durability barrier for term and vote.
    pub(crate) fn persist_term_and_vote(&self, term: Term, vote: Option<&NodeId>) -> Result<()> {
        self.storage.set_current_term(term)?;
        self.storage.set_voted_for(vote)?;
        Ok(())
    }

    pub(crate) fn send_spawned(self: &Arc<Self>, target: NodeId, message: Message) {
        let transport = self.transport.clone();
        let node_id = self.id.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.send(&target, message).await {
                tracing::trace!(node_id = %node_id, target = %target, error = %e, "send failed");
            }
        });
    }

    fn fatal(&self, error: &RaftError) {
        tracing::error!(node_id = %self.id, error = %error, "fatal error, shutting node down");
        let _ = self.shutdown_tx.send(true);
    }
}

/// Commands routed from the public API into the event loop.
pub(crate) enum NodeCommand {
    Propose {
        payload: EntryPayload,
        reply: oneshot::Sender<Result<(LogIndex, Term)>>,
    },
    TransferLeadership {
        target: NodeId,
        reply: oneshot::Sender<Result<()>>,
    },
    ElectionTimeout,
    HeartbeatTick,
}

struct SnapshotRequest {
    reply: oneshot::Sender<Result<LogIndex>>,
}

/// A running Raft node.
pub struct RaftNode {
    ctx: Arc<NodeContext>,
    cmd_tx: mpsc::Sender<NodeCommand>,
    snap_tx: mpsc::Sender<SnapshotRequest>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl RaftNode {
    /// Recover durable state and start the node's background tasks.
    pub async fn start(
        config: RaftConfig,
        mut fsm: Box<dyn Fsm>,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;

        let members: HashSet<NodeId> = config.members().into_iter().collect();
        let mut state = RaftState::new(members);
        state.current_term = storage.current_term()?;
        state.voted_for = storage.voted_for()?;

        let mut log = RaftLog::new();
        if let Some(bytes) = storage.snapshot()? {
            let blob = SnapshotBlob::decode(&bytes)
                .map_err(|e| RaftError::Corrupt(format!("snapshot envelope: {e}")))?;
            fsm.restore(&blob.data)?;
            log.reset_to_snapshot(blob.last_included_index, blob.last_included_term);
            state.commit_index = blob.last_included_index;
            state.last_applied = blob.last_included_index;
        }
        let disk_last = storage.last_index()?;
        if disk_last > 0 {
            for index in storage.first_index()?.max(log.first_index())..=disk_last {
                log.append(storage.log_entry(index)?)?;
            }
        }

        tracing::info!(
            node_id = %config.node_id,
            term = state.current_term,
            last_log_index = log.last_index(),
            commit_index = state.commit_index,
            members = state.members.len(),
            "starting raft node"
        );

        let (shutdown_tx, _) = watch::channel(false);
        let timer = ElectionTimer::new(&config);
        let ctx = Arc::new(NodeContext {
            id: config.node_id.clone(),
            config,
            state: RwLock::new(state),
            log: RwLock::new(log),
            storage,
            transport,
            events: EventBus::new(),
            apply_notify: Notify::new(),
            shutdown_tx,
            timer,
        });

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (snap_tx, snap_rx) = mpsc::channel(4);

        ctx.timer.reset();
        let tasks = vec![
            tokio::spawn(run_event_loop(ctx.clone(), cmd_rx)),
            tokio::spawn(run_apply_loop(ctx.clone(), fsm, snap_rx)),
            tokio::spawn(election::run_election_ticker(ctx.clone(), cmd_tx.clone())),
            tokio::spawn(replication::run_heartbeat_ticker(ctx.clone(), cmd_tx.clone())),
        ];

        Ok(Self { ctx, cmd_tx, snap_tx, tasks: parking_lot::Mutex::new(tasks) })
    }

    /// Submit an application command. Returns the assigned log position;
    /// commit and apply are reported asynchronously through the observer
    /// channel.
    pub async fn submit(&self, command: Vec<u8>) -> Result<(LogIndex, Term)> {
        self.propose(EntryPayload::Command(command)).await
    }

    /// Propose adding a voting member (leader only).
    pub async fn add_voter(&self, id: NodeId) -> Result<(LogIndex, Term)> {
        if id.is_empty() {
            return Err(RaftError::InvalidArgument("voter id cannot be empty".to_string()));
        }
        self.propose(EntryPayload::AddVoter(id)).await
    }

    /// Propose removing a member (leader only).
    pub async fn remove_server(&self, id: NodeId) -> Result<(LogIndex, Term)> {
        self.propose(EntryPayload::RemoveServer(id)).await
    }

    async fn propose(&self, payload: EntryPayload) -> Result<(LogIndex, Term)> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(NodeCommand::Propose { payload, reply: tx })
            .await
            .map_err(|_| RaftError::Cancelled)?;
        rx.await.map_err(|_| RaftError::Cancelled)?
    }

    pub async fn get_state(&self) -> (Term, RaftRole) {
        let state = self.ctx.state.read().await;
        (state.current_term, state.role)
    }

    pub async fn is_leader(&self) -> bool {
        self.ctx.state.read().await.role == RaftRole::Leader
    }

    pub async fn leader_id(&self) -> Option<NodeId> {
        self.ctx.state.read().await.leader_id.clone()
    }

    pub async fn members(&self) -> Vec<NodeId> {
        let state = self.ctx.state.read().await;
        let mut members: Vec<NodeId> = state.members.iter().cloned().collect();
        members.sort();
        members
    }

    /// Point-in-time metrics for the observation bridge.
    pub async fn metrics(&self) -> RaftMetrics {
        let state = self.ctx.state.read().await;
        let log = self.ctx.log.read().await;
        let mut peers = state.peers(&self.ctx.id);
        peers.sort();
        RaftMetrics {
            node_id: self.ctx.id.clone(),
            role: state.role,
            term: state.current_term,
            last_log_index: log.last_index(),
            last_log_term: log.last_term(),
            commit_index: state.commit_index,
            applied_index: state.last_applied,
            leader: state.leader_id.clone(),
            voted_for: state.voted_for.clone(),
            peers,
            num_logs: log.last_index(),
            pending_logs: log.last_index().saturating_sub(state.last_applied),
        }
    }

    /// Hand leadership to a caught-up member and step down.
    pub async fn transfer_leadership(&self, target: NodeId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(NodeCommand::TransferLeadership { target, reply: tx })
            .await
            .map_err(|_| RaftError::Cancelled)?;
        rx.await.map_err(|_| RaftError::Cancelled)?
    }

    /// Capture an FSM snapshot at the applied index, persist it, and compact
    /// the log prefix it covers. Returns the last included index.
    pub async fn snapshot(&self) -> Result<LogIndex> {
        let (tx, rx) = oneshot::channel();
        self.snap_tx
            .send(SnapshotRequest { reply: tx })
            .await
            .map_err(|_| RaftError::Cancelled)?;
        rx.await.map_err(|_| RaftError::Cancelled)?
    }

    /// Subscribe to state-change events.
    pub fn subscribe(&self) -> mpsc::Receiver<RaftEvent> {
        self.ctx.events.subscribe(self.ctx.config.apply_channel_capacity)
    }

    /// Stop the node: signal every task, close the transport, and wait for
    /// the tasks to drain. Pending submissions observe `Cancelled`.
    pub async fn shutdown(&self) {
        tracing::info!(node_id = %self.ctx.id, "shutting down raft node");
        let _ = self.ctx.shutdown_tx.send(true);
        self.ctx.transport.shutdown().await;
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
    }
}

/// Serialized handler loop: every state transition happens here.
async fn run_event_loop(ctx: Arc<NodeContext>, mut cmd_rx: mpsc::Receiver<NodeCommand>) {
    let election = ElectionManager::new(ctx.clone());
    let replication = ReplicationManager::new(ctx.clone());
    let mut shutdown_rx = ctx.shutdown_tx.subscribe();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            incoming = ctx.transport.recv() => match incoming {
                Some(envelope) => {
                    if let Err(e) = dispatch(&ctx, &election, &replication, envelope).await {
                        ctx.fatal(&e);
                        break;
                    }
                }
                None => {
                    // Transport closed underneath us; nothing more to serve.
                    let _ = ctx.shutdown_tx.send(true);
                    break;
                }
            },
            command = cmd_rx.recv() => match command {
                Some(command) => {
                    if let Err(e) = handle_command(&ctx, &election, &replication, command).await {
                        ctx.fatal(&e);
                        break;
                    }
                }
                None => break,
            },
        }
    }
}

async fn dispatch(
    ctx: &Arc<NodeContext>,
    election: &ElectionManager,
    replication: &ReplicationManager,
    envelope: Envelope,
) -> Result<()> {
    tracing::trace!(
        node_id = %ctx.id,
        from = %envelope.from,
        kind = envelope.message.kind(),
        "handling message"
    );
    match envelope.message {
        Message::RequestVote(args) => {
            let reply = election.handle_vote_request(&args).await?;
            ctx.send_spawned(envelope.from, Message::RequestVoteReply(reply));
        }
        Message::RequestVoteReply(reply) => {
            let became_leader = election.handle_vote_reply(&envelope.from, &reply).await?;
            if became_leader {
                // Assert leadership immediately instead of waiting a tick.
                replication.broadcast_append().await?;
            }
        }
        Message::AppendEntries(args) => {
            let reply = replication.handle_append_entries(args).await?;
            ctx.send_spawned(envelope.from, Message::AppendEntriesReply(reply));
        }
        Message::AppendEntriesReply(reply) => {
            replication.handle_append_reply(&envelope.from, &reply).await?;
        }
    }
    Ok(())
}

async fn handle_command(
    ctx: &Arc<NodeContext>,
    election: &ElectionManager,
    replication: &ReplicationManager,
    command: NodeCommand,
) -> Result<()> {
    match command {
        NodeCommand::Propose { payload, reply } => {
            match replication.propose(payload).await {
                Ok(assigned) => {
                    let _ = reply.send(Ok(assigned));
                    replication.broadcast_append().await?;
                }
                Err(e) if client_error(&e) => {
                    let _ = reply.send(Err(e));
                }
                Err(e) => {
                    let _ = reply.send(Err(RaftError::Cancelled));
                    return Err(e);
                }
            }
        }
        NodeCommand::TransferLeadership { target, reply } => {
            match transfer_leadership(ctx, target).await {
                Ok(()) => {
                    let _ = reply.send(Ok(()));
                }
                Err(e) if client_error(&e) => {
                    let _ = reply.send(Err(e));
                }
                Err(e) => {
                    let _ = reply.send(Err(RaftError::Cancelled));
                    return Err(e);
                }
            }
        }
        NodeCommand::ElectionTimeout => {
            let became_leader = election.handle_election_timeout().await?;
            if became_leader {
                replication.broadcast_append().await?;
            }
        }
        NodeCommand::HeartbeatTick => {
            replication.handle_heartbeat_tick().await?;
        }
    }
    Ok(())
}

/// Errors returned to the caller rather than treated as node-fatal.
fn client_error(error: &RaftError) -> bool {
    matches!(
        error,
        RaftError::NotLeader { .. }
            | RaftError::Cancelled
            | RaftError::InvalidArgument(_)
            | RaftError::InvalidState(_)
    )
}

async fn transfer_leadership(ctx: &Arc<NodeContext>, target: NodeId) -> Result<()> {
    let mut state = ctx.state.write().await;
    if state.role != RaftRole::Leader {
        return Err(RaftError::NotLeader { leader: state.leader_id.clone() });
    }
    if target == ctx.id {
        return Err(RaftError::InvalidArgument("already the leader".to_string()));
    }
    if !state.members.contains(&target) {
        return Err(RaftError::InvalidArgument(format!("{target} is not a member")));
    }
    let log = ctx.log.read().await;
    let caught_up = state.match_index.get(&target).copied().unwrap_or(0) == log.last_index();
    drop(log);
    if !caught_up {
        return Err(RaftError::InvalidState(format!("{target} is not caught up")));
    }

    tracing::info!(node_id = %ctx.id, target = %target, "transferring leadership");
    let term = state.current_term;
    ctx.become_follower_locked(&mut state, term);
    drop(state);
    ctx.timer.reset();
    Ok(())
}

/// The apply loop: sole owner of the FSM, feeding it committed entries in
/// strict index order. Also services snapshot requests so the capture is
/// consistent with `last_applied`.
async fn run_apply_loop(
    ctx: Arc<NodeContext>,
    mut fsm: Box<dyn Fsm>,
    mut snap_rx: mpsc::Receiver<SnapshotRequest>,
) {
    let mut shutdown_rx = ctx.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                // Drain whatever is already committed before exiting.
                let _ = apply_ready(&ctx, fsm.as_mut()).await;
                break;
            }
            _ = ctx.apply_notify.notified() => {
                if let Err(e) = apply_ready(&ctx, fsm.as_mut()).await {
                    ctx.fatal(&e);
                    break;
                }
            }
            request = snap_rx.recv() => match request {
                Some(request) => {
                    let result = take_snapshot(&ctx, fsm.as_ref()).await;
                    let fatal = matches!(&result, Err(e) if !client_error(e));
                    if fatal {
                        if let Err(e) = &result {
                            ctx.fatal(e);
                        }
                        let _ = request.reply.send(result);
                        break;
                    }
                    let _ = request.reply.send(result);
                }
                None => break,
            },
        }
    }
}

async fn apply_ready(ctx: &Arc<NodeContext>, fsm: &mut dyn Fsm) -> Result<()> {
    loop {
        let (next, entry) = {
            let state = ctx.state.read().await;
            if state.last_applied >= state.commit_index {
                return Ok(());
            }
            let next = state.last_applied + 1;
            let log = ctx.log.read().await;
            match log.get(next) {
                Some(entry) => (next, entry.clone()),
                None => {
                    return Err(RaftError::InvalidState(format!(
                        "committed entry {next} missing from log"
                    )))
                }
            }
        };

        match &entry.payload {
            EntryPayload::Command(command) => {
                fsm.apply(next, command)?;
            }
            EntryPayload::AddVoter(id) => apply_add_voter(ctx, id).await,
            EntryPayload::RemoveServer(id) => apply_remove_server(ctx, id).await,
        }

        {
            let mut state = ctx.state.write().await;
            state.last_applied = next;
        }
        tracing::debug!(node_id = %ctx.id, index = next, "applied entry");
        ctx.emit(RaftEvent::EntryApplied { node: ctx.id.clone(), index: next, term: entry.term });
    }
}

async fn apply_add_voter(ctx: &Arc<NodeContext>, id: &NodeId) {
    let mut state = ctx.state.write().await;
    if state.members.insert(id.clone()) {
        if state.role == RaftRole::Leader && *id != ctx.id {
            let log = ctx.log.read().await;
            state.next_index.insert(id.clone(), log.last_index() + 1);
            state.match_index.insert(id.clone(), 0);
        }
        tracing::info!(node_id = %ctx.id, voter = %id, "added voter");
        let mut members: Vec<NodeId> = state.members.iter().cloned().collect();
        members.sort();
        ctx.emit(RaftEvent::MembershipChanged { node: ctx.id.clone(), members });
    }
}

async fn apply_remove_server(ctx: &Arc<NodeContext>, id: &NodeId) {
    let mut state = ctx.state.write().await;
    if state.members.remove(id) {
        state.next_index.remove(id);
        state.match_index.remove(id);
        tracing::info!(node_id = %ctx.id, server = %id, "removed server");
        let mut members: Vec<NodeId> = state.members.iter().cloned().collect();
        members.sort();
        ctx.emit(RaftEvent::MembershipChanged { node: ctx.id.clone(), members });
    }
}

async fn take_snapshot(ctx: &Arc<NodeContext>, fsm: &dyn Fsm) -> Result<LogIndex> {
    let (last_applied, last_term) = {
        let state = ctx.state.read().await;
        let log = ctx.log.read().await;
        (state.last_applied, log.term_at(state.last_applied).unwrap_or(0))
    };
    if last_applied == 0 {
        return Err(RaftError::InvalidState("nothing applied to snapshot yet".to_string()));
    }

    let data = fsm.snapshot()?;
    let blob = SnapshotBlob {
        last_included_index: last_applied,
        last_included_term: last_term,
        data,
    };
    ctx.storage.store_snapshot(&blob.encode()?)?;

    {
        let mut log = ctx.log.write().await;
        log.compact_to(last_applied, last_term);
    }
    let disk_first = ctx.storage.first_index()?;
    if disk_first != 0 && disk_first <= last_applied {
        ctx.storage.delete_range(disk_first, last_applied)?;
    }

    tracing::info!(node_id = %ctx.id, last_included_index = last_applied, "snapshot taken");
    ctx.emit(RaftEvent::SnapshotTaken { node: ctx.id.clone(), last_included_index: last_applied });
    Ok(last_applied)
}
