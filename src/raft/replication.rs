// Log replication.
//
// The leader ships AppendEntries batches from each peer's next_index and
// advances the commit index once a quorum confirms an entry from the current
// term. Followers enforce the log-matching property and answer failed
// consistency checks with conflict hints so the leader's back-off skips a
// whole term at a time instead of decrementing one index per round trip.

use crate::error::{RaftError, Result};
use crate::log::{EntryPayload, LogEntry, RaftLog};
use crate::message::{AppendEntriesArgs, AppendEntriesReply, Message};
use crate::observer::RaftEvent;
use crate::raft::{LogIndex, NodeCommand, NodeContext, NodeId, RaftRole, RaftState, Term};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Ticker task: drives periodic heartbeats while this node leads.
pub(crate) async fn run_heartbeat_ticker(ctx: Arc<NodeContext>, cmd_tx: mpsc::Sender<NodeCommand>) {
    let mut shutdown_rx = ctx.shutdown_tx.subscribe();
    let mut interval = tokio::time::interval(ctx.config.heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = interval.tick() => {
                let is_leader = ctx.state.read().await.role == RaftRole::Leader;
                if is_leader && cmd_tx.send(NodeCommand::HeartbeatTick).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Highest index beyond `commit_index` that a quorum has replicated and that
/// belongs to the current term. Entries from earlier terms are only ever
/// committed indirectly through such an index.
pub(crate) fn compute_commit_index(state: &RaftState, log: &RaftLog) -> Option<LogIndex> {
    let quorum = state.quorum();
    let mut best = None;
    for candidate in (state.commit_index + 1)..=log.last_index() {
        // The leader's own log always holds the entry.
        let mut replicas = 1;
        for (peer, matched) in &state.match_index {
            if state.members.contains(peer) && *matched >= candidate {
                replicas += 1;
            }
        }
        if replicas >= quorum && log.term_at(candidate) == Some(state.current_term) {
            best = Some(candidate);
        }
    }
    best
}

enum AppendOutcome {
    /// Stale or impossible request; reply without touching timers.
    Stale(AppendEntriesReply),

    /// Consistency check failed; the leader is still alive.
    Rejected(AppendEntriesReply),

    Accepted {
        reply: AppendEntriesReply,
        to_store: Vec<LogEntry>,
        delete_from: Option<LogIndex>,
        new_commit: Option<LogIndex>,
    },
}

pub(crate) struct ReplicationManager {
    ctx: Arc<NodeContext>,
}

impl ReplicationManager {
    pub(crate) fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    pub(crate) async fn handle_heartbeat_tick(&self) -> Result<()> {
        self.broadcast_append().await
    }

    /// Send AppendEntries to every peer (empty batches double as
    /// heartbeats). No-op unless this node leads.
    pub(crate) async fn broadcast_append(&self) -> Result<()> {
        let peers = {
            let state = self.ctx.state.read().await;
            if state.role != RaftRole::Leader {
                return Ok(());
            }
            state.peers(&self.ctx.id)
        };
        for peer in peers {
            self.send_append_to(&peer).await?;
        }
        Ok(())
    }

    async fn send_append_to(&self, peer: &NodeId) -> Result<()> {
        let ctx = &self.ctx;
        let args = {
            let state = ctx.state.read().await;
            if state.role != RaftRole::Leader {
                return Ok(());
            }
            let log = ctx.log.read().await;
            let mut next = state.next_index.get(peer).copied().unwrap_or(log.last_index() + 1);
            if next < log.first_index() {
                // The entries this peer needs were compacted away; without
                // cross-node snapshot installation the best we can do is
                // resume at the boundary and hope its log reaches it.
                tracing::warn!(
                    node_id = %ctx.id,
                    peer = %peer,
                    next_index = next,
                    first_index = log.first_index(),
                    "peer is behind the compaction horizon"
                );
                next = log.first_index();
            }
            let prev_log_index = next - 1;
            let prev_log_term = log.term_at(prev_log_index).unwrap_or(0);
            let entries = log.entries_from(next, ctx.config.max_entries_per_append);
            AppendEntriesArgs {
                term: state.current_term,
                leader_id: ctx.id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: state.commit_index,
            }
        };

        tracing::trace!(
            node_id = %ctx.id,
            peer = %peer,
            prev_log_index = args.prev_log_index,
            entries = args.entries.len(),
            leader_commit = args.leader_commit,
            "sending append entries"
        );
        ctx.send_spawned(peer.clone(), Message::AppendEntries(args));
        Ok(())
    }

    /// AppendEntries receiver side (follower or candidate).
    pub(crate) async fn handle_append_entries(
        &self,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesReply> {
        let ctx = &self.ctx;
        let (outcome, term_changed) = {
            let mut state = ctx.state.write().await;

            if args.term < state.current_term {
                (AppendOutcome::Stale(reject(state.current_term, 0, 0)), false)
            } else if state.role == RaftRole::Leader && args.term == state.current_term {
                // Two leaders in one term would violate election safety;
                // this can only be a stray echo. Refuse it.
                tracing::warn!(
                    node_id = %ctx.id,
                    leader = %args.leader_id,
                    term = args.term,
                    "append entries from another leader in our own term"
                );
                (AppendOutcome::Stale(reject(state.current_term, 0, 0)), false)
            } else {
                let term_changed =
                    if args.term > state.current_term || state.role != RaftRole::Follower {
                        ctx.become_follower_locked(&mut state, args.term)
                    } else {
                        false
                    };
                if state.leader_id.as_ref() != Some(&args.leader_id) {
                    state.leader_id = Some(args.leader_id.clone());
                    ctx.emit(RaftEvent::LeaderChanged {
                        node: ctx.id.clone(),
                        leader: Some(args.leader_id.clone()),
                        term: state.current_term,
                    });
                }

                let mut log = ctx.log.write().await;

                // Consistency check against the entry preceding the batch.
                // prev_log_index 0 always matches the sentinel.
                let rejection = if args.prev_log_index == 0 {
                    None
                } else {
                    match log.term_at(args.prev_log_index) {
                        Some(term) if term == args.prev_log_term => None,
                        Some(term) => {
                            let conflict_index =
                                log.first_index_of_term(term, args.prev_log_index);
                            Some(reject(state.current_term, conflict_index, term))
                        }
                        None => Some(reject(state.current_term, log.last_index() + 1, 0)),
                    }
                };

                match rejection {
                    Some(reply) => (AppendOutcome::Rejected(reply), term_changed),
                    None => {
                        // Conflict resolution: drop divergent suffixes, keep
                        // matching prefixes, append what is new.
                        let mut to_store = Vec::new();
                        let mut delete_from = None;
                        for entry in &args.entries {
                            let index = entry.index;
                            if index < log.first_index() {
                                // Compacted, necessarily committed and matching.
                                continue;
                            }
                            if index <= log.last_index() {
                                if log.term_at(index) != Some(entry.term) {
                                    log.truncate_from(index)?;
                                    delete_from = Some(index);
                                    log.append(entry.clone())?;
                                    to_store.push(entry.clone());
                                }
                            } else {
                                log.append(entry.clone())?;
                                to_store.push(entry.clone());
                            }
                        }

                        let match_index = args.prev_log_index + args.entries.len() as u64;
                        let mut new_commit = None;
                        if args.leader_commit > state.commit_index {
                            state.commit_index = args.leader_commit.min(log.last_index());
                            new_commit = Some(state.commit_index);
                        }

                        let reply = AppendEntriesReply {
                            term: state.current_term,
                            success: true,
                            match_index,
                            conflict_index: 0,
                            conflict_term: 0,
                        };
                        (
                            AppendOutcome::Accepted { reply, to_store, delete_from, new_commit },
                            term_changed,
                        )
                    }
                }
            }
        };

        match outcome {
            AppendOutcome::Stale(reply) => Ok(reply),
            AppendOutcome::Rejected(reply) => {
                if term_changed {
                    ctx.persist_term_and_vote(reply.term, None)?;
                }
                // The leader is alive even though our logs disagree.
                ctx.timer.reset();
                Ok(reply)
            }
            AppendOutcome::Accepted { reply, to_store, delete_from, new_commit } => {
                // Durability barrier before acknowledging.
                if term_changed {
                    ctx.persist_term_and_vote(reply.term, None)?;
                }
                if let Some(from_index) = delete_from {
                    let disk_last = ctx.storage.last_index()?;
                    if disk_last >= from_index {
                        ctx.storage.delete_range(from_index, disk_last)?;
                    }
                }
                ctx.storage.store_logs(&to_store)?;
                ctx.timer.reset();

                if let Some(commit_index) = new_commit {
                    ctx.emit(RaftEvent::CommitAdvanced { node: ctx.id.clone(), commit_index });
                    ctx.apply_notify.notify_one();
                }
                Ok(reply)
            }
        }
    }

    /// AppendEntries reply processing (leader side).
    pub(crate) async fn handle_append_reply(
        &self,
        from: &NodeId,
        reply: &AppendEntriesReply,
    ) -> Result<()> {
        let ctx = &self.ctx;
        let mut resend = false;
        let mut adopted_term = None;

        {
            let mut state = ctx.state.write().await;

            if reply.term > state.current_term {
                ctx.become_follower_locked(&mut state, reply.term);
                adopted_term = Some(state.current_term);
            } else if state.role != RaftRole::Leader || reply.term != state.current_term {
                // Stale reply from an earlier term or reign; drop it.
            } else if reply.success {
                let log = ctx.log.read().await;
                let confirmed = reply.match_index.min(log.last_index());
                let matched = state.match_index.entry(from.clone()).or_insert(0);
                // match_index is monotonic while the term holds; replies can
                // arrive out of order.
                if confirmed > *matched {
                    *matched = confirmed;
                }
                let matched = *matched;
                state.next_index.insert(from.clone(), matched + 1);

                if let Some(commit_index) = compute_commit_index(&state, &log) {
                    state.commit_index = commit_index;
                    tracing::debug!(node_id = %ctx.id, commit_index, "advanced commit index");
                    ctx.emit(RaftEvent::CommitAdvanced { node: ctx.id.clone(), commit_index });
                    ctx.apply_notify.notify_one();
                }
                if matched < log.last_index() {
                    // More entries pending; keep the pipe warm.
                    resend = true;
                }
            } else {
                // Consistency check failed: back next_index off using the
                // conflict hint and retry immediately.
                let log = ctx.log.read().await;
                let hinted = if reply.conflict_term == 0 {
                    reply.conflict_index
                } else if let Some(index) = log.last_index_of_term(reply.conflict_term) {
                    index + 1
                } else {
                    reply.conflict_index
                };
                let floor = state.match_index.get(from).copied().unwrap_or(0) + 1;
                let next = hinted.max(1).clamp(floor, log.last_index() + 1);
                tracing::debug!(
                    node_id = %ctx.id,
                    peer = %from,
                    next_index = next,
                    conflict_index = reply.conflict_index,
                    conflict_term = reply.conflict_term,
                    "append rejected, backing off"
                );
                state.next_index.insert(from.clone(), next);
                resend = true;
            }
        }

        if let Some(term) = adopted_term {
            ctx.persist_term_and_vote(term, None)?;
            ctx.timer.reset();
        }
        if resend {
            self.send_append_to(from).await?;
        }
        Ok(())
    }

    /// Leader-side command submission: assign the next index, persist, and
    /// (for single-node clusters) advance the commit immediately. The caller
    /// triggers replication right after.
    pub(crate) async fn propose(&self, payload: EntryPayload) -> Result<(LogIndex, Term)> {
        let ctx = &self.ctx;
        let (entry, term) = {
            let state = ctx.state.read().await;
            if state.role != RaftRole::Leader {
                return Err(RaftError::NotLeader { leader: state.leader_id.clone() });
            }
            let mut log = ctx.log.write().await;
            let index = log.last_index() + 1;
            let entry = LogEntry::new(state.current_term, index, payload);
            log.append(entry.clone())?;
            (entry, state.current_term)
        };

        ctx.storage.store_logs(&[entry.clone()])?;
        tracing::debug!(node_id = %ctx.id, index = entry.index, term, "appended proposal");

        {
            let mut state = ctx.state.write().await;
            if state.role == RaftRole::Leader && state.current_term == term {
                let log = ctx.log.read().await;
                if let Some(commit_index) = compute_commit_index(&state, &log) {
                    drop(log);
                    state.commit_index = commit_index;
                    ctx.emit(RaftEvent::CommitAdvanced { node: ctx.id.clone(), commit_index });
                    ctx.apply_notify.notify_one();
                }
            }
        }

        Ok((entry.index, term))
    }
}

fn reject(term: Term, conflict_index: LogIndex, conflict_term: Term) -> AppendEntriesReply {
    AppendEntriesReply { term, success: false, match_index: 0, conflict_index, conflict_term }
}
