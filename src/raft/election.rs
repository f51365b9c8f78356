// Leader election.
//
// Randomized election timeouts keep candidates from splitting the vote
// forever; the timer is deadline-based and sampled by a ticker task that
// feeds timeout events into the node's serialized event loop. A fire seen by
// a node that is already leader (or whose timer was reset while the event
// was queued) is a no-op.

use crate::error::Result;
use crate::message::{Message, RequestVoteArgs, RequestVoteReply};
use crate::observer::RaftEvent;
use crate::raft::{NodeCommand, NodeContext, NodeId, RaftConfig, RaftRole, RaftState};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// How often the ticker samples the election deadline.
const ELECTION_TICK: Duration = Duration::from_millis(15);

/// Randomized, resettable election deadline.
pub(crate) struct ElectionTimer {
    min: Duration,
    max: Duration,
    deadline: Mutex<Instant>,
    rng: Mutex<StdRng>,
}

impl ElectionTimer {
    pub(crate) fn new(config: &RaftConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            min: config.election_timeout_min,
            max: config.election_timeout_max,
            deadline: Mutex::new(Instant::now() + config.election_timeout_max),
            rng: Mutex::new(rng),
        }
    }

    fn sample(&self) -> Duration {
        let spread = (self.max - self.min).as_millis() as u64;
        let jitter = self.rng.lock().random_range(0..=spread);
        self.min + Duration::from_millis(jitter)
    }

    /// Push the deadline out by a fresh random timeout.
    pub(crate) fn reset(&self) {
        *self.deadline.lock() = Instant::now() + self.sample();
    }

    pub(crate) fn expired(&self) -> bool {
        Instant::now() >= *self.deadline.lock()
    }
}

/// Ticker task: turns deadline expiry into ElectionTimeout commands.
pub(crate) async fn run_election_ticker(ctx: Arc<NodeContext>, cmd_tx: mpsc::Sender<NodeCommand>) {
    let mut shutdown_rx = ctx.shutdown_tx.subscribe();
    let mut interval = tokio::time::interval(ELECTION_TICK);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = interval.tick() => {
                if !ctx.timer.expired() {
                    continue;
                }
                let eligible = {
                    let state = ctx.state.read().await;
                    state.role != RaftRole::Leader && state.members.contains(&ctx.id)
                };
                if eligible {
                    if cmd_tx.send(NodeCommand::ElectionTimeout).await.is_err() {
                        break;
                    }
                } else {
                    // Leaders do not time themselves out; keep the deadline
                    // fresh for when they step down.
                    ctx.timer.reset();
                }
            }
        }
    }
}

pub(crate) struct ElectionManager {
    ctx: Arc<NodeContext>,
}

impl ElectionManager {
    pub(crate) fn new(ctx: Arc<NodeContext>) -> Self {
        Self { ctx }
    }

    /// Election timeout observed by the event loop. Returns true when this
    /// node won immediately (single-node cluster).
    pub(crate) async fn handle_election_timeout(&self) -> Result<bool> {
        // The deadline may have been refreshed while the event sat in the
        // queue (a heartbeat arrived); a stale fire is a no-op.
        if !self.ctx.timer.expired() {
            return Ok(false);
        }
        self.start_election().await
    }

    async fn start_election(&self) -> Result<bool> {
        let ctx = &self.ctx;
        let (term, last_log_index, last_log_term, peers, won) = {
            let mut state = ctx.state.write().await;
            if state.role == RaftRole::Leader || !state.members.contains(&ctx.id) {
                return Ok(false);
            }

            let from = state.role;
            state.role = RaftRole::Candidate;
            state.current_term += 1;
            state.voted_for = Some(ctx.id.clone());
            state.leader_id = None;
            state.votes_received.clear();
            state.votes_received.insert(ctx.id.clone());

            ctx.emit(RaftEvent::TermAdvanced { node: ctx.id.clone(), term: state.current_term });
            if from != RaftRole::Candidate {
                ctx.emit(RaftEvent::RoleChanged {
                    node: ctx.id.clone(),
                    from,
                    to: RaftRole::Candidate,
                    term: state.current_term,
                });
            }

            let log = ctx.log.read().await;
            let won = state.votes_received.len() >= state.quorum();
            (state.current_term, log.last_index(), log.last_term(), state.peers(&ctx.id), won)
        };

        // Persist term and self-vote before any vote request leaves.
        ctx.persist_term_and_vote(term, Some(&ctx.id))?;
        ctx.timer.reset();

        tracing::info!(
            node_id = %ctx.id,
            term,
            last_log_index,
            "election timeout, starting election"
        );

        if won {
            let mut state = ctx.state.write().await;
            if state.role == RaftRole::Candidate && state.current_term == term {
                self.become_leader(&mut state).await;
                return Ok(true);
            }
            return Ok(false);
        }

        let args = RequestVoteArgs {
            term,
            candidate_id: ctx.id.clone(),
            last_log_index,
            last_log_term,
        };
        for peer in peers {
            ctx.send_spawned(peer, Message::RequestVote(args.clone()));
        }
        Ok(false)
    }

    /// Vote-granting rules (receiver side).
    pub(crate) async fn handle_vote_request(&self, args: &RequestVoteArgs) -> Result<RequestVoteReply> {
        let ctx = &self.ctx;
        let (reply, term_changed, granted, current_term, voted_for) = {
            let mut state = ctx.state.write().await;

            if args.term < state.current_term {
                tracing::debug!(
                    node_id = %ctx.id,
                    candidate = %args.candidate_id,
                    term = args.term,
                    current_term = state.current_term,
                    "rejecting stale vote request"
                );
                let reply = RequestVoteReply { term: state.current_term, vote_granted: false };
                return Ok(reply);
            }

            let term_changed = if args.term > state.current_term {
                ctx.become_follower_locked(&mut state, args.term)
            } else {
                false
            };

            let can_vote = state.voted_for.is_none()
                || state.voted_for.as_ref() == Some(&args.candidate_id);

            let log = ctx.log.read().await;
            let log_ok = args.last_log_term > log.last_term()
                || (args.last_log_term == log.last_term()
                    && args.last_log_index >= log.last_index());
            drop(log);

            let granted = can_vote && log_ok;
            if granted {
                state.voted_for = Some(args.candidate_id.clone());
                ctx.emit(RaftEvent::VoteGranted {
                    node: ctx.id.clone(),
                    candidate: args.candidate_id.clone(),
                    term: state.current_term,
                });
            }

            let reply = RequestVoteReply { term: state.current_term, vote_granted: granted };
            (reply, term_changed, granted, state.current_term, state.voted_for.clone())
        };

        // Persist the adopted term and the vote before the reply leaves.
        if term_changed || granted {
            ctx.persist_term_and_vote(current_term, voted_for.as_ref())?;
            ctx.timer.reset();
        }

        tracing::debug!(
            node_id = %ctx.id,
            candidate = %args.candidate_id,
            term = current_term,
            granted,
            "vote request handled"
        );
        Ok(reply)
    }

    /// Count a vote reply. Returns true when the quorum was just reached.
    pub(crate) async fn handle_vote_reply(
        &self,
        from: &NodeId,
        reply: &RequestVoteReply,
    ) -> Result<bool> {
        let ctx = &self.ctx;
        let (became_leader, adopted_term) = {
            let mut state = ctx.state.write().await;

            if reply.term > state.current_term {
                ctx.become_follower_locked(&mut state, reply.term);
                (false, Some(state.current_term))
            } else if state.role != RaftRole::Candidate || reply.term != state.current_term {
                // Stale or duplicate reply from an earlier election.
                (false, None)
            } else if reply.vote_granted && state.members.contains(from) {
                state.votes_received.insert(from.clone());
                tracing::debug!(
                    node_id = %ctx.id,
                    from = %from,
                    votes = state.votes_received.len(),
                    needed = state.quorum(),
                    "vote received"
                );
                if state.votes_received.len() >= state.quorum() {
                    self.become_leader(&mut state).await;
                    (true, None)
                } else {
                    (false, None)
                }
            } else {
                (false, None)
            }
        };

        if let Some(term) = adopted_term {
            ctx.persist_term_and_vote(term, None)?;
            ctx.timer.reset();
        }
        Ok(became_leader)
    }

    async fn become_leader(&self, state: &mut RaftState) {
        let ctx = &self.ctx;
        let next = {
            let log = ctx.log.read().await;
            log.last_index() + 1
        };

        let from = state.role;
        state.role = RaftRole::Leader;
        state.leader_id = Some(ctx.id.clone());
        state.next_index.clear();
        state.match_index.clear();
        for peer in state.peers(&ctx.id) {
            state.next_index.insert(peer.clone(), next);
            state.match_index.insert(peer, 0);
        }

        tracing::info!(node_id = %ctx.id, term = state.current_term, "won election, becoming leader");
        ctx.emit(RaftEvent::RoleChanged {
            node: ctx.id.clone(),
            from,
            to: RaftRole::Leader,
            term: state.current_term,
        });
        ctx.emit(RaftEvent::LeaderChanged {
            node: ctx.id.clone(),
            leader: Some(ctx.id.clone()),
            term: state.current_term,
        });
    }
}
