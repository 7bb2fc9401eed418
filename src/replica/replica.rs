use crate::commitlog::{Index, Log, LogError};
use crate::replica::election::{CurrentLeader, ElectionState, PeerStateUpdate};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::peers::{ClusterTracker, MemberId};
use crate::replica::replica_api::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer,
    AppendEntriesReplyFromPeerError, EnqueueForReplicationError,
    EnqueueForReplicationInput, EnqueueForReplicationOutput, LeaderTimerTick, RequestVoteError, RequestVoteInput,
    RequestVoteOutput, RequestVoteReplyFromPeer, RequestVoteResult, TermOutOfDateInfo,
};
use crate::replica::topology::TopologyService;
use crate::replica::transport::{RaftMessage, RaftTransport};
use crate::replica::write_ahead_log::WriteAheadLog;
use crate::replica::{EntryPayload, WriteAheadLogEntry};
use std::cmp;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// Replica is the consensus state machine of a single cluster member. It is owned by the replica
/// actor, which feeds it one event at a time; nothing in here blocks on the network.
pub(crate) struct Replica<L>
where
    L: Log<WriteAheadLogEntry>,
{
    logger: slog::Logger,
    my_member_id: MemberId,
    cluster_tracker: ClusterTracker,
    topology: Arc<dyn TopologyService>,
    local_state: Box<dyn PersistentLocalState>,
    election_state: ElectionState,
    write_ahead_log: WriteAheadLog<L>,
    transport: Box<dyn RaftTransport>,
    max_append_entries_batch: u64,
    // Leader refuses writes unless a majority answered within this window.
    quorum_window: Duration,
    // Set when the local log failed an integrity check. Cleared by a successful AppendEntries.
    integrity_fault: Option<String>,
}

impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry>,
{
    pub(crate) fn new(
        logger: slog::Logger,
        cluster_tracker: ClusterTracker,
        topology: Arc<dyn TopologyService>,
        local_state: Box<dyn PersistentLocalState>,
        election_state: ElectionState,
        write_ahead_log: WriteAheadLog<L>,
        transport: Box<dyn RaftTransport>,
        max_append_entries_batch: u64,
        quorum_window: Duration,
    ) -> Self {
        let mut replica = Replica {
            logger,
            my_member_id: cluster_tracker.my_member_id().clone(),
            cluster_tracker,
            topology,
            local_state,
            election_state,
            write_ahead_log,
            transport,
            max_append_entries_batch,
            quorum_window,
            integrity_fault: None,
        };

        // Entries committed before a restart go out to the application again.
        replica.write_ahead_log.apply_all_committed_entries();

        replica
    }

    pub(crate) fn handle_enqueue_for_replication(
        &mut self,
        input: EnqueueForReplicationInput,
    ) -> Result<EnqueueForReplicationOutput, EnqueueForReplicationError> {
        if let Some(reason) = &self.integrity_fault {
            return Err(EnqueueForReplicationError::IntegrityFault(reason.clone()));
        }

        // Leader check
        match self.election_state.current_leader() {
            CurrentLeader::Me => { /* carry on */ }
            CurrentLeader::Other(leader_id) => {
                return Err(EnqueueForReplicationError::LeaderRedirect {
                    leader_addr: self.topology.resolve(&leader_id),
                    leader_id,
                });
            }
            CurrentLeader::Unknown => {
                return Err(EnqueueForReplicationError::NoLeader);
            }
        }

        if !self.has_recent_quorum() {
            slog::warn!(self.logger, "Rejecting write. Haven't heard from a majority recently.");
            return Err(EnqueueForReplicationError::QuorumUnavailable);
        }

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        let term = self.local_state.current_term();
        let new_entry = WriteAheadLogEntry {
            term,
            payload: EntryPayload::Command(input.data),
        };
        let appended_index = self
            .append_and_sync(new_entry)
            .map_err(EnqueueForReplicationError::LocalIoError)?;

        // Eagerly replicate instead of waiting for the next heartbeat.
        self.broadcast_append_entries();
        self.try_advance_commit_index_as_leader();

        Ok(EnqueueForReplicationOutput {
            enqueued_term: term,
            enqueued_index: appended_index,
        })
    }

    fn has_recent_quorum(&self) -> bool {
        match self.election_state.leader_state() {
            Some(tracker) => tracker.has_recent_quorum(
                Instant::now(),
                self.quorum_window,
                self.cluster_tracker.majority(),
            ),
            None => false,
        }
    }

    fn append_and_sync(&mut self, entry: WriteAheadLogEntry) -> Result<Index, LogError> {
        let result = self.write_ahead_log.append(entry);
        let result = result.and_then(|index| self.write_ahead_log.sync().map(|_| index));
        if let Err(e) = &result {
            self.on_log_error(e);
        }

        result
    }

    fn on_log_error(&mut self, error: &LogError) {
        if !error.is_integrity_violation() {
            slog::error!(self.logger, "Log IO failure: {}", error);
            return;
        }

        slog::crit!(
            self.logger,
            "Local log failed an integrity check. Refusing writes and elections until a leader repairs it. {}",
            error
        );
        self.integrity_fault.replace(error.to_string());
        if !matches!(self.election_state.current_leader(), CurrentLeader::Other(_)) {
            self.election_state.transition_to_follower(None);
        }
    }

    pub(crate) fn server_handle_request_vote(
        &mut self,
        input: RequestVoteInput,
    ) -> Result<RequestVoteOutput, RequestVoteError> {
        // Ensure candidate is known member.
        if !self.cluster_tracker.contains_member(&input.candidate_id) {
            return Err(RequestVoteError::CandidateNotInCluster);
        }

        // Read our local term/vote state as 1 atomic action.
        let (current_term, mut opt_voted_for) = self.local_state.voted_for_current_term();

        // 1. Reply false if term < currentTerm (§5.1)
        if input.candidate_term < current_term {
            slog::info!(self.logger, "Not granting vote. Client term is out of date.");
            return Err(RequestVoteError::RequestTermOutOfDate(TermOutOfDateInfo { current_term }));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = self
            .local_state
            .store_term_if_increased(input.candidate_term)
            .map_err(RequestVoteError::LocalStateIoError)?;
        if increased {
            self.election_state.transition_to_follower(None);
            slog::info!(
                self.logger,
                "Observed increased term in RequestVote call. Transitioning to follower. Election state: {:?}",
                self.election_state
            );
            // If we've increased the term, it means we haven't voted for anyone this term.
            opt_voted_for = None;
        }

        // Our log can't be trusted to judge whether the candidate is up to date.
        if self.integrity_fault.is_some() {
            slog::warn!(self.logger, "Not granting vote. Local log is faulted.");
            return Ok(RequestVoteOutput { vote_granted: false });
        }

        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).

        // If votedFor is null or candidateId, and...
        if let Some(voted_for) = opt_voted_for {
            if *voted_for != input.candidate_id {
                slog::info!(self.logger, "Not granting vote. We already voted for {:?}.", voted_for);
                return Ok(RequestVoteOutput { vote_granted: false });
            }

            // Candidate retried.
            self.election_state.reset_timeout_if_follower();
            return Ok(RequestVoteOutput { vote_granted: true });
        }

        // ...and candidate’s log is at least as up-to-date as receiver’s log...
        if !self.is_candidate_log_gte_mine(input.candidate_last_log_entry) {
            slog::info!(self.logger, "Not granting vote. Candidate log is out of date.");
            return Ok(RequestVoteOutput { vote_granted: false });
        }

        // ...grant vote
        let cas_success = self
            .local_state
            .store_vote_for_term_if_unvoted(input.candidate_term, input.candidate_id.clone())
            .map_err(RequestVoteError::LocalStateIoError)?;
        if !cas_success {
            slog::info!(self.logger, "Not granting vote. Term/vote state moved underneath us.");
            return Ok(RequestVoteOutput { vote_granted: false });
        }

        slog::info!(self.logger, "Voted for {:?} in term {:?}.", input.candidate_id, input.candidate_term);
        // > If election timeout elapses without receiving AppendEntries
        // > RPC from current leader or granting vote to candidate:
        // > convert to candidate
        self.election_state.reset_timeout_if_follower();

        Ok(RequestVoteOutput { vote_granted: true })
    }

    fn is_candidate_log_gte_mine(&self, candidate_last_entry: Option<(Term, Index)>) -> bool {
        // > Raft determines which of two logs is more up-to-date
        // > by comparing the index and term of the last entries in the
        // > logs. If the logs have last entries with different terms, then
        // > the log with the later term is more up-to-date. If the logs
        // > end with the same term, then whichever log is longer is
        // > more up-to-date.
        match (self.write_ahead_log.latest_entry(), candidate_last_entry) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(mine), Some(candidate)) => candidate >= mine,
        }
    }

    pub(crate) fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        let current_term = self.local_state.current_term();
        if current_term != reply.term {
            slog::info!(
                self.logger,
                "Received vote for outdated term {:?}, current term: {:?}.",
                reply.term,
                current_term,
            );
            return;
        }

        match reply.result {
            RequestVoteResult::VoteGranted => {
                let num_votes_received = match self.election_state.add_vote_if_candidate(reply.peer_id) {
                    Some(v) => v,
                    None => {
                        slog::info!(
                            self.logger,
                            "Received vote for term {:?} after transitioning to a election state: {:?}",
                            reply.term,
                            self.election_state,
                        );
                        return;
                    }
                };

                slog::info!(
                    self.logger,
                    "Received {}/{} votes for term {:?}",
                    num_votes_received,
                    self.cluster_tracker.num_voting_replicas(),
                    reply.term,
                );

                if num_votes_received >= self.cluster_tracker.majority() {
                    self.become_leader(reply.term);
                }
            }
            RequestVoteResult::VoteNotGranted => {
                slog::info!(
                    self.logger,
                    "Vote not granted from {:?} for term {:?}",
                    reply.peer_id,
                    reply.term,
                );
            }
            RequestVoteResult::StaleTerm { new_term } => {
                self.observe_term(new_term, None);
            }
            RequestVoteResult::RetryableFailure | RequestVoteResult::MalformedReply => {
                // No retry. If the election stalls, the election timeout starts a new one.
                slog::debug!(
                    self.logger,
                    "RequestVote to {:?} failed: {:?}",
                    reply.peer_id,
                    reply.result
                );
            }
        }
    }

    // Steps down if `observed_term` is newer. Returns true if it was.
    fn observe_term(&mut self, observed_term: Term, leader: Option<MemberId>) -> bool {
        match self.local_state.store_term_if_increased(observed_term) {
            Ok(true) => {
                self.election_state.transition_to_follower(leader);
                slog::info!(
                    self.logger,
                    "Observed newer term {:?}. Election state: {:?}",
                    observed_term,
                    self.election_state
                );
                true
            }
            Ok(false) => false,
            Err(e) => {
                slog::error!(self.logger, "Failed to persist term {:?}: {:?}", observed_term, e);
                false
            }
        }
    }

    fn become_leader(&mut self, term: Term) {
        self.election_state.transition_to_leader(
            term,
            self.cluster_tracker.peer_ids(),
            self.write_ahead_log.latest_index(),
        );
        slog::info!(self.logger, "Became leader for term {:?}", term);

        // A barrier in our own term lets entries from earlier terms commit without waiting for
        // the next client write.
        if let Err(e) = self.append_and_sync(WriteAheadLogEntry::barrier(term)) {
            slog::error!(self.logger, "Failed to append leader barrier: {}", e);
            return;
        }

        self.broadcast_append_entries();
        self.try_advance_commit_index_as_leader();
    }

    pub(crate) fn server_handle_append_entries(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        // Ensure leader is known member.
        if !self.cluster_tracker.contains_member(&input.leader_id) {
            return Err(AppendEntriesError::ClientNotInCluster);
        }

        // 1. Reply false if term < currentTerm (§5.1)
        let current_term = self.local_state.current_term();
        if input.leader_term < current_term {
            return Err(AppendEntriesError::ClientTermOutOfDate(TermOutOfDateInfo { current_term }));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = self
            .local_state
            .store_term_if_increased(input.leader_term)
            .map_err(AppendEntriesError::ServerIoError)?;
        if increased || self.election_state.is_candidate() {
            // > If AppendEntries RPC received from new leader: convert to follower
            self.election_state.transition_to_follower(Some(input.leader_id.clone()));
        } else if self.election_state.is_leader() {
            slog::crit!(
                self.logger,
                "{:?} claims leadership of term {:?}, which is ours",
                input.leader_id,
                current_term
            );
            return Err(AppendEntriesError::ClientTermOutOfDate(TermOutOfDateInfo { current_term }));
        } else {
            self.election_state.set_leader_if_unknown(&input.leader_id);
        }

        self.election_state.reset_timeout_if_follower();

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        self.check_previous_log_entry(input.leader_previous_log_entry)?;

        // 3. If [my] existing entry conflicts with [leader's new entries]
        // (same index but different terms), delete [my] existing entry and
        // all that follow it (§5.3)
        // 4. Append any new entries not already in the log
        let mut next_entry_index = match input.leader_previous_log_entry {
            None => Index::start_index(),
            Some((_, leader_prev_entry_index)) => leader_prev_entry_index.plus(1),
        };
        let mut appended_any = false;
        for new_entry in input.new_entries {
            let index = next_entry_index;
            next_entry_index = next_entry_index.plus(1);

            // Pruned entries are committed, and committed entries already match the leader.
            if index < self.write_ahead_log.first_index() {
                continue;
            }

            if index < self.write_ahead_log.next_index() {
                let existing_entry = self.write_ahead_log.read(index).map_err(|e| self.log_failure(e))?;
                match existing_entry {
                    // 4. (no-op)
                    Some(existing_entry) if existing_entry.term == new_entry.term => continue,
                    // 3. (delete)
                    Some(_) => {
                        slog::info!(self.logger, "Truncating conflicting log suffix starting at {:?}", index);
                        self.write_ahead_log.truncate(index).map_err(|e| self.log_failure(e))?;
                    }
                    None => {}
                }
            }

            // 4. (append)
            let appended_index = self.write_ahead_log.append(new_entry).map_err(|e| self.log_failure(e))?;
            assert_eq!(appended_index, index, "Appended log entry to unexpected index.");
            appended_any = true;
        }

        if appended_any {
            self.write_ahead_log.sync().map_err(|e| self.log_failure(e))?;
        }

        // 5. If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        if let (Some(leader_commit_index), Some(index_of_last_new_entry)) =
            (input.leader_commit_index, next_entry_index.checked_minus(1))
        {
            let new_commit_index = cmp::min(leader_commit_index, index_of_last_new_entry);
            if self.write_ahead_log.ratchet_fwd_commit_index_if_greater(new_commit_index) {
                self.local_state
                    .store_commit_index(new_commit_index)
                    .map_err(AppendEntriesError::ServerIoError)?;
            }
        }

        if let Some(reason) = self.integrity_fault.take() {
            slog::info!(self.logger, "Log resynchronised with leader. Clearing fault: {}", reason);
        }

        // > If commitIndex > lastApplied: increment lastApplied, apply
        // > log[lastApplied] to state machine (§5.3)
        self.write_ahead_log.apply_all_committed_entries();
        if let Err(e) = self.write_ahead_log.prune_committed(None) {
            slog::warn!(self.logger, "Failed to prune log: {}", e);
        }

        Ok(AppendEntriesOutput {})
    }

    fn check_previous_log_entry(&mut self, leader_previous_log_entry: Option<(Term, Index)>) -> Result<(), AppendEntriesError> {
        let (leader_prev_entry_term, leader_prev_entry_index) = match leader_previous_log_entry {
            None => return Ok(()),
            Some(prev) => prev,
        };

        if leader_prev_entry_index < self.write_ahead_log.first_index() {
            // Only committed entries are pruned, so they match whatever the leader has.
            return match self.write_ahead_log.commit_index() {
                Some(commit_index) if commit_index >= leader_prev_entry_index => Ok(()),
                _ => Err(AppendEntriesError::ServerMissingPreviousLogEntry {
                    last_log_index: self.write_ahead_log.latest_index(),
                }),
            };
        }

        match self.write_ahead_log.read(leader_prev_entry_index) {
            Ok(Some(my_previous_log_entry)) if my_previous_log_entry.term == leader_prev_entry_term => Ok(()),
            // Term conflict: everything from prev onwards will be replaced, so ask for prev again.
            Ok(Some(_)) => Err(AppendEntriesError::ServerMissingPreviousLogEntry {
                last_log_index: leader_prev_entry_index.checked_minus(1),
            }),
            Ok(None) => Err(AppendEntriesError::ServerMissingPreviousLogEntry {
                last_log_index: self.write_ahead_log.latest_index(),
            }),
            Err(e) => Err(self.log_failure(e)),
        }
    }

    fn log_failure(&mut self, error: LogError) -> AppendEntriesError {
        self.on_log_error(&error);
        AppendEntriesError::ServerLogError(error)
    }

    pub(crate) fn handle_append_entries_reply_from_peer(&mut self, reply: AppendEntriesReplyFromPeer) {
        let logger = self.logger.new(slog::o!(
            "Peer" => reply.descriptor.peer_id.to_string(),
            "SeqNo" => reply.descriptor.seq_no
        ));
        slog::debug!(logger, "AE reply from peer result: {:?}", reply.result);

        let current_term = self.local_state.current_term();
        if current_term != reply.descriptor.term {
            slog::info!(
                logger,
                "Received AE reply for outdated term {:?}, but we're on term {:?}",
                reply.descriptor.term,
                current_term
            );
            return;
        }

        // 1. Check for stale term rejection
        let peer_log_update = match reply.result {
            Err(AppendEntriesReplyFromPeerError::StaleTerm { new_term }) => {
                slog::warn!(logger, "Rejected by peer because my term is stale.");
                if self.observe_term(new_term, None) {
                    return;
                }
                slog::warn!(logger, "Treating non-incrementing StaleTerm err as generic failure.");
                PeerStateUpdate::OtherError
            }
            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry { last_log_index }) => {
                slog::info!(logger, "Peer is missing previous log entry. Peer log ends at {:?}", last_log_index);
                PeerStateUpdate::PeerLogBehind { last_log_index }
            }
            Err(AppendEntriesReplyFromPeerError::RetryableFailure(err_msg)) => {
                slog::debug!(logger, "AE failure: {}", err_msg);
                PeerStateUpdate::OtherError
            }
            Ok(_) => PeerStateUpdate::Success {
                previous_log_entry: reply.descriptor.previous_log_entry_index,
                num_entries_replicated: reply.descriptor.num_log_entries,
            },
        };
        let peer_answered = !matches!(peer_log_update, PeerStateUpdate::OtherError);

        // 2. Update peer log tracker
        let next_index = match self.election_state.leader_state_mut() {
            None => {
                slog::info!(logger, "No longer leader");
                return;
            }
            Some(leader_state) => match leader_state.peer_state_mut(&reply.descriptor.peer_id) {
                None => {
                    slog::warn!(logger, "Peer not found while handling AE reply");
                    return;
                }
                Some(peer_state) => {
                    peer_state.handle_append_entries_result(
                        &logger,
                        reply.descriptor.seq_no,
                        peer_log_update,
                        Instant::now(),
                    );
                    peer_state.next_and_previous_log_index().0
                }
            },
        };

        // 3. Check for majority replication and apply new commits.
        self.try_advance_commit_index_as_leader();

        // 4. Keep the peer busy while it's behind.
        // > If last log index ≥ nextIndex for a follower: send
        // > AppendEntries RPC with log entries starting at nextIndex
        // Failures wait for the heartbeat instead, so an unreachable peer isn't hammered.
        if peer_answered && matches!(self.write_ahead_log.latest_index(), Some(last) if last >= next_index) {
            self.send_append_entries_to_peer(&reply.descriptor.peer_id);
        }
    }

    fn try_advance_commit_index_as_leader(&mut self) {
        let (matched_indexes, lowest_matched) = match self.election_state.leader_state() {
            None => return,
            Some(tracker) => (tracker.matched_indexes(), tracker.lowest_matched()),
        };

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        // See also:
        // > Figure 8: A time sequence showing why a leader cannot determine
        // > commitment using log entries from older terms.
        let tentative_new_commit_index = if matched_indexes.is_empty() {
            // Single member cluster. Our own log is the majority.
            self.write_ahead_log.latest_index()
        } else {
            Self::get_cluster_commit_index(matched_indexes)
        };
        let tentative_new_commit_index = match tentative_new_commit_index {
            Some(index) => index,
            None => return,
        };

        match self
            .write_ahead_log
            .ratchet_fwd_commit_index_if_valid(tentative_new_commit_index, self.local_state.current_term())
        {
            Ok(false) => return,
            Ok(true) => {}
            Err(e) => {
                slog::warn!(
                    self.logger,
                    "Failure while confirming new commit index {:?}: {}",
                    tentative_new_commit_index,
                    e
                );
                return;
            }
        }

        if let Err(e) = self.local_state.store_commit_index(tentative_new_commit_index) {
            // Safe to continue. A lower persisted commit index only means more replay on restart.
            slog::warn!(self.logger, "Failed to persist commit index: {:?}", e);
        }
        self.write_ahead_log.apply_all_committed_entries();

        let lowest_matched = lowest_matched.unwrap_or_else(|| self.write_ahead_log.commit_index());
        if let Err(e) = self.write_ahead_log.prune_committed(Some(lowest_matched)) {
            slog::warn!(self.logger, "Failed to prune log: {}", e);
        }
    }

    fn get_cluster_commit_index(mut peers_matched_indexes: Vec<Option<Index>>) -> Option<Index> {
        peers_matched_indexes.sort();

        // Overview of why algo is correct:
        // We are always at the tail of the array, because our log is same/longest.
        // 1. add "me"
        //let cluster_size = peers_matched_indexes.len() + 1;
        // 2. calculate majority
        //let majority = (cluster_size / 2) + 1;
        // 3. subtract "me"
        //let num_peers_to_achieve_majority = majority - 1;
        // 4. take `i`th index from the right
        //let quorum_idx = peers_matched_indexes.len() - num_peers_to_achieve_majority;

        // Or just use this simplified equation which is harder to understand at a glance why it
        // works. When in doubt, just read the unit tests.
        let quorum_idx = peers_matched_indexes.len() / 2;

        peers_matched_indexes.remove(quorum_idx)
    }

    pub(crate) fn handle_leader_timer(&mut self, tick: LeaderTimerTick) {
        let current_term = self.local_state.current_term();
        if current_term != tick.term {
            slog::debug!(
                self.logger,
                "Received leader heartbeat for outdated term {:?}, current term: {:?}",
                tick.term,
                current_term
            );
            return;
        }

        self.send_append_entries_to_peer(&tick.peer_id);
    }

    fn broadcast_append_entries(&mut self) {
        for peer_id in self.cluster_tracker.peer_ids() {
            self.send_append_entries_to_peer(&peer_id);
        }
    }

    fn send_append_entries_to_peer(&mut self, peer_id: &MemberId) {
        let current_term = self.local_state.current_term();
        let leader_state = match self.election_state.leader_state_mut() {
            Some(leader_state) => leader_state,
            None => {
                slog::debug!(self.logger, "Received leader timer event but no longer leader.");
                return;
            }
        };
        let peer_state = match leader_state.peer_state_mut(peer_id) {
            Some(peer_state) => peer_state,
            None => {
                slog::error!(self.logger, "Peer {:?} is missing in LeaderStateTracker", peer_id);
                return;
            }
        };

        let request = append_entries_request::build(
            current_term,
            &self.my_member_id,
            peer_id,
            peer_state,
            &self.write_ahead_log,
            self.max_append_entries_batch,
        );
        match request {
            Ok((input, descriptor)) => {
                self.transport
                    .send(peer_id, RaftMessage::AppendEntries { input, descriptor });
                peer_state.reset_heartbeat_timer();
            }
            Err(BuildAppendEntriesError::PeerConcurrencyThrottle) => {
                slog::debug!(self.logger, "Request to peer {:?} still outstanding", peer_id);
            }
            Err(BuildAppendEntriesError::PeerNeedsPrunedEntries { next_index, first_index }) => {
                slog::warn!(
                    self.logger,
                    "Peer {:?} needs entries from {:?} but the log starts at {:?}. Peer must catch up from a snapshot.",
                    peer_id,
                    next_index,
                    first_index
                );
            }
            Err(BuildAppendEntriesError::Log(e)) => {
                slog::error!(self.logger, "Failed to read log for peer {:?}: {}", peer_id, e);
            }
        }
    }

    pub(crate) fn handle_follower_timeout(&mut self) {
        if let Some(reason) = &self.integrity_fault {
            slog::warn!(self.logger, "Not starting an election while faulted: {}", reason);
            return;
        }
        if self.election_state.is_leader() {
            // Timer event raced with winning an election.
            return;
        }

        // Write-ahead log style: Vote for self on local state before transitioning to candidate.
        let new_term = match self.local_state.increment_term_and_vote_for_self() {
            Ok(term) => term,
            Err(e) => {
                slog::error!(self.logger, "Failed to persist new term. Not starting election. {:?}", e);
                return;
            }
        };
        self.election_state.transition_to_candidate_and_vote_for_self();
        slog::info!(
            self.logger,
            "Timed out as follower. Changed to candidate for term {:?}. Election state: {:?}",
            new_term,
            self.election_state,
        );

        if self.cluster_tracker.majority() <= 1 {
            self.become_leader(new_term);
            return;
        }

        let peer_ids: HashSet<MemberId> = self.cluster_tracker.peer_ids();
        for peer_id in peer_ids {
            let input = RequestVoteInput {
                candidate_term: new_term,
                candidate_id: self.my_member_id.clone(),
                candidate_last_log_entry: self.write_ahead_log.latest_entry(),
            };
            self.transport.send(&peer_id, RaftMessage::RequestVote(input));
        }
    }
}

enum BuildAppendEntriesError {
    PeerConcurrencyThrottle,
    PeerNeedsPrunedEntries { next_index: Index, first_index: Index },
    Log(LogError),
}

mod append_entries_request {
    use super::BuildAppendEntriesError;
    use crate::commitlog::Log;
    use crate::replica::election::PeerState;
    use crate::replica::replica_api::{AppendEntriesInput, AppendEntriesReplyFromPeerDescriptor};
    use crate::replica::write_ahead_log::WriteAheadLog;
    use crate::replica::{MemberId, Term, WriteAheadLogEntry};

    pub(super) fn build<L>(
        current_term: Term,
        my_id: &MemberId,
        peer_id: &MemberId,
        peer_state: &mut PeerState,
        write_ahead_log: &WriteAheadLog<L>,
        max_batch: u64,
    ) -> Result<(AppendEntriesInput, AppendEntriesReplyFromPeerDescriptor), BuildAppendEntriesError>
    where
        L: Log<WriteAheadLogEntry>,
    {
        // One outstanding request per peer, no pipelining. Entries are still batched, and the
        // reply handler sends the next batch right away while the peer is behind.
        if peer_state.has_outstanding_request() {
            return Err(BuildAppendEntriesError::PeerConcurrencyThrottle);
        }

        let (next_index, opt_previous_index) = peer_state.next_and_previous_log_index();
        let first_index = write_ahead_log.first_index();
        let previous_log_entry = match opt_previous_index {
            None => None,
            Some(previous_index) if previous_index < first_index => {
                return Err(BuildAppendEntriesError::PeerNeedsPrunedEntries { next_index, first_index });
            }
            Some(previous_index) => match write_ahead_log.read(previous_index) {
                Ok(Some(entry)) => Some((entry.term, previous_index)),
                // Peer's next index is past our log. Tracking is off; start from our tail.
                Ok(None) => write_ahead_log.latest_entry(),
                Err(e) => return Err(BuildAppendEntriesError::Log(e)),
            },
        };
        let next_index = match previous_log_entry {
            None => next_index,
            Some((_, previous_index)) => previous_index.plus(1),
        };

        let new_entries = write_ahead_log
            .read_range(next_index, next_index.plus(max_batch - 1))
            .map_err(BuildAppendEntriesError::Log)?;

        let seq_no = peer_state.next_seq_no();
        let descriptor = AppendEntriesReplyFromPeerDescriptor {
            peer_id: peer_id.clone(),
            term: current_term,
            seq_no,
            previous_log_entry_index: previous_log_entry.map(|(_, index)| index),
            num_log_entries: new_entries.len(),
        };
        let input = AppendEntriesInput {
            leader_term: current_term,
            leader_id: my_id.clone(),
            leader_previous_log_entry: previous_log_entry,
            leader_commit_index: write_ahead_log.commit_index(),
            new_entries,
        };

        Ok((input, descriptor))
    }
}

#[cfg(test)]
impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry>,
{
    pub(crate) fn is_leader(&self) -> bool {
        self.election_state.is_leader()
    }

    pub(crate) fn current_term(&self) -> Term {
        self.local_state.current_term()
    }

    pub(crate) fn commit_index(&self) -> Option<Index> {
        self.write_ahead_log.commit_index()
    }

    pub(crate) fn current_leader(&self) -> CurrentLeader {
        self.election_state.current_leader()
    }

    pub(crate) fn log_entries(&self) -> Vec<WriteAheadLogEntry> {
        match self.write_ahead_log.latest_index() {
            None => Vec::new(),
            Some(last) => self
                .write_ahead_log
                .read_range(self.write_ahead_log.first_index(), last)
                .unwrap(),
        }
    }

    pub(crate) fn is_faulted(&self) -> bool {
        self.integrity_fault.is_some()
    }

    pub(crate) fn fault_for_test(&mut self, error: LogError) {
        self.on_log_error(&error);
    }
}
