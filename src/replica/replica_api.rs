use crate::commitlog::{Index, LogError};
use crate::replica::local_state::Term;
use crate::replica::peers::MemberId;
use crate::replica::WriteAheadLogEntry;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;

#[derive(Debug)]
pub(crate) struct EnqueueForReplicationInput {
    pub(crate) data: Bytes,
}

#[derive(Debug)]
pub(crate) struct EnqueueForReplicationOutput {
    pub(crate) enqueued_term: Term,
    pub(crate) enqueued_index: Index,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum EnqueueForReplicationError {
    #[error("I'm not leader. Leader is {leader_id:?}")]
    LeaderRedirect {
        leader_id: MemberId,
        leader_addr: Option<SocketAddr>,
    },

    // Can be retried with exponential backoff with recommended initial delay of 200ms. Likely an
    // election is in progress.
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,

    // Leader can't hear from a majority. Accepting the write would only grow an uncommittable tail.
    #[error("Leader hasn't heard from a majority of the cluster recently")]
    QuorumUnavailable,

    #[error("Local log failed an integrity check and is waiting to be repaired by a leader: {0}")]
    IntegrityFault(String),

    #[error("Failed to persist log: {0}")]
    LocalIoError(LogError),

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct RequestVoteInput {
    pub(crate) candidate_term: Term,
    pub(crate) candidate_id: MemberId,
    pub(crate) candidate_last_log_entry: Option<(Term, Index)>,
}

#[derive(Debug)]
pub(crate) struct RequestVoteOutput {
    pub(crate) vote_granted: bool,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum RequestVoteError {
    #[error("Requesting candidate is not in the cluster")]
    CandidateNotInCluster,
    #[error("Requesting candidate's term is out of date")]
    RequestTermOutOfDate(TermOutOfDateInfo),
    #[error("Failed to persist term/vote: {0}")]
    LocalStateIoError(io::Error),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, Clone)]
pub(crate) struct AppendEntriesInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: MemberId,
    // "Previous log entry" is the log entry immediately preceding the new ones in AppendEntriesInput.
    pub(crate) leader_previous_log_entry: Option<(Term, Index)>,
    pub(crate) leader_commit_index: Option<Index>,
    pub(crate) new_entries: Vec<WriteAheadLogEntry>,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesOutput {
    // Nothing
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum AppendEntriesError {
    #[error("Client is not in cluster")]
    ClientNotInCluster,
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) are missing previous log entry. Our log ends at {last_log_index:?}")]
    ServerMissingPreviousLogEntry { last_log_index: Option<Index> },
    #[error("We (server) had an IO failure: {0:?}")]
    ServerIoError(io::Error),
    #[error("We (server) had a log failure: {0}")]
    ServerLogError(LogError),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, Clone)]
pub(crate) struct TermOutOfDateInfo {
    pub(crate) current_term: Term,
}

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: MemberId,
    pub(crate) term: Term,
    pub(crate) result: RequestVoteResult,
}

#[derive(Debug)]
pub(crate) enum RequestVoteResult {
    VoteGranted,
    VoteNotGranted,
    StaleTerm { new_term: Term },
    RetryableFailure,
    MalformedReply,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) descriptor: AppendEntriesReplyFromPeerDescriptor,
    pub(crate) result: Result<(), AppendEntriesReplyFromPeerError>,
}

// This is basically info about the original request
#[derive(Debug, Clone)]
pub(crate) struct AppendEntriesReplyFromPeerDescriptor {
    pub(crate) peer_id: MemberId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) previous_log_entry_index: Option<Index>,
    pub(crate) num_log_entries: usize,
}

#[derive(Debug)]
pub(crate) enum AppendEntriesReplyFromPeerError {
    PeerMissingPreviousLogEntry { last_log_index: Option<Index> },
    RetryableFailure(String),
    StaleTerm { new_term: Term },
}

/// LeaderTimerTick contains info for a single tick of a leader's per-peer timer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LeaderTimerTick {
    pub(crate) peer_id: MemberId,
    pub(crate) term: Term,
}
