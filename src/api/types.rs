use crate::commitlog::Index;
use crate::replica::{MemberId, Term};
use std::net::SocketAddr;

/// Opaque id of a log entry. Lets the application match an enqueued entry with the entry that
/// later shows up on the commit stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RaftEntryId {
    pub(crate) term: Term,
    pub(crate) entry_index: Index,
}

impl RaftEntryId {
    pub fn term(&self) -> u64 {
        self.term.as_u64()
    }

    pub fn index(&self) -> u64 {
        self.entry_index.as_u64()
    }
}

#[derive(Clone, Debug)]
pub struct RaftMemberInfo {
    pub member_id: String,
    /// Where this member serves the raft gRPC service.
    pub address: SocketAddr,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RaftLeaderInfo {
    pub member_id: String,
    /// `None` if the topology no longer knows where the leader lives.
    pub address: Option<SocketAddr>,
}

impl RaftLeaderInfo {
    pub(crate) fn new(member_id: MemberId, address: Option<SocketAddr>) -> Self {
        RaftLeaderInfo {
            member_id: member_id.into_inner(),
            address,
        }
    }
}
