//! Outbound half of the consensus wire protocol. The inbound half lives in `crate::server`.

mod codec;
mod monitor;
mod replicator;

pub(crate) use codec::entry_from_proto;
pub(crate) use codec::entry_to_proto;
pub(crate) use replicator::Replicator;

use crate::replica::replica_api::{AppendEntriesInput, AppendEntriesReplyFromPeerDescriptor, RequestVoteInput};
use crate::replica::MemberId;

/// Every kind of message the consensus core sends to another member. Heartbeats are
/// AppendEntries without entries.
#[derive(Debug)]
pub(crate) enum RaftMessage {
    RequestVote(RequestVoteInput),
    AppendEntries {
        input: AppendEntriesInput,
        descriptor: AppendEntriesReplyFromPeerDescriptor,
    },
}

/// Best-effort, at-most-once delivery. Implementations never block the caller and never retry;
/// replies come back to the replica actor as events.
pub(crate) trait RaftTransport: Send {
    fn send(&self, to: &MemberId, message: RaftMessage);
}
