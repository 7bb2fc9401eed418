use crate::pipeline::LocalCatchUp;
use crate::{RaftCommitStream, RaftEventListener, RaftReplicatedLog};

/// Everything an application gets back from starting a raft member.
pub struct RaftClient {
    /// Append entries here. Only the leader accepts them.
    pub replicated_log: RaftReplicatedLog,
    /// Committed entries come out here, in log order.
    pub commit_stream: RaftCommitStream,
    pub event_listener: RaftEventListener,
    /// Re-reads committed entries from this member's log, for filling gaps in the commit pipeline.
    pub local_catch_up: LocalCatchUp,
}
