use crate::api::types::RaftEntryId;
use crate::replica;
use crate::replica::EntryPayload;

/// RaftCommitStream yields committed entries in log order, each exactly once per process. After a
/// restart, entries committed before the crash are yielded again from the start of the retained
/// log, so consumers must skip indexes they already applied.
pub struct RaftCommitStream {
    commit_stream: replica::CommitStream,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RaftCommittedEntry {
    pub entry_id: RaftEntryId,
    pub payload: EntryPayload,
}

impl RaftCommitStream {
    pub(crate) fn new(commit_stream: replica::CommitStream) -> Self {
        RaftCommitStream { commit_stream }
    }

    /// next returns the next committed entry to be applied to your application's state machine.
    /// `None` once the replica has shut down.
    pub async fn next(&mut self) -> Option<RaftCommittedEntry> {
        self.commit_stream.recv().await.map(RaftCommittedEntry::from)
    }
}

// ------- Conversions --------

impl From<replica::CommittedEntry> for RaftCommittedEntry {
    fn from(internal: replica::CommittedEntry) -> Self {
        RaftCommittedEntry {
            entry_id: RaftEntryId {
                term: internal.term,
                entry_index: internal.index,
            },
            payload: internal.payload,
        }
    }
}
