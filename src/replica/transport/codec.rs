use crate::commitlog::{opt_index_as_u64, Index};
use crate::grpc::{ProtoAppendEntriesReq, ProtoEntryKind, ProtoLogEntry, ProtoRequestVoteReq};
use crate::replica::replica_api::{AppendEntriesInput, RequestVoteInput};
use crate::replica::{EntryPayload, Term, WriteAheadLogEntry};
use bytes::Bytes;

pub(crate) fn entry_to_proto(entry: WriteAheadLogEntry) -> ProtoLogEntry {
    let (kind, data) = match entry.payload {
        EntryPayload::Command(data) => (ProtoEntryKind::Command, data.to_vec()),
        EntryPayload::LeaderBarrier => (ProtoEntryKind::LeaderBarrier, Vec::new()),
    };

    ProtoLogEntry {
        term: entry.term.as_u64(),
        kind: kind as i32,
        data,
    }
}

pub(crate) fn entry_from_proto(proto: ProtoLogEntry) -> Result<WriteAheadLogEntry, String> {
    let payload = match ProtoEntryKind::from_i32(proto.kind) {
        Some(ProtoEntryKind::Command) => EntryPayload::Command(Bytes::from(proto.data)),
        Some(ProtoEntryKind::LeaderBarrier) => EntryPayload::LeaderBarrier,
        None => return Err(format!("Unknown log entry kind {}", proto.kind)),
    };

    Ok(WriteAheadLogEntry {
        term: Term::new(proto.term),
        payload,
    })
}

fn split_entry_metadata(metadata: Option<(Term, Index)>) -> (u64, u64) {
    match metadata {
        None => (0, 0),
        Some((term, index)) => (term.as_u64(), index.as_u64()),
    }
}

pub(super) fn request_vote_to_proto(cluster_id: &str, input: &RequestVoteInput) -> ProtoRequestVoteReq {
    let (last_log_entry_term, last_log_entry_index) = split_entry_metadata(input.candidate_last_log_entry);

    ProtoRequestVoteReq {
        cluster_id: cluster_id.to_string(),
        client_node_id: input.candidate_id.as_str().to_string(),
        term: input.candidate_term.as_u64(),
        last_log_entry_term,
        last_log_entry_index,
    }
}

pub(super) fn append_entries_to_proto(cluster_id: &str, input: AppendEntriesInput) -> ProtoAppendEntriesReq {
    let (previous_log_entry_term, previous_log_entry_index) = split_entry_metadata(input.leader_previous_log_entry);

    ProtoAppendEntriesReq {
        cluster_id: cluster_id.to_string(),
        client_node_id: input.leader_id.into_inner(),
        term: input.leader_term.as_u64(),
        commit_index: opt_index_as_u64(input.leader_commit_index),
        previous_log_entry_term,
        previous_log_entry_index,
        new_entries: input.new_entries.into_iter().map(entry_to_proto).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::MemberId;

    #[test]
    fn append_entries_uses_zero_for_missing_indexes() {
        let input = AppendEntriesInput {
            leader_term: Term::new(3),
            leader_id: MemberId::new("a"),
            leader_previous_log_entry: None,
            leader_commit_index: None,
            new_entries: vec![WriteAheadLogEntry {
                term: Term::new(3),
                payload: EntryPayload::LeaderBarrier,
            }],
        };

        let proto = append_entries_to_proto("graph", input);
        assert_eq!(proto.cluster_id, "graph");
        assert_eq!(proto.previous_log_entry_index, 0);
        assert_eq!(proto.previous_log_entry_term, 0);
        assert_eq!(proto.commit_index, 0);
        assert_eq!(proto.new_entries[0].kind, ProtoEntryKind::LeaderBarrier as i32);
    }

    #[test]
    fn unknown_entry_kind_is_rejected() {
        let proto = ProtoLogEntry {
            term: 1,
            kind: 42,
            data: vec![],
        };
        assert!(entry_from_proto(proto).is_err());
    }
}
