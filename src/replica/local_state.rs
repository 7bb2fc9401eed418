use crate::commitlog::{self, Index};
use crate::grpc::ProtoReplicaMetadata;
use crate::replica::peers::MemberId;
use chrono::Utc;
use prost::Message;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::fmt;

const METADATA_FILE_NAME: &str = "raft-meta.bin";
const METADATA_TMP_FILE_NAME: &str = "raft-meta.bin.tmp";

#[derive(Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Hash)]
pub struct Term(u64);

impl Term {
    pub(crate) fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PersistentLocalState is used whenever the Raft paper requires that something is persisted to a
/// durable store to guarantee safety. Not everything that uses disk has to go through this, only
/// algorithm-correctness-critical ones.
///
/// Store methods should be implemented atomically via a CAS like operation. Similar to most CAS
/// method signatures, the CAS store methods will return true if we have mutated state. Nothing
/// is mutated in memory unless it was first made durable.
pub(crate) trait PersistentLocalState: Send {
    /// Set current term to `new_term` atomically, iff it is larger than current term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, io::Error>;

    /// Store our vote for the latest term iff the latest term (internal state) is the same term as
    /// the one provided, and we have not stored a vote for the latest term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: MemberId) -> Result<bool, io::Error>;

    /// Return the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, io::Error>;

    /// Commit index only moves forward. Lower or equal values are ignored.
    fn store_commit_index(&mut self, commit_index: Index) -> Result<(), io::Error>;

    fn current_term(&self) -> Term;
    fn voted_for_current_term(&self) -> (Term, Option<Arc<MemberId>>);
    fn commit_index(&self) -> Option<Index>;
}

#[derive(Clone)]
struct LocalStateData {
    current_term: Term,
    voted_for_this_term: Option<Arc<MemberId>>,
    commit_index: Option<Index>,
}

impl LocalStateData {
    fn initial() -> Self {
        LocalStateData {
            current_term: Term::new(0),
            voted_for_this_term: None,
            commit_index: None,
        }
    }

    fn with_term_if_increased(&self, new_term: Term) -> Option<Self> {
        if new_term <= self.current_term {
            return None;
        }

        Some(LocalStateData {
            current_term: new_term,
            voted_for_this_term: None,
            commit_index: self.commit_index,
        })
    }

    fn with_vote_if_unvoted(&self, expected_term: Term, vote: MemberId) -> Option<Self> {
        if expected_term != self.current_term || self.voted_for_this_term.is_some() {
            return None;
        }

        Some(LocalStateData {
            current_term: self.current_term,
            voted_for_this_term: Some(Arc::new(vote)),
            commit_index: self.commit_index,
        })
    }

    fn with_next_term_and_vote(&self, vote: Arc<MemberId>) -> Self {
        let mut next_term = self.current_term;
        next_term.incr();

        LocalStateData {
            current_term: next_term,
            voted_for_this_term: Some(vote),
            commit_index: self.commit_index,
        }
    }

    fn with_commit_index_if_increased(&self, commit_index: Index) -> Option<Self> {
        if matches!(self.commit_index, Some(current) if current >= commit_index) {
            return None;
        }

        Some(LocalStateData {
            current_term: self.current_term,
            voted_for_this_term: self.voted_for_this_term.clone(),
            commit_index: Some(commit_index),
        })
    }
}

/// Local state kept only in memory. Safe only for members that rejoin with an empty log.
pub(crate) struct VolatileLocalState {
    data: LocalStateData,
    my_member_id: Arc<MemberId>,
}

impl VolatileLocalState {
    pub(crate) fn new(my_member_id: MemberId) -> Self {
        VolatileLocalState {
            data: LocalStateData::initial(),
            my_member_id: Arc::new(my_member_id),
        }
    }
}

impl PersistentLocalState for VolatileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, io::Error> {
        let next = self.data.with_term_if_increased(new_term);
        Ok(apply_in_memory(&mut self.data, next))
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: MemberId) -> Result<bool, io::Error> {
        let next = self.data.with_vote_if_unvoted(expected_term, vote);
        Ok(apply_in_memory(&mut self.data, next))
    }

    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, io::Error> {
        self.data = self.data.with_next_term_and_vote(self.my_member_id.clone());
        Ok(self.data.current_term)
    }

    fn store_commit_index(&mut self, commit_index: Index) -> Result<(), io::Error> {
        let next = self.data.with_commit_index_if_increased(commit_index);
        apply_in_memory(&mut self.data, next);
        Ok(())
    }

    fn current_term(&self) -> Term {
        self.data.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<MemberId>>) {
        (self.data.current_term, self.data.voted_for_this_term.clone())
    }

    fn commit_index(&self) -> Option<Index> {
        self.data.commit_index
    }
}

fn apply_in_memory(data: &mut LocalStateData, next: Option<LocalStateData>) -> bool {
    match next {
        Some(next) => {
            *data = next;
            true
        }
        None => false,
    }
}

/// Local state persisted to `raft-meta.bin`. Every mutation is written to a temp file, fsynced,
/// and renamed over the previous record before it becomes visible in memory.
pub(crate) struct FileLocalState {
    data: LocalStateData,
    my_member_id: Arc<MemberId>,
    directory: PathBuf,
}

impl FileLocalState {
    pub(crate) fn open(directory: &Path, my_member_id: MemberId) -> Result<Self, io::Error> {
        fs::create_dir_all(directory)?;
        let data = match fs::read(directory.join(METADATA_FILE_NAME)) {
            Ok(bytes) => decode_metadata(&bytes)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => LocalStateData::initial(),
            Err(e) => return Err(e),
        };

        Ok(FileLocalState {
            data,
            my_member_id: Arc::new(my_member_id),
            directory: directory.to_path_buf(),
        })
    }

    fn persist_and_apply(&mut self, next: Option<LocalStateData>) -> Result<bool, io::Error> {
        match next {
            None => Ok(false),
            Some(next) => {
                self.persist(&next)?;
                self.data = next;
                Ok(true)
            }
        }
    }

    fn persist(&self, data: &LocalStateData) -> Result<(), io::Error> {
        let proto = ProtoReplicaMetadata {
            current_term: data.current_term.as_u64(),
            voted_for: data
                .voted_for_this_term
                .as_ref()
                .map(|id| id.as_str().to_string())
                .unwrap_or_default(),
            has_vote: data.voted_for_this_term.is_some(),
            commit_index: commitlog::opt_index_as_u64(data.commit_index),
            updated_at_millis: Utc::now().timestamp_millis(),
        };
        let mut bytes = Vec::with_capacity(proto.encoded_len());
        proto
            .encode(&mut bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        let tmp_path = self.directory.join(METADATA_TMP_FILE_NAME);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, self.directory.join(METADATA_FILE_NAME))?;
        commitlog::sync_directory(&self.directory)
    }
}

fn decode_metadata(bytes: &[u8]) -> Result<LocalStateData, io::Error> {
    let proto =
        ProtoReplicaMetadata::decode(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok(LocalStateData {
        current_term: Term::new(proto.current_term),
        voted_for_this_term: if proto.has_vote {
            Some(Arc::new(MemberId::new(proto.voted_for)))
        } else {
            None
        },
        commit_index: Index::from_u64_opt(proto.commit_index),
    })
}

impl PersistentLocalState for FileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, io::Error> {
        let next = self.data.with_term_if_increased(new_term);
        self.persist_and_apply(next)
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: MemberId) -> Result<bool, io::Error> {
        let next = self.data.with_vote_if_unvoted(expected_term, vote);
        self.persist_and_apply(next)
    }

    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, io::Error> {
        let next = self.data.with_next_term_and_vote(self.my_member_id.clone());
        self.persist_and_apply(Some(next))?;
        Ok(self.data.current_term)
    }

    fn store_commit_index(&mut self, commit_index: Index) -> Result<(), io::Error> {
        let next = self.data.with_commit_index_if_increased(commit_index);
        self.persist_and_apply(next).map(|_| ())
    }

    fn current_term(&self) -> Term {
        self.data.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<MemberId>>) {
        (self.data.current_term, self.data.voted_for_this_term.clone())
    }

    fn commit_index(&self) -> Option<Index> {
        self.data.commit_index
    }
}
