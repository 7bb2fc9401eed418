use crate::commitlog;
use crate::commitlog::{Index, LogError};
use crate::replica::local_state::Term;
use crate::replica::write_ahead_log::commit_stream::CommitStreamPublisher;
use crate::replica::{EntryPayload, WriteAheadLogEntry};
use std::cmp;

/// How much committed history is kept around for lagging followers and catch-up.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RetentionPolicy {
    /// Always keep at least this many committed entries.
    pub(crate) min_retained_entries: u64,
    /// A leader stops protecting followers that are further behind than this.
    pub(crate) max_retained_entries: u64,
}

/// WriteAheadLog is the raft-specific log facade.
///
/// Note: A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - written to disk, not yet replicated to majority
/// 2. Committed - written to disk, replicated to majority
/// 3. Applied - a committed entry that has also been published to the commit stream
///
/// A log entry's state has no global truth. Each replica will have their own local view of what
/// state the log entry is in.
pub(crate) struct WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    // Application's info/debug log.
    logger: slog::Logger,

    // This is the log that we're replicating.
    log: L,
    // Metadata about the highest log entry that we've locally written. It must be updated atomically.
    latest_entry_metadata: Option<(Term, Index)>,

    // Commit stream to publish committed entries to. To be consumed by the application layer to
    // apply committed entries to their state machine.
    commit_stream: CommitStreamPublisher,
    // Index of highest log entry known to be committed. None if nothing is committed.
    commit_index: Option<Index>,
    // Index of highest log entry published to the commit stream. None if nothing is published.
    last_applied_index: Option<Index>,

    retention: RetentionPolicy,
}

impl<L> WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    /// Builds the facade on top of whatever `log` already holds. Committed entries are published
    /// again from the first retained index; consumers skip what they already applied.
    pub(super) fn new(
        logger: slog::Logger,
        log: L,
        commit_stream: CommitStreamPublisher,
        retention: RetentionPolicy,
        persisted_commit_index: Option<Index>,
    ) -> Result<Self, LogError> {
        let latest_entry_metadata = match log.next_index().checked_minus(1) {
            None => None,
            Some(last_index) => match log.read(last_index)? {
                Some(entry) => Some((entry.term, last_index)),
                None => None,
            },
        };

        let latest_index = latest_entry_metadata.map(|(_, index)| index);
        let commit_index = match (persisted_commit_index, latest_index) {
            (Some(commit), Some(latest)) if commit > latest => {
                slog::warn!(
                    logger,
                    "Persisted commit index {:?} is past the end of the log {:?}. Clamping.",
                    commit,
                    latest
                );
                Some(latest)
            }
            (Some(_), None) => None,
            (commit, _) => commit,
        };
        let last_applied_index = log.first_index().checked_minus(1);

        slog::info!(
            logger,
            "Write-ahead log ready. Latest entry {:?}, commit index {:?}",
            latest_entry_metadata,
            commit_index
        );

        Ok(WriteAheadLog {
            logger,
            log,
            latest_entry_metadata,
            commit_stream,
            commit_index,
            last_applied_index,
            retention,
        })
    }

    pub(crate) fn latest_entry(&self) -> Option<(Term, Index)> {
        self.latest_entry_metadata
    }

    pub(crate) fn latest_index(&self) -> Option<Index> {
        self.latest_entry_metadata.map(|(_, index)| index)
    }

    pub(crate) fn first_index(&self) -> Index {
        self.log.first_index()
    }

    pub(crate) fn next_index(&self) -> Index {
        self.log.next_index()
    }

    pub(crate) fn read(&self, index: Index) -> Result<Option<WriteAheadLogEntry>, LogError> {
        self.log.read(index)
    }

    pub(crate) fn read_range(&self, from: Index, to_inclusive: Index) -> Result<Vec<WriteAheadLogEntry>, LogError> {
        self.log.read_range(from, to_inclusive)
    }

    fn read_required(&self, index: Index) -> Result<WriteAheadLogEntry, LogError> {
        match self.read(index)? {
            Some(entry) => Ok(entry),
            None => Err(LogError::Corrupted(format!(
                "Expected a log entry at index {:?}, found none",
                index
            ))),
        }
    }

    /// Remove anything starting at `index` and later.
    pub(crate) fn truncate(&mut self, index: Index) -> Result<(), LogError> {
        if let Some(commit_index) = self.commit_index {
            assert!(
                index > commit_index,
                "Can't truncate committed entries. Truncate from {:?}, commit index {:?}",
                index,
                commit_index
            );
        }

        let mut new_latest_entry_metadata = None;
        if let Some(new_latest_entry_index) = index.checked_minus(1) {
            new_latest_entry_metadata = self
                .read(new_latest_entry_index)?
                .map(|latest_entry| (latest_entry.term, new_latest_entry_index));
        }

        // Only update our view after the log action completes.
        self.log.truncate(index)?;

        self.latest_entry_metadata = new_latest_entry_metadata;
        Ok(())
    }

    pub(crate) fn append(&mut self, entry: WriteAheadLogEntry) -> Result<Index, LogError> {
        let appended_term = entry.term;
        let appended_index = self.log.append(self.log.next_index(), entry)?;
        // Only update state after log action completes.
        self.latest_entry_metadata = Some((appended_term, appended_index));

        Ok(appended_index)
    }

    pub(crate) fn sync(&mut self) -> Result<(), LogError> {
        self.log.sync()
    }

    pub(crate) fn reader(&self) -> L::Reader {
        self.log.reader()
    }

    pub(crate) fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }

    /// Leader path. Returns true if the commit index moved.
    pub(crate) fn ratchet_fwd_commit_index_if_valid(
        &mut self,
        tentative_new_commit_index: Index,
        current_term: Term,
    ) -> Result<bool, LogError> {
        // Older or equal indexes are a no-op; a majority can't un-replicate an entry.
        if let Some(current_commit_index) = self.commit_index {
            if tentative_new_commit_index <= current_commit_index {
                return Ok(false);
            }
        }

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        let entry = self.read_required(tentative_new_commit_index)?;
        if entry.term != current_term {
            return Ok(false);
        }

        self.ratchet_fwd_commit_index_panicking(tentative_new_commit_index);

        Ok(true)
    }

    /// Follower path. Returns true if the commit index moved.
    pub(crate) fn ratchet_fwd_commit_index_if_greater(&mut self, new_commit_index: Index) -> bool {
        if matches!(self.commit_index(), Some(ci) if ci >= new_commit_index) {
            return false;
        }

        self.ratchet_fwd_commit_index_panicking(new_commit_index);
        true
    }

    fn ratchet_fwd_commit_index_panicking(&mut self, new_commit_index: Index) {
        // Assert we only ratchet commit index forward.
        if let Some(current_commit_index) = self.commit_index {
            assert!(
                new_commit_index > current_commit_index,
                "Can't ratchet commit index backwards. Expected [input] {:?} > {:?} [current]",
                new_commit_index,
                current_commit_index,
            );
        }

        // Assert we only mark as committed if we have the entry locally.
        let latest_locally_written_index = match self.latest_index() {
            Some(index) => index,
            None => panic!("Can't ratchet commit index forward if we don't have any local logs"),
        };
        assert!(
            latest_locally_written_index >= new_commit_index,
            "Can't ratchet commit index forwards past our local log. Expected [latest log] {:?} >= {:?} [input]",
            latest_locally_written_index,
            new_commit_index,
        );

        self.commit_index.replace(new_commit_index);
    }

    /// apply_all_committed_entries publishes all committed but unpublished entries in order.
    pub(crate) fn apply_all_committed_entries(&mut self) {
        if let Err(e) = self.try_apply_all_committed_entries() {
            // We've already persisted the log. Publishing committed entries is not on the
            // critical path. We can retry next time the commit index moves.
            slog::error!(self.logger, "Failed to publish a committed log entry. {:?}", e);
        }
    }

    fn try_apply_all_committed_entries(&mut self) -> Result<(), LogError> {
        let commit_index = match self.commit_index {
            Some(ci) => ci,
            None => return Ok(()),
        };

        let next_to_apply = match self.last_applied_index {
            None => Index::start_index(),
            Some(last_applied) => last_applied.plus(1),
        };
        if next_to_apply > commit_index {
            return Ok(());
        }

        // This may be a long running loop after a restart, and starve the Replica event loop from
        // handling another event. Entries are read in bounded chunks.
        let mut cursor = next_to_apply;
        while cursor <= commit_index {
            let chunk_end = cmp::min(commit_index, cursor.plus(APPLY_CHUNK_SIZE - 1));
            let entries = self.log.read_range(cursor, chunk_end)?;
            if entries.is_empty() {
                return Err(LogError::Corrupted(format!(
                    "Committed entries [{:?}, {:?}] are missing",
                    cursor, chunk_end
                )));
            }

            for entry in entries {
                self.commit_stream
                    .notify_commit(&self.logger, entry.term, cursor, entry.payload);
                self.last_applied_index.replace(cursor);
                cursor = cursor.plus(1);
            }
        }

        Ok(())
    }

    /// Drops retained history that no one needs anymore. `lowest_follower_match` is `Some` on the
    /// leader only, holding the lowest index known to be replicated on any follower.
    pub(crate) fn prune_committed(&mut self, lowest_follower_match: Option<Option<Index>>) -> Result<(), LogError> {
        let limit = match self.prune_limit(lowest_follower_match) {
            Some(limit) => limit,
            None => return Ok(()),
        };
        if limit < self.log.first_index() {
            return Ok(());
        }

        let before = self.log.first_index();
        let after = self.log.prune(limit)?;
        if after != before {
            slog::debug!(self.logger, "Pruned log [{:?}, {:?})", before, after);
        }

        Ok(())
    }

    fn prune_limit(&self, lowest_follower_match: Option<Option<Index>>) -> Option<Index> {
        let commit = self.commit_index?.as_u64();
        // Never drop anything the commit stream hasn't seen yet.
        let applied = self.last_applied_index?.as_u64();

        let mut limit = cmp::min(commit, applied).saturating_sub(self.retention.min_retained_entries);
        if let Some(lowest_match) = lowest_follower_match {
            // Keep the entry at a follower's match index, its term is needed for AppendEntries.
            let still_needed = commitlog::opt_index_as_u64(lowest_match).saturating_sub(1);
            let horizon = commit.saturating_sub(self.retention.max_retained_entries);
            limit = cmp::min(limit, cmp::max(still_needed, horizon));
        }

        Index::from_u64_opt(limit)
    }
}

const APPLY_CHUNK_SIZE: u64 = 256;

impl WriteAheadLogEntry {
    pub(crate) fn barrier(term: Term) -> Self {
        WriteAheadLogEntry {
            term,
            payload: EntryPayload::LeaderBarrier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::{InMemoryLog, Log};
    use crate::replica::write_ahead_log::{commit_stream, CommitStream};
    use bytes::Bytes;

    fn command(term: u64, data: &'static str) -> WriteAheadLogEntry {
        WriteAheadLogEntry {
            term: Term::new(term),
            payload: EntryPayload::Command(Bytes::from_static(data.as_bytes())),
        }
    }

    fn retention(min: u64, max: u64) -> RetentionPolicy {
        RetentionPolicy {
            min_retained_entries: min,
            max_retained_entries: max,
        }
    }

    fn wal_over(
        log: InMemoryLog<WriteAheadLogEntry>,
        retention: RetentionPolicy,
        commit: Option<Index>,
    ) -> (WriteAheadLog<InMemoryLog<WriteAheadLogEntry>>, CommitStream) {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let (publisher, stream) = commit_stream::new();
        let wal = WriteAheadLog::new(logger, log, publisher, retention, commit).unwrap();
        (wal, stream)
    }

    #[test]
    fn commit_requires_current_term_entry() {
        let (mut wal, mut stream) = wal_over(InMemoryLog::create().unwrap(), retention(0, 0), None);
        wal.append(command(1, "a")).unwrap();
        wal.append(command(2, "b")).unwrap();

        // Entry 1 is from an older term; the leader of term 2 can't commit it directly.
        assert!(!wal.ratchet_fwd_commit_index_if_valid(Index::new(1), Term::new(2)).unwrap());
        assert_eq!(wal.commit_index(), None);

        // Committing entry 2 commits entry 1 indirectly.
        assert!(wal.ratchet_fwd_commit_index_if_valid(Index::new(2), Term::new(2)).unwrap());
        wal.apply_all_committed_entries();

        assert_eq!(stream.try_recv().unwrap().index, Index::new(1));
        assert_eq!(stream.try_recv().unwrap().index, Index::new(2));
        assert!(stream.try_recv().is_none());

        // Stale or equal commit indexes are ignored.
        assert!(!wal.ratchet_fwd_commit_index_if_greater(Index::new(1)));
        assert_eq!(wal.commit_index(), Some(Index::new(2)));
    }

    #[test]
    #[should_panic]
    fn commit_index_past_local_log_panics() {
        let (mut wal, _stream) = wal_over(InMemoryLog::create().unwrap(), retention(0, 0), None);
        wal.append(command(1, "a")).unwrap();
        wal.ratchet_fwd_commit_index_if_greater(Index::new(2));
    }

    #[test]
    fn restart_republishes_committed_entries() {
        let mut log = InMemoryLog::create().unwrap();
        for (i, data) in ["a", "b", "c"].iter().enumerate() {
            log.append(Index::new_usize(i + 1), command(4, data)).unwrap();
        }

        let (mut wal, mut stream) = wal_over(log, retention(0, 0), Some(Index::new(2)));
        assert_eq!(wal.latest_entry(), Some((Term::new(4), Index::new(3))));
        assert_eq!(wal.commit_index(), Some(Index::new(2)));

        wal.apply_all_committed_entries();
        assert_eq!(stream.try_recv().unwrap().index, Index::new(1));
        assert_eq!(stream.try_recv().unwrap().index, Index::new(2));
        assert!(stream.try_recv().is_none());
    }

    #[test]
    fn truncate_updates_latest_entry() {
        let (mut wal, _stream) = wal_over(InMemoryLog::create().unwrap(), retention(0, 0), None);
        wal.append(command(1, "a")).unwrap();
        wal.append(command(1, "b")).unwrap();
        wal.append(command(2, "c")).unwrap();

        wal.truncate(Index::new(2)).unwrap();
        assert_eq!(wal.latest_entry(), Some((Term::new(1), Index::new(1))));
        assert_eq!(wal.next_index(), Index::new(2));
    }

    #[test]
    fn retention_protects_lagging_followers_up_to_horizon() {
        let (mut wal, _stream) = wal_over(InMemoryLog::create().unwrap(), retention(2, 10), None);
        for _ in 0..30 {
            wal.append(command(1, "x")).unwrap();
        }
        wal.ratchet_fwd_commit_index_if_valid(Index::new(25), Term::new(1)).unwrap();
        wal.apply_all_committed_entries();

        // Follower has entry 20: keep 20 onwards.
        assert_eq!(wal.prune_limit(Some(Some(Index::new(20)))), Some(Index::new(19)));
        // Follower far behind: stop protecting it at the horizon (commit - max retained).
        assert_eq!(wal.prune_limit(Some(Some(Index::new(3)))), Some(Index::new(15)));
        // Followers only honour the minimum retention.
        assert_eq!(wal.prune_limit(None), Some(Index::new(23)));

        wal.prune_committed(None).unwrap();
        assert_eq!(wal.first_index(), Index::new(24));
        assert_eq!(wal.read(Index::new(23)).unwrap(), None);
    }
}
