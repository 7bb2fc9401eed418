use crate::commitlog::log::clip_range;
use crate::commitlog::{Entry, Index, Log, LogError, LogReader};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::convert::TryFrom;
use std::marker::PhantomData;
use std::sync::Arc;

// Volatile log. Same contract as the disk log, minus durability. Used by tests and by members
// that are happy to rebuild from the leader after every restart.
pub struct InMemoryLog<E: Entry> {
    shared: Arc<RwLock<InMemoryState>>,
    _pd: PhantomData<E>,
}

pub struct InMemoryLogReader<E: Entry> {
    shared: Arc<RwLock<InMemoryState>>,
    _pd: PhantomData<E>,
}

struct InMemoryState {
    first_index: Index,
    // We don't *need* to convert these to bytes. We could just hold the original entry in memory,
    // but we want to exercise the conversion logic.
    log: VecDeque<Vec<u8>>,
}

impl InMemoryState {
    fn next_index(&self) -> Index {
        self.first_index.plus(self.log.len() as u64)
    }

    fn vec_index(&self, index: Index) -> Option<usize> {
        if index < self.first_index || index >= self.next_index() {
            return None;
        }

        Some(self.first_index.distance_to(index) as usize)
    }

    fn read<E: Entry>(&self, index: Index) -> Result<Option<E>, LogError> {
        match self.vec_index(index) {
            None => Ok(None),
            Some(i) => Ok(Some(E::try_from(self.log[i].clone())?)),
        }
    }

    fn read_range<E: Entry>(&self, from: Index, to_inclusive: Index) -> Result<Vec<E>, LogError> {
        let (from, to_inclusive) = match clip_range(from, to_inclusive, self.first_index, self.next_index())? {
            None => return Ok(Vec::new()),
            Some(range) => range,
        };

        let start = self.first_index.distance_to(from) as usize;
        let end = self.first_index.distance_to(to_inclusive) as usize;
        let mut entries = Vec::with_capacity(end - start + 1);
        for bytes in self.log.range(start..=end) {
            entries.push(E::try_from(bytes.clone())?);
        }

        Ok(entries)
    }
}

impl<E: Entry> InMemoryLog<E> {
    pub fn create() -> Result<Self, LogError> {
        Ok(InMemoryLog {
            shared: Arc::new(RwLock::new(InMemoryState {
                first_index: Index::start_index(),
                log: VecDeque::new(),
            })),
            _pd: PhantomData::default(),
        })
    }
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    type Reader = InMemoryLogReader<E>;

    fn append(&mut self, index: Index, entry: E) -> Result<Index, LogError> {
        let mut state = self.shared.write();
        let expected = state.next_index();
        if index != expected {
            return Err(LogError::NonContiguous {
                expected,
                actual: index,
            });
        }

        state.log.push_back(entry.into());
        Ok(index)
    }

    fn read(&self, index: Index) -> Result<Option<E>, LogError> {
        self.shared.read().read(index)
    }

    fn read_range(&self, from: Index, to_inclusive: Index) -> Result<Vec<E>, LogError> {
        self.shared.read().read_range(from, to_inclusive)
    }

    fn truncate(&mut self, index: Index) -> Result<(), LogError> {
        let mut state = self.shared.write();
        if index < state.first_index {
            return Err(LogError::Pruned {
                requested: index,
                first_retained: state.first_index,
            });
        }

        let keep = state.first_index.distance_to(index) as usize;
        state.log.truncate(keep);
        Ok(())
    }

    fn prune(&mut self, up_to: Index) -> Result<Index, LogError> {
        let mut state = self.shared.write();
        // Keep the latest entry around so the log always knows the term of its tail.
        let last_prunable = match state.next_index().checked_minus(2) {
            Some(i) => std::cmp::min(i, up_to),
            None => return Ok(state.first_index),
        };

        while state.first_index <= last_prunable {
            state.log.pop_front();
            state.first_index = state.first_index.plus(1);
        }

        Ok(state.first_index)
    }

    fn sync(&mut self) -> Result<(), LogError> {
        Ok(())
    }

    fn first_index(&self) -> Index {
        self.shared.read().first_index
    }

    fn next_index(&self) -> Index {
        self.shared.read().next_index()
    }

    fn reader(&self) -> Self::Reader {
        InMemoryLogReader {
            shared: self.shared.clone(),
            _pd: PhantomData::default(),
        }
    }
}

impl<E: Entry> Clone for InMemoryLogReader<E> {
    fn clone(&self) -> Self {
        InMemoryLogReader {
            shared: self.shared.clone(),
            _pd: PhantomData::default(),
        }
    }
}

impl<E: Entry> LogReader<E> for InMemoryLogReader<E> {
    fn read(&self, index: Index) -> Result<Option<E>, LogError> {
        self.shared.read().read(index)
    }

    fn read_range(&self, from: Index, to_inclusive: Index) -> Result<Vec<E>, LogError> {
        self.shared.read().read_range(from, to_inclusive)
    }

    fn first_index(&self) -> Index {
        self.shared.read().first_index
    }

    fn next_index(&self) -> Index {
        self.shared.read().next_index()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::commitlog::EntryDecodeError;

    /// Minimal entry used by the commitlog tests.
    #[derive(Clone, Debug, PartialEq)]
    pub(crate) struct TestEntry(pub(crate) Vec<u8>);

    impl Entry for TestEntry {}

    impl TryFrom<Vec<u8>> for TestEntry {
        type Error = EntryDecodeError;

        fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
            Ok(TestEntry(bytes))
        }
    }

    impl From<TestEntry> for Vec<u8> {
        fn from(entry: TestEntry) -> Self {
            entry.0
        }
    }

    pub(crate) fn entry(v: u64) -> TestEntry {
        TestEntry(v.to_be_bytes().to_vec())
    }

    fn log_with(n: u64) -> InMemoryLog<TestEntry> {
        let mut log = InMemoryLog::create().unwrap();
        for i in 1..=n {
            log.append(Index::new(i), entry(i)).unwrap();
        }
        log
    }

    #[test]
    fn append_rejects_non_contiguous_index() {
        let mut log = log_with(3);

        let err = log.append(Index::new(5), entry(5)).unwrap_err();
        assert!(matches!(
            err,
            LogError::NonContiguous { expected, actual } if expected == Index::new(4) && actual == Index::new(5)
        ));
        assert_eq!(log.next_index(), Index::new(4));
    }

    #[test]
    fn truncate_and_reappend() {
        let mut log = log_with(5);

        log.truncate(Index::new(3)).unwrap();
        assert_eq!(log.next_index(), Index::new(3));
        assert_eq!(log.read(Index::new(3)).unwrap(), None);

        log.append(Index::new(3), entry(33)).unwrap();
        assert_eq!(log.read(Index::new(3)).unwrap(), Some(entry(33)));
    }

    #[test]
    fn prune_keeps_tail_and_reports_pruned_ranges() {
        let mut log = log_with(5);

        assert_eq!(log.prune(Index::new(3)).unwrap(), Index::new(4));
        assert_eq!(log.read(Index::new(3)).unwrap(), None);
        assert!(matches!(
            log.read_range(Index::new(2), Index::new(5)),
            Err(LogError::Pruned { first_retained, .. }) if first_retained == Index::new(4)
        ));

        // Never prunes the last entry.
        assert_eq!(log.prune(Index::new(100)).unwrap(), Index::new(5));
        assert_eq!(log.read(Index::new(5)).unwrap(), Some(entry(5)));
        assert_eq!(log.next_index(), Index::new(6));
    }

    #[test]
    fn reader_observes_writer() {
        let mut log = log_with(2);
        let reader = log.reader();

        log.append(Index::new(3), entry(3)).unwrap();
        assert_eq!(reader.next_index(), Index::new(4));
        assert_eq!(
            reader.read_range(Index::new(2), Index::new(10)).unwrap(),
            vec![entry(2), entry(3)]
        );
    }
}
