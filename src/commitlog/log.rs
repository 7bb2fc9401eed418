use std::convert::TryFrom;
use std::{fmt, io};

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
struct U64NonZero(u64);

impl U64NonZero {
    fn new(val: u64) -> Self {
        assert_ne!(val, 0);
        U64NonZero(val)
    }
}

/// Index is an index of an entry in the log; i.e. a log entry's index.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Index(U64NonZero);

impl Index {
    pub fn new(index: u64) -> Self {
        Index(U64NonZero::new(index))
    }

    pub fn new_usize(index: usize) -> Self {
        Self::new(index as u64)
    }

    /// Wire and disk formats use 0 for "no index".
    pub fn from_u64_opt(index: u64) -> Option<Self> {
        match index {
            0 => None,
            index => Some(Index::new(index)),
        }
    }

    pub fn start_index() -> Self {
        Self::new(1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0 .0
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index::new(self.as_u64() + delta)
    }

    pub fn minus(&self, delta: u64) -> Index {
        Index::new(self.as_u64() - delta)
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Index> {
        self.as_u64()
            .checked_sub(delta)
            .and_then(Index::from_u64_opt)
    }

    /// Number of indexes in `[self, end)`. Zero if `end <= self`.
    pub fn distance_to(&self, end: Index) -> u64 {
        end.as_u64().saturating_sub(self.as_u64())
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 .0)
    }
}

pub fn opt_index_as_u64(index: Option<Index>) -> u64 {
    index.map(|i| i.as_u64()).unwrap_or(0)
}

/// Log is an append only log intended for use as a replicated commit log in a database.
///
/// Log indexes entries starting from 1. There will be no entry existing at index 0. The first
/// entry is written at index 1. After pruning, the log starts at `first_index()` instead.
///
/// A log has exactly one writer. Concurrent readers go through `reader()`.
pub trait Log<E: Entry> {
    type Reader: LogReader<E> + Clone + Send + Sync + 'static;

    /// append() appends a log entry at `index`, which must be `next_index()`. Returns the index
    /// that was used. The entry is not guaranteed durable until `sync()` returns.
    fn append(&mut self, index: Index, entry: E) -> Result<Index, LogError>;

    /// Read log entry at specified index. `None` if the entry was never written or was pruned.
    fn read(&self, index: Index) -> Result<Option<E>, LogError>;

    /// Read entries in `[from, to_inclusive]`, clipped to the end of the log.
    fn read_range(&self, from: Index, to_inclusive: Index) -> Result<Vec<E>, LogError>;

    /// Removes anything starting at `index` and later.
    fn truncate(&mut self, index: Index) -> Result<(), LogError>;

    /// Drops retained history up to and including `up_to`, at whatever granularity the log is
    /// stored in. The most recent entries are never dropped. Returns the new first index.
    fn prune(&mut self, up_to: Index) -> Result<Index, LogError>;

    /// Flush everything appended so far to durable storage.
    fn sync(&mut self) -> Result<(), LogError>;

    /// first_index returns the lowest index still retained.
    fn first_index(&self) -> Index;

    /// next_index returns the next index that will be used to append an entry.
    fn next_index(&self) -> Index;

    fn reader(&self) -> Self::Reader;
}

/// LogReader is a read-only view of a `Log` that can be used from other tasks/threads while the
/// writer keeps appending.
pub trait LogReader<E: Entry> {
    fn read(&self, index: Index) -> Result<Option<E>, LogError>;

    fn read_range(&self, from: Index, to_inclusive: Index) -> Result<Vec<E>, LogError>;

    fn first_index(&self) -> Index;

    fn next_index(&self) -> Index;
}

// Choice of Vec<u8> vs Bytes will depend on whats easier for disk to use.
pub trait Entry: Clone + Send + Sync + 'static + TryFrom<Vec<u8>, Error = EntryDecodeError> + Into<Vec<u8>> {}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct EntryDecodeError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("Non-contiguous append. Expected index {expected:?}, got {actual:?}")]
    NonContiguous { expected: Index, actual: Index },

    #[error("Index {requested:?} is no longer retained. First retained index is {first_retained:?}")]
    Pruned { requested: Index, first_retained: Index },

    #[error("Entry of {len} bytes exceeds the maximum record payload of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Log is corrupted: {0}")]
    Corrupted(String),

    #[error("Failed to decode log entry: {0}")]
    Decode(#[from] EntryDecodeError),

    #[error("Log IO failure: {0}")]
    Io(#[from] io::Error),
}

impl LogError {
    /// Integrity violations mean the local log can no longer be trusted to participate in
    /// consensus until it is resynchronized.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            LogError::NonContiguous { .. } | LogError::Corrupted(_) | LogError::Decode(_)
        )
    }
}

/// Shared clipping logic for `read_range` implementations. Returns `None` when the range is empty.
pub(super) fn clip_range(
    from: Index,
    to_inclusive: Index,
    first_index: Index,
    next_index: Index,
) -> Result<Option<(Index, Index)>, LogError> {
    if from < first_index {
        return Err(LogError::Pruned {
            requested: from,
            first_retained: first_index,
        });
    }

    let last_index = match next_index.checked_minus(1) {
        Some(last) => last,
        None => return Ok(None),
    };
    let to_inclusive = std::cmp::min(to_inclusive, last_index);
    if from > to_inclusive {
        return Ok(None);
    }

    Ok(Some((from, to_inclusive)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_arithmetic() {
        let i = Index::new(5);
        assert_eq!(i.plus(2), Index::new(7));
        assert_eq!(i.minus(4), Index::start_index());
        assert_eq!(i.checked_minus(5), None);
        assert_eq!(i.checked_minus(10), None);
        assert_eq!(Index::start_index().distance_to(Index::new(4)), 3);
        assert_eq!(Index::new(4).distance_to(Index::new(2)), 0);
        assert_eq!(Index::from_u64_opt(0), None);
        assert_eq!(opt_index_as_u64(Some(Index::new(9))), 9);
    }

    #[test]
    fn clip_range_rules() {
        let first = Index::new(3);
        let next = Index::new(10);

        assert!(matches!(
            clip_range(Index::new(2), Index::new(5), first, next),
            Err(LogError::Pruned { .. })
        ));
        assert_eq!(
            clip_range(Index::new(3), Index::new(50), first, next).unwrap(),
            Some((Index::new(3), Index::new(9)))
        );
        assert_eq!(clip_range(Index::new(10), Index::new(12), first, next).unwrap(), None);
        assert_eq!(clip_range(Index::new(6), Index::new(5), first, next).unwrap(), None);
        assert_eq!(
            clip_range(Index::start_index(), Index::new(3), Index::start_index(), Index::start_index()).unwrap(),
            None
        );
    }
}
