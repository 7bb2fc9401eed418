use crate::commitlog;
use crate::commitlog::{Index, LogError};
use crate::replica::write_ahead_log::{commit_stream, RetentionPolicy, WriteAheadLog};
use crate::replica::{CommitStream, WriteAheadLogEntry};

pub(in super::super) fn wired<L>(
    logger: slog::Logger,
    log: L,
    retention: RetentionPolicy,
    persisted_commit_index: Option<Index>,
) -> Result<(WriteAheadLog<L>, CommitStream), LogError>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    let (publisher, stream) = commit_stream::new();

    let wal = WriteAheadLog::new(logger, log, publisher, retention, persisted_commit_index)?;

    Ok((wal, stream))
}
