//! Raft-specific view of the generic commit log: term-tagged entries, the commit index, and the
//! stream of committed entries handed to the application.

mod commit_stream;
mod log;
mod log_entry;
mod wiring;

pub(crate) use commit_stream::CommitStream;
pub(crate) use commit_stream::CommittedEntry;
pub use log_entry::EntryPayload;
pub use log_entry::WriteAheadLogEntry;

pub(crate) use log::RetentionPolicy;
pub(super) use log::WriteAheadLog;
pub(super) use wiring::wired;
