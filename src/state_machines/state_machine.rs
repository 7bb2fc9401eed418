use crate::state_machines::command::CommandDecodeError;

/// A deterministic state machine driven by committed log entries. Every member applying the same
/// log prefix must end up in the same state.
pub trait ReplicatedStateMachine {
    type Command;

    /// Applies `command` committed at `index`. Indexes at or below `last_applied_index()` have
    /// already been applied and are ignored.
    fn apply(&mut self, index: u64, command: Self::Command) -> Result<(), ApplyError>;

    fn last_applied_index(&self) -> u64;
}

/// Failure to apply a committed entry. The member can no longer reproduce the agreed state, so
/// whoever drives the state machines must stop on the first one.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("Entry {index} does not hold a valid command: {source}")]
    Decode {
        index: u64,
        #[source]
        source: CommandDecodeError,
    },

    #[error("Entry {index} does not follow the last applied entry {last_applied}")]
    OutOfOrder { index: u64, last_applied: u64 },

    #[error("Transaction store failed at entry {index}: {reason}")]
    Store { index: u64, reason: String },

    #[error("State machine snapshot in the transaction store is unreadable: {0}")]
    Restore(#[source] CommandDecodeError),

    #[error("State machine snapshot is at {snapshot_index} but the store is at {store_index}")]
    SnapshotMismatch { snapshot_index: u64, store_index: u64 },
}
