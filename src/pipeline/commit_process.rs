use crate::replica::EntryPayload;
use crate::state_machines::ApplyError;

pub type TxId = u64;

/// A committed log entry on its way into the local store.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionToApply {
    pub index: u64,
    pub payload: EntryPayload,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CommitMode {
    /// The batch was decided by the cluster, not produced locally.
    External,
}

/// Whatever the batching applier flushes into. Bound to the applier after construction, since
/// the store usually isn't ready yet when the raft member is created.
pub trait TransactionCommitProcess: Send {
    /// Highest log index whose effects are durable in the store. 0 when nothing is.
    fn last_committed_index(&self) -> u64;

    /// Applies a contiguous, index ordered batch. Either the whole batch takes effect or none of
    /// it does. Returns the id of the last transaction the store holds afterwards.
    fn commit(&mut self, batch: &[TransactionToApply], mode: CommitMode) -> Result<TxId, ApplyError>;
}
