//! Moves committed entries, in log order and in batches, into the local store.
mod applier;
mod catch_up;
mod commit_pipeline;
mod commit_process;
mod error;

pub use applier::BatchingApplier;
pub use applier::PipelineConfig;
pub use applier::QueueOutcome;
pub use applier::ShutdownPolicy;
pub use catch_up::CatchUpError;
pub use catch_up::CatchUpSource;
pub use catch_up::LocalCatchUp;
pub use catch_up::RemoteCatchUp;
pub use commit_pipeline::CommitPipeline;
pub use commit_pipeline::CommitPipelineHandle;
pub use commit_pipeline::CommittedEntries;
pub use commit_process::CommitMode;
pub use commit_process::TransactionCommitProcess;
pub use commit_process::TransactionToApply;
pub use commit_process::TxId;
pub use error::PipelineError;
