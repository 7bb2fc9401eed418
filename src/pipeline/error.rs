use crate::pipeline::CatchUpError;
use crate::state_machines::ApplyError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("No commit process bound")]
    NotBound,
    #[error("A commit process is already bound")]
    AlreadyBound,
    #[error("Applier is not started")]
    NotStarted,
    #[error("Applier is already started")]
    AlreadyStarted,
    #[error("Applier is stopped")]
    Stopped,
    // Set after the first apply failure. Every later call fails the same way.
    #[error("Applier halted after an apply failure: {0}")]
    Halted(String),
    #[error("Failed to apply committed entries")]
    Apply(#[source] ApplyError),
    #[error("Failed to re-fetch missing entries")]
    CatchUp(#[from] CatchUpError),
}
