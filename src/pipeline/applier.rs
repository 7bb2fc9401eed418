use crate::pipeline::commit_process::{CommitMode, TransactionCommitProcess, TransactionToApply};
use crate::pipeline::PipelineError;
use std::mem;
use tokio::time::Duration;

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// A batch is flushed as soon as it holds this many entries.
    pub max_batch_size: usize,
    /// ...or once its oldest entry has waited this long.
    pub max_batch_delay: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            max_batch_size: 64,
            max_batch_delay: Duration::from_millis(10),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownPolicy {
    /// Commit whatever has accumulated before stopping.
    FlushPending,
    /// Drop the accumulated batch. It will be replayed from the log on the next start.
    DiscardPending,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueueOutcome {
    Queued,
    /// The entry filled the batch, which was committed.
    Flushed,
    /// At or below the last queued index. Happens while the log replays after a restart.
    Duplicate,
    /// The entry was dropped because entries before it are missing.
    Gap { expected: u64, received: u64 },
}

enum ApplierState {
    Created,
    Bound(Box<dyn TransactionCommitProcess>),
    Started(Box<dyn TransactionCommitProcess>),
    Stopped,
    Halted(String),
}

/// Collects committed entries into batches and commits them, strictly in log order, into a bound
/// `TransactionCommitProcess`.
///
/// Lifecycle: `new` → `bind` → `start` → `queue`/`flush`... → `stop`.
pub struct BatchingApplier {
    logger: slog::Logger,
    config: PipelineConfig,
    state: ApplierState,
    batch: Vec<TransactionToApply>,
    last_queued_index: u64,
}

impl BatchingApplier {
    pub fn new(logger: slog::Logger, config: PipelineConfig) -> Self {
        BatchingApplier {
            logger,
            batch: Vec::with_capacity(config.max_batch_size),
            config,
            state: ApplierState::Created,
            last_queued_index: 0,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn bind(&mut self, commit_process: Box<dyn TransactionCommitProcess>) -> Result<(), PipelineError> {
        match self.state {
            ApplierState::Created => {
                self.state = ApplierState::Bound(commit_process);
                Ok(())
            }
            _ => Err(PipelineError::AlreadyBound),
        }
    }

    /// Picks up where the bound process left off. Must happen before anything is queued.
    pub fn start(&mut self) -> Result<(), PipelineError> {
        match mem::replace(&mut self.state, ApplierState::Created) {
            ApplierState::Bound(commit_process) => {
                self.last_queued_index = commit_process.last_committed_index();
                slog::info!(self.logger, "Applier started after index {}", self.last_queued_index);
                self.state = ApplierState::Started(commit_process);
                Ok(())
            }
            ApplierState::Created => Err(PipelineError::NotBound),
            other => {
                let error = self.unusable_error(&other);
                self.state = other;
                Err(error)
            }
        }
    }

    pub fn last_queued_index(&self) -> u64 {
        self.last_queued_index
    }

    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    pub fn queue(&mut self, entry: TransactionToApply) -> Result<QueueOutcome, PipelineError> {
        self.ensure_started()?;

        let expected = self.last_queued_index + 1;
        if entry.index < expected {
            slog::debug!(self.logger, "Skipping already applied index {}", entry.index);
            return Ok(QueueOutcome::Duplicate);
        }
        if entry.index > expected {
            slog::warn!(
                self.logger,
                "Dropping entry {} out of order; expected {}",
                entry.index,
                expected
            );
            return Ok(QueueOutcome::Gap {
                expected,
                received: entry.index,
            });
        }

        self.last_queued_index = entry.index;
        self.batch.push(entry);

        if self.batch.len() >= self.config.max_batch_size {
            self.flush()?;
            return Ok(QueueOutcome::Flushed);
        }

        Ok(QueueOutcome::Queued)
    }

    /// Commits the accumulated batch, if any, as one unit.
    pub fn flush(&mut self) -> Result<(), PipelineError> {
        self.ensure_started()?;
        if self.batch.is_empty() {
            return Ok(());
        }

        let batch = mem::take(&mut self.batch);
        let result = match &mut self.state {
            ApplierState::Started(commit_process) => commit_process.commit(&batch, CommitMode::External),
            _ => return Err(PipelineError::NotStarted),
        };

        match result {
            Ok(tx_id) => {
                slog::debug!(
                    self.logger,
                    "Committed {} entries through index {} (tx {})",
                    batch.len(),
                    self.last_queued_index,
                    tx_id
                );
                Ok(())
            }
            Err(e) => {
                slog::crit!(self.logger, "Applying committed entries failed. Halting. {}", e);
                self.state = ApplierState::Halted(e.to_string());
                Err(PipelineError::Apply(e))
            }
        }
    }

    pub fn stop(&mut self, policy: ShutdownPolicy) -> Result<(), PipelineError> {
        if let ApplierState::Started(_) = self.state {
            match policy {
                ShutdownPolicy::FlushPending => self.flush()?,
                ShutdownPolicy::DiscardPending => {
                    if !self.batch.is_empty() {
                        slog::info!(self.logger, "Discarding {} pending entries", self.batch.len());
                    }
                    self.batch.clear();
                    if let ApplierState::Started(commit_process) = &self.state {
                        self.last_queued_index = commit_process.last_committed_index();
                    }
                }
            }
            self.state = ApplierState::Stopped;
            slog::info!(self.logger, "Applier stopped at index {}", self.last_queued_index);
        }

        Ok(())
    }

    fn ensure_started(&self) -> Result<(), PipelineError> {
        match &self.state {
            ApplierState::Started(_) => Ok(()),
            other => Err(self.unusable_error(other)),
        }
    }

    fn unusable_error(&self, state: &ApplierState) -> PipelineError {
        match state {
            ApplierState::Created | ApplierState::Bound(_) => PipelineError::NotStarted,
            ApplierState::Started(_) => PipelineError::AlreadyStarted,
            ApplierState::Stopped => PipelineError::Stopped,
            ApplierState::Halted(reason) => PipelineError::Halted(reason.clone()),
        }
    }
}
