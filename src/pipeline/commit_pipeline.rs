use crate::api::RaftCommitStream;
use crate::pipeline::{
    BatchingApplier, CatchUpError, CatchUpSource, PipelineError, QueueOutcome, ShutdownPolicy, TransactionToApply,
};
use std::future;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

const CATCH_UP_ATTEMPTS: u32 = 5;
const CATCH_UP_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Where the pipeline reads committed entries from, in log order.
#[async_trait::async_trait]
pub trait CommittedEntries: Send {
    /// `None` once no more entries will ever arrive.
    async fn next_committed(&mut self) -> Option<TransactionToApply>;
}

#[async_trait::async_trait]
impl CommittedEntries for RaftCommitStream {
    async fn next_committed(&mut self) -> Option<TransactionToApply> {
        self.next().await.map(|committed| TransactionToApply {
            index: committed.entry_id.index(),
            payload: committed.payload,
        })
    }
}

/// Background task moving committed entries into a started `BatchingApplier`. A batch is
/// flushed when full or when its oldest entry has waited `max_batch_delay`. When entries go
/// missing, the gap is fetched from the catch-up source before going on.
pub struct CommitPipeline<C: CommittedEntries> {
    logger: slog::Logger,
    entries: C,
    applier: BatchingApplier,
    catch_up: Arc<dyn CatchUpSource>,
}

pub struct CommitPipelineHandle {
    stop_tx: oneshot::Sender<ShutdownPolicy>,
    applied_index: watch::Receiver<u64>,
    task: JoinHandle<Result<(), PipelineError>>,
}

impl<C: CommittedEntries + 'static> CommitPipeline<C> {
    pub fn new(logger: slog::Logger, entries: C, applier: BatchingApplier, catch_up: Arc<dyn CatchUpSource>) -> Self {
        CommitPipeline {
            logger,
            entries,
            applier,
            catch_up,
        }
    }

    /// Runs the pipeline on its own task. Dropping the returned handle stops it with
    /// `ShutdownPolicy::DiscardPending`.
    pub fn spawn(self) -> CommitPipelineHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (applied_tx, applied_index) = watch::channel(self.applier.last_queued_index());
        let task = tokio::spawn(self.run(stop_rx, applied_tx));

        CommitPipelineHandle {
            stop_tx,
            applied_index,
            task,
        }
    }

    async fn run(
        mut self,
        mut stop_rx: oneshot::Receiver<ShutdownPolicy>,
        applied_tx: watch::Sender<u64>,
    ) -> Result<(), PipelineError> {
        let max_batch_delay = self.applier.config().max_batch_delay;
        let mut flush_deadline: Option<Instant> = None;
        let mut published_index = self.applier.last_queued_index();

        loop {
            let flush_timer = async move {
                match flush_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => future::pending::<()>().await,
                }
            };

            tokio::select! {
                stop = &mut stop_rx => {
                    let policy = stop.unwrap_or(ShutdownPolicy::DiscardPending);
                    self.applier.stop(policy)?;
                    let _ = applied_tx.send(self.applier.last_queued_index());
                    return Ok(());
                }
                _ = flush_timer => {
                    self.applier.flush()?;
                }
                entry = self.entries.next_committed() => match entry {
                    Some(entry) => self.queue_filling_gaps(entry).await?,
                    None => {
                        slog::info!(self.logger, "Commit stream closed. Stopping pipeline.");
                        self.applier.stop(ShutdownPolicy::FlushPending)?;
                        let _ = applied_tx.send(self.applier.last_queued_index());
                        return Ok(());
                    }
                },
            }

            if self.applier.pending() == 0 {
                flush_deadline = None;
                if published_index != self.applier.last_queued_index() {
                    published_index = self.applier.last_queued_index();
                    let _ = applied_tx.send(published_index);
                }
            } else if flush_deadline.is_none() {
                flush_deadline = Some(Instant::now() + max_batch_delay);
            }
        }
    }

    async fn queue_filling_gaps(&mut self, entry: TransactionToApply) -> Result<(), PipelineError> {
        let (expected, received) = match self.applier.queue(entry.clone())? {
            QueueOutcome::Gap { expected, received } => (expected, received),
            _ => return Ok(()),
        };

        self.fill_gap(expected, received - 1).await?;

        match self.applier.queue(entry)? {
            QueueOutcome::Gap { expected, .. } => Err(CatchUpError::Unavailable(format!(
                "Entry {} still missing after catch-up",
                expected
            ))
            .into()),
            _ => Ok(()),
        }
    }

    async fn fill_gap(&mut self, from: u64, to_inclusive: u64) -> Result<(), PipelineError> {
        slog::warn!(self.logger, "Re-fetching missing entries [{}, {}]", from, to_inclusive);

        while self.applier.last_queued_index() < to_inclusive {
            let next = self.applier.last_queued_index() + 1;
            let fetched = fetch_with_retries(&self.logger, self.catch_up.as_ref(), next, to_inclusive).await?;

            for entry in fetched {
                if let QueueOutcome::Gap { expected, .. } = self.applier.queue(entry)? {
                    return Err(CatchUpError::Unavailable(format!("Catch-up skipped entry {}", expected)).into());
                }
            }

            if self.applier.last_queued_index() < next {
                return Err(CatchUpError::Unavailable(format!("Catch-up made no progress at {}", next)).into());
            }
        }

        Ok(())
    }
}

async fn fetch_with_retries(
    logger: &slog::Logger,
    catch_up: &dyn CatchUpSource,
    from: u64,
    to_inclusive: u64,
) -> Result<Vec<TransactionToApply>, CatchUpError> {
    let mut backoff = CATCH_UP_INITIAL_BACKOFF;
    let mut attempt = 1;
    loop {
        match catch_up.request_range(from, to_inclusive).await {
            Ok(entries) => return Ok(entries),
            Err(CatchUpError::Unavailable(reason)) if attempt < CATCH_UP_ATTEMPTS => {
                slog::warn!(
                    logger,
                    "Catch-up attempt {} for [{}, {}] failed: {}",
                    attempt,
                    from,
                    to_inclusive,
                    reason
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                attempt += 1;
            }
            Err(e) => {
                slog::crit!(logger, "Can't fill the gap at {}: {}", from, e);
                return Err(e);
            }
        }
    }
}

impl CommitPipelineHandle {
    /// Highest index known to be committed into the store.
    pub fn applied_index(&self) -> u64 {
        *self.applied_index.borrow()
    }

    /// Waits until everything up to `index` is in the store.
    pub async fn wait_for_applied(&mut self, index: u64) -> Result<(), PipelineError> {
        while *self.applied_index.borrow() < index {
            self.applied_index
                .changed()
                .await
                .map_err(|_| PipelineError::Stopped)?;
        }

        Ok(())
    }

    pub async fn stop(self, policy: ShutdownPolicy) -> Result<(), PipelineError> {
        let _ = self.stop_tx.send(policy);
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::Halted(format!("Pipeline task failed: {:?}", e))),
        }
    }
}
