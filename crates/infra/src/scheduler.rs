//! Timed write batches.
//!
//! [`WriteScheduler::schedule`] turns an ordered list of writes into one task
//! per write; the write at index `i` starts no earlier than `delay * i` after
//! the batch was scheduled. Writes do not wait for each other, so a slow write
//! never delays the next one's start and completions may interleave.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use changewatch_core::{BatchId, ChangewatchError, Namespace};
use changewatch_events::{DocumentStore, WriteResult, WriteSpec};

/// What happened to one write of a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteStatus {
    Completed(WriteResult),
    Failed(ChangewatchError),
    /// The batch was cancelled before this write started.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// Position of the write in its batch.
    pub index: usize,
    pub kind: &'static str,
    /// Time between scheduling and the write starting; `None` if it never started.
    pub initiated_after: Option<Duration>,
    pub status: WriteStatus,
}

impl WriteOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, WriteStatus::Completed(_))
    }
}

/// Outcomes of a finished batch, ordered by index.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub outcomes: Vec<WriteOutcome>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, WriteStatus::Failed(_)))
            .count()
    }

    pub fn cancelled(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, WriteStatus::Cancelled))
            .count()
    }
}

/// A running batch.
///
/// Dropping it cancels every write that has not started yet, so pending timers
/// never outlive their owner.
#[derive(Debug)]
#[must_use = "dropping a ScheduledBatch cancels its pending writes"]
pub struct ScheduledBatch {
    id: BatchId,
    cancel: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<WriteOutcome>)>,
}

impl ScheduledBatch {
    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancel writes that have not started. Writes already in flight finish.
    pub fn cancel(&self) {
        if !self.cancel.is_cancelled() {
            info!(batch_id = %self.id, "cancelling scheduled writes");
            self.cancel.cancel();
        }
    }

    /// Token that cancels this batch; lets a caller cancel after handing the batch to `join`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for every write to finish or be cancelled.
    pub async fn join(mut self) -> BatchReport {
        let tasks = std::mem::take(&mut self.tasks);
        let mut outcomes = Vec::with_capacity(tasks.len());

        for (index, (kind, task)) in tasks.into_iter().enumerate() {
            let outcome = match task.await {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(batch_id = %self.id, index, error = %err, "write task aborted");
                    WriteOutcome {
                        index,
                        kind,
                        initiated_after: None,
                        status: WriteStatus::Failed(ChangewatchError::write(format!("write task aborted: {err}"))),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let report = BatchReport {
            batch_id: self.id,
            outcomes,
        };
        debug!(
            batch_id = %report.batch_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            cancelled = report.cancelled(),
            "batch finished"
        );
        report
    }
}

impl Drop for ScheduledBatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Issues timed writes against one collection.
pub struct WriteScheduler<S: ?Sized> {
    store: Arc<S>,
    namespace: Namespace,
}

impl<S: ?Sized> Clone for WriteScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            namespace: self.namespace.clone(),
        }
    }
}

impl<S: ?Sized> std::fmt::Debug for WriteScheduler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteScheduler")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl<S> WriteScheduler<S>
where
    S: DocumentStore + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, namespace: Namespace) -> Self {
        Self { store, namespace }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Start a batch. Must be called from within a tokio runtime.
    ///
    /// A failed write is logged and recorded in the report; it never stops
    /// the writes after it.
    #[instrument(
        skip(self, writes),
        fields(namespace = %self.namespace, writes = writes.len(), delay_ms = delay.as_millis() as u64)
    )]
    pub fn schedule(&self, writes: Vec<WriteSpec>, delay: Duration) -> ScheduledBatch {
        let id = BatchId::new();
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let tasks = writes
            .into_iter()
            .enumerate()
            .map(|(index, write)| {
                let kind = write.kind();
                let step = u32::try_from(index).unwrap_or(u32::MAX);
                let due = start + delay.saturating_mul(step);
                let task = tokio::spawn(run_write(
                    Arc::clone(&self.store),
                    self.namespace.clone(),
                    cancel.clone(),
                    WriteSlot {
                        batch_id: id,
                        index,
                        start,
                        due,
                    },
                    write,
                ));
                (kind, task)
            })
            .collect::<Vec<_>>();

        info!(batch_id = %id, "batch scheduled");
        ScheduledBatch { id, cancel, tasks }
    }
}

struct WriteSlot {
    batch_id: BatchId,
    index: usize,
    start: Instant,
    due: Instant,
}

async fn run_write<S>(
    store: Arc<S>,
    namespace: Namespace,
    cancel: CancellationToken,
    slot: WriteSlot,
    write: WriteSpec,
) -> WriteOutcome
where
    S: DocumentStore + ?Sized,
{
    let WriteSlot {
        batch_id,
        index,
        start,
        due,
    } = slot;
    let kind = write.kind();

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return WriteOutcome {
                index,
                kind,
                initiated_after: None,
                status: WriteStatus::Cancelled,
            };
        }
        _ = sleep_until(due) => {}
    }

    let initiated_after = start.elapsed();
    debug!(%batch_id, index, kind, ?initiated_after, "write started");

    let result = match &write {
        WriteSpec::Insert { document } => store.insert_one(&namespace, document.clone()).await,
        WriteSpec::Update(update) => store.update_one(&namespace, update).await,
    };

    let status = match result {
        Ok(result) => WriteStatus::Completed(result),
        Err(err) => {
            warn!(%batch_id, index, kind, error = %err, "scheduled write failed");
            WriteStatus::Failed(err)
        }
    };

    WriteOutcome {
        index,
        kind,
        initiated_after: Some(initiated_after),
        status,
    }
}
