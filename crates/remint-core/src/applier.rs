//! Bounded concurrent batch applier.
//!
//! A fixed pool of workers pulls batches from a shared queue and sends each
//! to the store with a per-batch deadline. Workers report every completion as
//! a message; the aggregator loop in [`BatchApplier::apply`] is the only code
//! that touches the counters, and it calls the progress sink after each
//! successful batch.
//!
//! Failure is fail-fast: the first failing batch closes the queue so nothing
//! new is scheduled, batches already in flight are awaited, and the error
//! reports exactly what was applied.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ApplyError, ApplyFailure};
use crate::model::Batch;
use crate::progress::{Progress, ProgressSink, notify};
use crate::store::{BulkOptions, BulkWriter};

/// Applier tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplierConfig {
    /// Maximum bulk requests in flight.
    pub concurrency: NonZeroUsize,
    /// Deadline for a single bulk request, enforced client-side and passed
    /// to the store.
    pub batch_timeout: Duration,
}

impl Default for ApplierConfig {
    fn default() -> Self {
        Self {
            concurrency: NonZeroUsize::new(4).unwrap_or(NonZeroUsize::MIN),
            batch_timeout: Duration::from_secs(300),
        }
    }
}

/// What a successful apply wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AppliedCount {
    pub batches: usize,
    pub operations: u64,
}

/// Shared work queue. Once closed it hands out nothing more.
#[derive(Debug)]
struct BatchQueue {
    pending: Mutex<VecDeque<Arc<Batch>>>,
    closed: AtomicBool,
}

impl BatchQueue {
    fn new(batches: Vec<Batch>) -> Self {
        Self {
            pending: Mutex::new(batches.into_iter().map(Arc::new).collect()),
            closed: AtomicBool::new(false),
        }
    }

    fn next(&self) -> Option<Arc<Batch>> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        pending.pop_front()
    }

    fn close(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        self.closed.store(true, Ordering::SeqCst);
        pending.clear();
    }
}

/// Closes the queue if a worker unwinds.
struct CloseOnPanic<'a>(&'a BatchQueue);

impl Drop for CloseOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.close();
        }
    }
}

#[derive(Debug)]
struct Completion {
    seq: usize,
    operations: usize,
    outcome: Result<(), ApplyFailure>,
}

/// Applies batches through a [`BulkWriter`] with bounded parallelism.
pub struct BatchApplier<W: ?Sized> {
    writer: Arc<W>,
    config: ApplierConfig,
}

impl<W: ?Sized> std::fmt::Debug for BatchApplier<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchApplier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<W> BatchApplier<W>
where
    W: BulkWriter + ?Sized + 'static,
{
    pub fn new(writer: Arc<W>, config: ApplierConfig) -> Self {
        Self { writer, config }
    }

    /// Apply every batch, calling `sink` after each one that succeeds.
    ///
    /// `started` is the instant progress elapsed times are measured from.
    pub async fn apply(
        &self,
        batches: Vec<Batch>,
        sink: &dyn ProgressSink,
        started: Instant,
    ) -> Result<AppliedCount, ApplyError> {
        let batches_total = batches.len();
        let total: u64 = batches.iter().map(|b| b.len() as u64).sum();
        if batches.is_empty() {
            return Ok(AppliedCount::default());
        }

        let queue = Arc::new(BatchQueue::new(batches));
        let options = BulkOptions {
            refresh: true,
            timeout: self.config.batch_timeout,
        };
        let workers = self.config.concurrency.get().min(batches_total);
        let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();

        let mut pool = JoinSet::new();
        for worker in 0..workers {
            let queue = Arc::clone(&queue);
            let writer = Arc::clone(&self.writer);
            let tx = tx.clone();
            let deadline = self.config.batch_timeout;
            pool.spawn(async move {
                let _guard = CloseOnPanic(&queue);
                while let Some(batch) = queue.next() {
                    debug!(worker, batch = batch.seq(), operations = batch.len(), "sending batch");
                    let outcome =
                        match tokio::time::timeout(deadline, writer.bulk_apply(&batch, options))
                            .await
                        {
                            Ok(Ok(())) => Ok(()),
                            Ok(Err(err)) => Err(ApplyFailure::Store(err)),
                            Err(_) => Err(ApplyFailure::Timeout(deadline)),
                        };
                    let failed = outcome.is_err();
                    if failed {
                        queue.close();
                    }
                    let completion = Completion {
                        seq: batch.seq(),
                        operations: batch.len(),
                        outcome,
                    };
                    if tx.send(completion).is_err() || failed {
                        break;
                    }
                }
            });
        }
        drop(tx);

        // Single writer of the counters.
        let mut applied = AppliedCount::default();
        let mut first_failure: Option<(usize, ApplyFailure)> = None;
        while let Some(completion) = rx.recv().await {
            match completion.outcome {
                Ok(()) => {
                    applied.batches += 1;
                    applied.operations += completion.operations as u64;
                    info!(
                        batch = completion.seq,
                        operations = completion.operations,
                        applied = applied.operations,
                        total,
                        "batch applied"
                    );
                    notify(
                        sink,
                        &Progress {
                            applied: applied.operations,
                            total,
                            batches_applied: applied.batches,
                            batches_total,
                            elapsed: started.elapsed(),
                        },
                    );
                }
                Err(failure) => {
                    warn!(batch = completion.seq, error = %failure, "batch failed");
                    if first_failure.is_none() {
                        first_failure = Some((completion.seq, failure));
                    }
                }
            }
        }

        while let Some(joined) = pool.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "apply worker aborted");
                if first_failure.is_none() {
                    first_failure = Some((0, ApplyFailure::Worker(err.to_string())));
                }
            }
        }

        match first_failure {
            None => Ok(applied),
            Some((seq, cause)) => Err(ApplyError {
                failed_batch: (seq > 0).then_some(seq),
                batches_applied: applied.batches,
                operations_applied: applied.operations,
                cause,
            }),
        }
    }
}
