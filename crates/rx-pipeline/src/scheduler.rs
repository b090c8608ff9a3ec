//! Bounded worker pool over a FIFO queue of jobs.
//!
//! `max_concurrent` workers each pull the next job id from a shared queue
//! and drive it with [`run_job`] to a terminal state before pulling again,
//! so one new job starts per completion. A job failure never stops a worker;
//! only [`CancellationController::cancel_all`] halts admission, and only for
//! batches that were already running when it was called.
//!
//! [`CancellationController::cancel_all`]: crate::CancellationController::cancel_all

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rx_core::config::clamp_concurrency;
use rx_core::{JobId, JobStatus};
use tokio::task::JoinSet;

use crate::executor::{run_job, JobPipeline, StageExecutor};

/// Outcome counts of one scheduler run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Jobs that were no longer pending when their turn came.
    pub skipped: usize,
    /// Jobs left in the queue by a cancel-all.
    pub not_admitted: usize,
    /// Highest number of jobs observed in flight at once.
    pub max_in_flight: usize,
}

impl RunSummary {
    fn record(&mut self, status: Option<JobStatus>) {
        match status {
            Some(JobStatus::Completed) => self.completed += 1,
            Some(JobStatus::Cancelled) => self.cancelled += 1,
            Some(_) => self.failed += 1,
            None => self.skipped += 1,
        }
    }

    pub fn settled(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }
}

/// Runs a queue of jobs under a concurrency limit.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    max_concurrent: usize,
}

impl Scheduler {
    /// `max_concurrent` is clamped into `[1, 10]`.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: clamp_concurrency(max_concurrent),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Drive every job in `queue` (FIFO) and return once the queue is empty
    /// and no job is in flight.
    pub async fn run<E: StageExecutor>(
        &self,
        pipeline: Arc<JobPipeline<E>>,
        queue: Vec<JobId>,
    ) -> RunSummary {
        let stop = pipeline.cancel.begin_batch();

        let queued = queue.len();
        let workers = self.max_concurrent.min(queued);
        let queue = Arc::new(Mutex::new(VecDeque::from(queue)));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let summary = Arc::new(Mutex::new(RunSummary::default()));

        tracing::info!(
            tool = %pipeline.tool(),
            jobs = queued,
            max_concurrent = self.max_concurrent,
            "batch started"
        );

        let mut set = JoinSet::new();
        for worker in 0..workers {
            let pipeline = pipeline.clone();
            let queue = queue.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            let summary = summary.clone();
            let stop = stop.clone();

            set.spawn(async move {
                loop {
                    if stop.is_cancelled() {
                        break;
                    }
                    let Some(job_id) = queue.lock().pop_front() else {
                        break;
                    };

                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tracing::debug!(worker, job_id = %job_id, in_flight = now, "job admitted");

                    let status = run_job(&pipeline, job_id).await;

                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    summary.lock().record(status);
                }
            });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::error!(tool = %pipeline.tool(), "worker task failed: {e}");
            }
        }

        let mut summary = std::mem::take(&mut *summary.lock());
        summary.not_admitted = queue.lock().len();
        summary.max_in_flight = peak.load(Ordering::SeqCst);

        tracing::info!(
            tool = %pipeline.tool(),
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            not_admitted = summary.not_admitted,
            "batch finished"
        );
        summary
    }
}
