//! Per-run cancellation tokens and the batch stop signal.
//!
//! Every dispatch of a job mints a [`RunId`] and a [`CancellationToken`].
//! Starting a new run for a job supersedes (and cancels) the old one, so
//! only the newest run passes [`CancellationController::is_run_active`].
//!
//! Each scheduler batch holds the batch token current when it started.
//! `cancel_all` fires that token and installs a fresh one, so a batch
//! started afterwards is admitted normally while older ones stay stopped.

use std::collections::HashMap;

use parking_lot::Mutex;
use rx_core::{JobId, RunId};
use tokio_util::sync::CancellationToken;

/// The identity and abort handle of one run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub job_id: JobId,
    pub run_id: RunId,
    pub token: CancellationToken,
}

#[derive(Debug, Default)]
struct Inner {
    runs: HashMap<JobId, (RunId, CancellationToken)>,
    batch: CancellationToken,
}

/// Tracks the active run of every job of one tool.
#[derive(Debug, Default)]
pub struct CancellationController {
    inner: Mutex<Inner>,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint a new run for `job_id`, cancelling any older one.
    pub fn start_run(&self, job_id: JobId) -> RunHandle {
        self.register_run(job_id, RunId::new())
    }

    /// Make `run_id` the active run of `job_id`, cancelling any older one.
    /// Callers claim the job in the store first so a losing claim never
    /// reaches this point.
    pub fn register_run(&self, job_id: JobId, run_id: RunId) -> RunHandle {
        let token = CancellationToken::new();
        let previous = self
            .inner
            .lock()
            .runs
            .insert(job_id, (run_id, token.clone()));
        if let Some((old_run, old_token)) = previous {
            tracing::debug!(job_id = %job_id, run_id = %old_run, "superseding previous run");
            old_token.cancel();
        }
        RunHandle {
            job_id,
            run_id,
            token,
        }
    }

    /// Whether `run_id` is still the active run of `job_id`.
    pub fn is_run_active(&self, job_id: JobId, run_id: RunId) -> bool {
        self.inner
            .lock()
            .runs
            .get(&job_id)
            .is_some_and(|(active, _)| *active == run_id)
    }

    /// Signal the active run of `job_id`. Returns `false` if none exists.
    pub fn cancel_job(&self, job_id: JobId) -> bool {
        let token = self.inner.lock().runs.get(&job_id).map(|(_, t)| t.clone());
        match token {
            Some(token) => {
                tracing::info!(job_id = %job_id, "cancel requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// The stop token for a batch starting now.
    pub fn begin_batch(&self) -> CancellationToken {
        self.inner.lock().batch.clone()
    }

    /// Signal every active run and stop admission in every batch started
    /// before this call. Returns the number of runs signalled.
    pub fn cancel_all(&self) -> usize {
        let (tokens, batch) = {
            let mut inner = self.inner.lock();
            let batch = std::mem::take(&mut inner.batch);
            let tokens: Vec<CancellationToken> =
                inner.runs.values().map(|(_, t)| t.clone()).collect();
            (tokens, batch)
        };
        tracing::info!(runs = tokens.len(), "cancel all requested");
        batch.cancel();
        for token in &tokens {
            token.cancel();
        }
        tokens.len()
    }

    /// Forget the run if it is still the active one.
    pub fn finish_run(&self, job_id: JobId, run_id: RunId) {
        let mut inner = self.inner.lock();
        if inner
            .runs
            .get(&job_id)
            .is_some_and(|(active, _)| *active == run_id)
        {
            inner.runs.remove(&job_id);
        }
    }

    /// Drop the active run of `job_id` regardless of its id, cancelling it.
    pub fn abandon(&self, job_id: JobId) -> Option<RunId> {
        let (run_id, token) = self.inner.lock().runs.remove(&job_id)?;
        token.cancel();
        Some(run_id)
    }

    /// Number of runs in flight.
    pub fn active_count(&self) -> usize {
        self.inner.lock().runs.len()
    }
}
