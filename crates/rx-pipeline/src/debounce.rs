//! Coalescing of version content edits into sidecar writes.
//!
//! Each edit bumps the job's generation and arms a timer. When a timer fires
//! and its generation is still the latest, the job's history is persisted
//! once. Between writes the in-memory version is authoritative.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rx_core::JobId;

use crate::version::VersionStore;

/// Delays and merges sidecar writes triggered by content edits.
pub struct EditDebouncer {
    versions: Arc<VersionStore>,
    delay: Duration,
    generations: Arc<Mutex<HashMap<JobId, u64>>>,
}

impl EditDebouncer {
    pub fn new(versions: Arc<VersionStore>, delay: Duration) -> Self {
        Self {
            versions,
            delay,
            generations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Record an edit of `job_id`; its history is written once no further
    /// edit arrives for the configured delay.
    pub fn touch(&self, job_id: JobId) {
        let generation = {
            let mut generations = self.generations.lock();
            let g = generations.entry(job_id).or_insert(0);
            *g += 1;
            *g
        };

        let versions = self.versions.clone();
        let generations = self.generations.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut pending = generations.lock();
                if pending.get(&job_id) != Some(&generation) {
                    return;
                }
                pending.remove(&job_id);
            }
            tracing::debug!(job_id = %job_id, "writing debounced edit");
            versions.persist(job_id).await;
        });
    }

    /// Whether an edit of `job_id` is waiting to be written.
    pub fn is_pending(&self, job_id: JobId) -> bool {
        self.generations.lock().contains_key(&job_id)
    }

    /// Write a pending edit of `job_id` now. Returns whether anything was
    /// pending.
    pub async fn flush(&self, job_id: JobId) -> bool {
        if self.generations.lock().remove(&job_id).is_none() {
            return false;
        }
        self.versions.persist(job_id).await;
        true
    }

    /// Write every pending edit now.
    pub async fn flush_all(&self) -> usize {
        let pending: Vec<JobId> = self.generations.lock().drain().map(|(id, _)| id).collect();
        for job_id in &pending {
            self.versions.persist(*job_id).await;
        }
        pending.len()
    }

    /// Drop a pending edit without writing it.
    pub fn discard(&self, job_id: JobId) {
        self.generations.lock().remove(&job_id);
    }
}

impl std::fmt::Debug for EditDebouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditDebouncer")
            .field("delay", &self.delay)
            .field("pending", &self.generations.lock().len())
            .finish_non_exhaustive()
    }
}
