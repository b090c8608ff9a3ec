//! One tool's job list as seen by a front end.
//!
//! [`ToolSession`] is the only write surface consumers need: add sources,
//! run, cancel, retry, remove, and manage versions. Reads return snapshots;
//! changes are announced on the [`EventBus`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rx_core::config::{clamp_concurrency, Config};
use rx_core::events::{Event, EventBus};
use rx_core::{Error, JobId, JobStatus, Result, ToolKind, VersionId};
use tokio::sync::broadcast;

use crate::cancel::CancellationController;
use crate::debounce::EditDebouncer;
use crate::executor::{merge_params, JobPipeline, StageExecutor};
use crate::job::{JobRecord, JobStore, SourceRef};
use crate::scheduler::{RunSummary, Scheduler};
use crate::sidecar::SidecarStore;
use crate::version::{Version, VersionStore};

/// Settings read at the start of every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub max_concurrent: usize,
    pub max_batch_count: u32,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent: config.jobs.max_concurrent,
            max_batch_count: config.translation.max_batch_count.max(1),
        }
    }
}

pub struct ToolSession<E: StageExecutor> {
    pipeline: Arc<JobPipeline<E>>,
    debouncer: EditDebouncer,
    settings: RwLock<SessionSettings>,
}

impl<E: StageExecutor> ToolSession<E> {
    pub fn new(
        executor: E,
        sidecar: Arc<dyn SidecarStore>,
        events: Arc<EventBus>,
        config: &Config,
    ) -> Self {
        let tool = executor.tool();
        let versions = Arc::new(VersionStore::new(tool, sidecar, events.clone()));
        let pipeline = Arc::new(JobPipeline {
            executor: Arc::new(executor),
            jobs: Arc::new(JobStore::new(tool, events.clone())),
            versions: versions.clone(),
            cancel: Arc::new(CancellationController::new()),
            events,
            cache_dir: config.cache.dir.clone(),
        });
        let debouncer = EditDebouncer::new(
            versions,
            Duration::from_millis(config.jobs.edit_debounce_ms),
        );

        Self {
            pipeline,
            debouncer,
            settings: RwLock::new(SessionSettings::from(config)),
        }
    }

    pub fn tool(&self) -> ToolKind {
        self.pipeline.tool()
    }

    pub fn pipeline(&self) -> &Arc<JobPipeline<E>> {
        &self.pipeline
    }

    pub fn settings(&self) -> SessionSettings {
        *self.settings.read()
    }

    /// Replace the settings; takes effect at the next run.
    pub fn update_settings(&self, settings: SessionSettings) {
        *self.settings.write() = settings;
    }

    // -- Jobs ---------------------------------------------------------------

    /// Add a pending job for `path` and load its saved versions. Fails with
    /// [`Error::Conflict`] if the path already has a job.
    pub async fn add(&self, path: impl Into<PathBuf>, params: serde_json::Value) -> Result<JobRecord> {
        let source = SourceRef::new(path);
        let job = self.pipeline.jobs.add(source, params)?;
        let loaded = self.pipeline.versions.load(job.id, &job.source.path).await;
        if loaded > 0 {
            tracing::debug!(tool = %self.tool(), job_id = %job.id, loaded, "restored versions");
        }
        Ok(job)
    }

    pub fn job(&self, id: JobId) -> Option<JobRecord> {
        self.pipeline.jobs.get(id)
    }

    /// Jobs in insertion order.
    pub fn jobs(&self) -> Vec<JobRecord> {
        self.pipeline.jobs.list()
    }

    /// Run every pending job.
    pub async fn run_pending(&self) -> RunSummary {
        let queue = self.pipeline.jobs.ids_with_status(JobStatus::Pending);
        self.run(queue).await
    }

    /// Run `queue` in order under the configured concurrency limit.
    pub async fn run(&self, queue: Vec<JobId>) -> RunSummary {
        let max = clamp_concurrency(self.settings().max_concurrent);
        Scheduler::new(max).run(self.pipeline.clone(), queue).await
    }

    /// Cancel one job, running or queued. Returns whether anything changed.
    pub fn cancel_job(&self, id: JobId) -> bool {
        self.pipeline.cancel.cancel_job(id) || self.pipeline.jobs.cancel_queued(id)
    }

    /// Cancel every running job and stop admitting queued ones. Queued jobs
    /// stay pending for the next run.
    pub fn cancel_all(&self) -> usize {
        self.pipeline.cancel.cancel_all()
    }

    /// Rerun a settled job with `overrides` merged into its parameters.
    pub async fn retry(&self, id: JobId, overrides: serde_json::Value) -> Result<JobStatus> {
        let job = self
            .job(id)
            .ok_or_else(|| Error::not_found("job", id))?;
        let params = merge_params(job.params.clone(), &overrides);
        self.pipeline.jobs.requeue(id, params)?;

        tracing::info!(tool = %self.tool(), job_id = %id, "retrying job");
        Scheduler::new(1).run(self.pipeline.clone(), vec![id]).await;
        self.job(id)
            .map(|j| j.status)
            .ok_or_else(|| Error::not_found("job", id))
    }

    /// Retry with twice the batch count of the last run, capped at the
    /// configured maximum.
    pub async fn retry_with_more_batches(&self, id: JobId) -> Result<JobStatus> {
        let current = self.last_batch_count(id)?;
        let max = self.settings().max_batch_count;
        if current >= max {
            return Err(Error::Validation(format!(
                "batch count is already at the maximum of {max}"
            )));
        }
        let next = current.saturating_mul(2).min(max);
        self.retry(id, serde_json::json!({ "batch_count": next })).await
    }

    fn last_batch_count(&self, id: JobId) -> Result<u32> {
        let job = self
            .job(id)
            .ok_or_else(|| Error::not_found("job", id))?;
        let from = |v: &serde_json::Value| v.get("batch_count").and_then(serde_json::Value::as_u64);
        let count = from(&job.params)
            .or_else(|| {
                self.pipeline
                    .versions
                    .versions(id)
                    .last()
                    .and_then(|v| from(&v.config_snapshot))
            })
            .or_else(|| from(&self.pipeline.executor.default_params()))
            .unwrap_or(1);
        Ok((count as u32).max(1))
    }

    /// Remove a job. A job that is still being processed is only removed
    /// with `confirmed`; its run is cancelled and detached first.
    pub async fn remove(&self, id: JobId, confirmed: bool) -> Result<JobRecord> {
        let job = self
            .job(id)
            .ok_or_else(|| Error::not_found("job", id))?;
        if job.is_active() {
            if !confirmed {
                return Err(Error::Conflict(format!(
                    "job {id} is {}; removal needs confirmation",
                    job.status
                )));
            }
            self.pipeline.cancel.abandon(id);
            self.pipeline.jobs.detach_run(id);
        }

        let removed = self.pipeline.jobs.remove(id)?;
        self.debouncer.flush(id).await;
        self.pipeline.versions.forget(id);
        Ok(removed)
    }

    // -- Versions -----------------------------------------------------------

    pub fn versions(&self, id: JobId) -> Vec<Version> {
        self.pipeline.versions.versions(id)
    }

    pub fn active_version(&self, id: JobId) -> Option<Version> {
        self.pipeline.versions.active_version(id)
    }

    pub async fn set_active(&self, id: JobId, version_id: VersionId) -> Result<()> {
        self.pipeline.versions.set_active(id, version_id).await
    }

    /// Replace a version's content. The sidecar is written once edits stop
    /// arriving.
    pub fn edit_version(
        &self,
        id: JobId,
        version_id: VersionId,
        payload: serde_json::Value,
    ) -> Result<Version> {
        let version = self.pipeline.versions.edit_payload(id, version_id, payload)?;
        self.debouncer.touch(id);
        Ok(version)
    }

    pub async fn delete_version(&self, id: JobId, version_id: VersionId) -> Result<Option<VersionId>> {
        self.pipeline.versions.delete_version(id, version_id).await
    }

    /// Delete every version of a job.
    pub async fn clear_versions(&self, id: JobId) -> Result<()> {
        self.debouncer.discard(id);
        self.pipeline.versions.clear(id).await
    }

    /// Write all pending edits now.
    pub async fn flush(&self) -> usize {
        self.debouncer.flush_all().await
    }

    // -- Events -------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.pipeline.events.subscribe()
    }

    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        self.pipeline.events.recent_events(n)
    }
}

impl<E: StageExecutor> std::fmt::Debug for ToolSession<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSession")
            .field("tool", &self.tool())
            .field("settings", &self.settings())
            .field("debouncer", &self.debouncer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test_support::{Script, ScriptedExecutor};
    use crate::sidecar::MemorySidecarStore;
    use crate::version::VersionOutcome;
    use assert_matches::assert_matches;
    use rx_core::events::EventPayload;
    use std::sync::atomic::Ordering;

    fn session(script: Script, dir: &std::path::Path) -> ToolSession<ScriptedExecutor> {
        let mut config = Config::default();
        config.translation.max_batch_count = 4;
        config.cache.dir = dir.to_path_buf();
        ToolSession::new(
            ScriptedExecutor::new(script, dir),
            Arc::new(MemorySidecarStore::new()),
            Arc::new(EventBus::new(64)),
            &config,
        )
    }

    #[tokio::test]
    async fn run_pending_processes_every_job() {
        let dir = tempfile::tempdir().unwrap();
        let s = session(Script::Succeed, dir.path());
        for name in ["a.srt", "b.srt", "c.srt"] {
            s.add(dir.path().join(name), serde_json::Value::Null).await.unwrap();
        }

        let summary = s.run_pending().await;
        assert_eq!(summary.completed, 3);
        assert!(s.jobs().iter().all(|j| j.status == JobStatus::Completed));
        assert!(s
            .recent_events(64)
            .iter()
            .any(|e| matches!(e.payload, EventPayload::JobCompleted { .. })));
    }

    #[tokio::test]
    async fn queued_job_can_be_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let s = session(Script::Succeed, dir.path());
        let job = s.add(dir.path().join("a.srt"), serde_json::Value::Null).await.unwrap();

        assert!(s.cancel_job(job.id));
        assert_eq!(s.job(job.id).unwrap().status, JobStatus::Cancelled);
        assert_eq!(s.run_pending().await.settled(), 0);
        assert!(!s.cancel_job(job.id));
    }

    #[tokio::test]
    async fn retry_doubles_batches_up_to_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        let s = session(Script::Truncate, dir.path());
        let job = s.add(dir.path().join("a.srt"), serde_json::Value::Null).await.unwrap();
        s.run_pending().await;
        let first_run = s.versions(job.id)[0].run_id;

        s.pipeline().executor.set_script(Script::Succeed);
        assert_eq!(s.retry_with_more_batches(job.id).await.unwrap(), JobStatus::Completed);

        let versions = s.versions(job.id);
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].outcome, VersionOutcome::Truncated);
        assert_eq!(versions[1].config_snapshot["batch_count"], 2);
        assert_ne!(versions[1].run_id, first_run);
        assert_eq!(s.active_version(job.id).unwrap().id, versions[1].id);

        assert_eq!(s.retry_with_more_batches(job.id).await.unwrap(), JobStatus::Completed);
        assert_eq!(s.versions(job.id)[2].config_snapshot["batch_count"], 4);
        assert_matches!(
            s.retry_with_more_batches(job.id).await,
            Err(Error::Validation(_))
        );
    }

    #[tokio::test]
    async fn removing_a_running_job_needs_confirmation() {
        let dir = tempfile::tempdir().unwrap();
        let s = Arc::new(session(Script::BlockUntilCancelled, dir.path()));
        let job = s.add(dir.path().join("a.srt"), serde_json::Value::Null).await.unwrap();

        let runner = {
            let s = s.clone();
            tokio::spawn(async move { s.run_pending().await })
        };
        while s.pipeline().executor.running.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        assert_matches!(s.remove(job.id, false).await, Err(Error::Conflict(_)));
        assert!(s.job(job.id).is_some());

        s.remove(job.id, true).await.unwrap();
        assert!(s.job(job.id).is_none());
        runner.await.unwrap();
        assert!(s.versions(job.id).is_empty());
        assert_eq!(s.pipeline().cancel.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn edits_are_written_after_the_quiet_period() {
        let dir = tempfile::tempdir().unwrap();
        let s = session(Script::Succeed, dir.path());
        let job = s.add(dir.path().join("a.srt"), serde_json::Value::Null).await.unwrap();
        s.run_pending().await;
        let vid = s.active_version(job.id).unwrap().id;

        let edited = s
            .edit_version(job.id, vid, serde_json::json!({"text": "fixed"}))
            .unwrap();
        assert!(edited.edited_at.is_some());
        assert!(!edited.persisted);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let v = s.active_version(job.id).unwrap();
        assert_eq!(v.payload["text"], "fixed");
        assert!(v.persisted);
    }

    #[tokio::test]
    async fn deleting_versions_keeps_an_active_one() {
        let dir = tempfile::tempdir().unwrap();
        let s = session(Script::Succeed, dir.path());
        let job = s.add(dir.path().join("a.srt"), serde_json::Value::Null).await.unwrap();
        s.run_pending().await;
        s.retry(job.id, serde_json::Value::Null).await.unwrap();
        let versions = s.versions(job.id);
        s.set_active(job.id, versions[0].id).await.unwrap();

        let active = s.delete_version(job.id, versions[0].id).await.unwrap();
        assert_eq!(active, Some(versions[1].id));
        s.clear_versions(job.id).await.unwrap();
        assert!(s.active_version(job.id).is_none());
    }
}
