//! Job records and the per-tool job store.
//!
//! [`JobStore`] is a plain state container. Every mutation made on behalf of
//! a run goes through [`JobStore::update_if_active`], which drops patches
//! from superseded runs, and every change is announced on the [`EventBus`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rx_core::events::{EventBus, EventPayload};
use rx_core::{Error, FailureKind, JobId, JobStatus, Result, RunId, ToolKind};
use serde::{Deserialize, Serialize};

/// The file a job operates on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: Option<u64>,
}

impl SourceRef {
    /// Describe `path`, reading its size if the file is accessible.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let size_bytes = std::fs::metadata(&path).ok().map(|m| m.len());
        Self {
            path,
            file_name,
            size_bytes,
        }
    }

    /// File name without its final extension.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "media".into())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Why a job ended in [`JobStatus::Error`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl JobFailure {
    /// Whether a retry with a larger batch count may succeed.
    pub fn is_truncated(&self) -> bool {
        self.kind == FailureKind::Truncated
    }
}

/// One source file within one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub tool: ToolKind,
    pub source: SourceRef,
    pub status: JobStatus,
    /// Overall completion, 0 to 100. Never decreases within a run.
    pub progress: f32,
    /// 1-based index of the stage being executed; 0 before the first.
    pub current_stage: u32,
    pub total_stages: u32,
    /// Name of the current stage.
    pub stage_label: Option<String>,
    pub error: Option<JobFailure>,
    /// The run allowed to mutate this job, if one is in flight.
    pub active_run_id: Option<RunId>,
    /// Parameters used for the next run.
    pub params: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// Whether a run currently owns the job.
    pub fn is_active(&self) -> bool {
        self.active_run_id.is_some()
    }
}

/// A set of field changes applied atomically to a job.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<f32>,
    pub stage: Option<(u32, String)>,
    pub error: Option<Option<JobFailure>>,
    /// Release the job from its run (terminal patches).
    pub clear_run: bool,
}

impl JobPatch {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(progress: f32) -> Self {
        Self {
            progress: Some(progress),
            ..Self::default()
        }
    }

    /// Enter stage `index` (1-based) with its status.
    pub fn stage(index: u32, label: impl Into<String>, status: JobStatus) -> Self {
        Self {
            status: Some(status),
            stage: Some((index, label.into())),
            ..Self::default()
        }
    }

    /// Terminal success.
    pub fn completed() -> Self {
        Self {
            status: Some(JobStatus::Completed),
            progress: Some(100.0),
            error: Some(None),
            clear_run: true,
            ..Self::default()
        }
    }

    /// Terminal failure.
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Error),
            error: Some(Some(JobFailure {
                kind,
                message: message.into(),
            })),
            clear_run: true,
            ..Self::default()
        }
    }

    /// Terminal cancellation.
    pub fn cancelled() -> Self {
        Self {
            status: Some(JobStatus::Cancelled),
            clear_run: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    order: Vec<JobId>,
    jobs: HashMap<JobId, JobRecord>,
}

/// All jobs of one tool, in insertion order.
#[derive(Debug)]
pub struct JobStore {
    tool: ToolKind,
    events: Arc<EventBus>,
    inner: RwLock<Inner>,
}

impl JobStore {
    pub fn new(tool: ToolKind, events: Arc<EventBus>) -> Self {
        Self {
            tool,
            events,
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn tool(&self) -> ToolKind {
        self.tool
    }

    /// Register a new pending job. A path already in the store is a
    /// [`Error::Conflict`]: versions are persisted per path, so two jobs on
    /// one file would overwrite each other's history.
    pub fn add(&self, source: SourceRef, params: serde_json::Value) -> Result<JobRecord> {
        let job = JobRecord {
            id: JobId::new(),
            tool: self.tool,
            source,
            status: JobStatus::Pending,
            progress: 0.0,
            current_stage: 0,
            total_stages: 0,
            stage_label: None,
            error: None,
            active_run_id: None,
            params,
            created_at: Utc::now(),
        };

        {
            let mut inner = self.inner.write();
            if let Some(existing) = inner.jobs.values().find(|j| j.source.path == job.source.path) {
                return Err(Error::Conflict(format!(
                    "{} is already job {}",
                    job.source.path.display(),
                    existing.id
                )));
            }
            inner.order.push(job.id);
            inner.jobs.insert(job.id, job.clone());
        }

        tracing::info!(tool = %self.tool, job_id = %job.id, path = %job.source.path.display(), "job added");
        self.events.broadcast(
            self.tool,
            EventPayload::JobAdded {
                job_id: job.id,
                path: job.source.path.to_string_lossy().into_owned(),
            },
        );
        Ok(job)
    }

    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.inner.read().jobs.get(&id).cloned()
    }

    /// Snapshot of every job in insertion order.
    pub fn list(&self) -> Vec<JobRecord> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id).cloned())
            .collect()
    }

    /// Ids of jobs in `status`, in insertion order.
    pub fn ids_with_status(&self, status: JobStatus) -> Vec<JobId> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter(|id| inner.jobs.get(*id).is_some_and(|j| j.status == status))
            .copied()
            .collect()
    }

    /// Number of jobs currently owned by a run.
    pub fn active_count(&self) -> usize {
        self.inner.read().jobs.values().filter(|j| j.is_active()).count()
    }

    /// Bind `run_id` to a pending job and reset its per-run fields.
    ///
    /// Fails with [`Error::Conflict`] unless the job is pending and not
    /// owned by another run.
    pub fn begin_run(&self, id: JobId, run_id: RunId, total_stages: u32) -> Result<()> {
        {
            let mut inner = self.inner.write();
            let job = inner
                .jobs
                .get_mut(&id)
                .ok_or_else(|| Error::not_found("job", id))?;
            if job.status != JobStatus::Pending || job.active_run_id.is_some() {
                return Err(Error::Conflict(format!(
                    "job {id} is {} and cannot start a run",
                    job.status
                )));
            }
            job.active_run_id = Some(run_id);
            job.progress = 0.0;
            job.current_stage = 0;
            job.total_stages = total_stages;
            job.stage_label = None;
            job.error = None;
        }

        self.events
            .broadcast(self.tool, EventPayload::JobStarted { job_id: id, run_id });
        Ok(())
    }

    /// Apply `patch` only if `run_id` is still the job's active run.
    ///
    /// Returns `false` (and changes nothing) for a superseded or finished
    /// run, or a removed job.
    pub fn update_if_active(&self, id: JobId, run_id: RunId, patch: JobPatch) -> bool {
        let (status_changed, progress_changed, snapshot) = {
            let mut inner = self.inner.write();
            let Some(job) = inner.jobs.get_mut(&id) else {
                return false;
            };
            if job.active_run_id != Some(run_id) {
                tracing::debug!(job_id = %id, run_id = %run_id, "dropping update from stale run");
                return false;
            }
            apply_patch(job, patch)
        };

        self.announce(&snapshot, status_changed, progress_changed);
        true
    }

    /// Put a settled job back into the queue with new parameters.
    pub fn requeue(&self, id: JobId, params: serde_json::Value) -> Result<()> {
        {
            let mut inner = self.inner.write();
            let job = inner
                .jobs
                .get_mut(&id)
                .ok_or_else(|| Error::not_found("job", id))?;
            if job.is_active() {
                return Err(Error::Conflict(format!("job {id} is still running")));
            }
            job.status = JobStatus::Pending;
            job.progress = 0.0;
            job.current_stage = 0;
            job.stage_label = None;
            job.error = None;
            job.params = params;
        }
        self.events.broadcast(
            self.tool,
            EventPayload::JobStatusChanged {
                job_id: id,
                status: JobStatus::Pending,
            },
        );
        Ok(())
    }

    /// Cancel a job that is still waiting in the queue.
    ///
    /// Returns `false` if the job is not pending or already owned by a run.
    pub fn cancel_queued(&self, id: JobId) -> bool {
        {
            let mut inner = self.inner.write();
            let Some(job) = inner.jobs.get_mut(&id) else {
                return false;
            };
            if job.status != JobStatus::Pending || job.is_active() {
                return false;
            }
            job.status = JobStatus::Cancelled;
        }
        self.events
            .broadcast(self.tool, EventPayload::JobCancelled { job_id: id });
        true
    }

    /// Forcefully release a job from its run, marking it cancelled.
    ///
    /// Used before removing a running job; the run's late callbacks then
    /// fail the [`update_if_active`](Self::update_if_active) check.
    pub fn detach_run(&self, id: JobId) -> Option<RunId> {
        let run_id = {
            let mut inner = self.inner.write();
            let job = inner.jobs.get_mut(&id)?;
            let run_id = job.active_run_id.take()?;
            if !job.status.is_terminal() {
                job.status = JobStatus::Cancelled;
            }
            run_id
        };
        self.events
            .broadcast(self.tool, EventPayload::JobCancelled { job_id: id });
        Some(run_id)
    }

    /// Remove a job that no run owns.
    pub fn remove(&self, id: JobId) -> Result<JobRecord> {
        let job = {
            let mut inner = self.inner.write();
            let job = inner
                .jobs
                .get(&id)
                .ok_or_else(|| Error::not_found("job", id))?;
            if job.is_active() {
                return Err(Error::Conflict(format!(
                    "job {id} is {}; cancel it before removing",
                    job.status
                )));
            }
            inner.order.retain(|j| *j != id);
            inner
                .jobs
                .remove(&id)
                .ok_or_else(|| Error::not_found("job", id))?
        };

        tracing::info!(tool = %self.tool, job_id = %id, "job removed");
        self.events
            .broadcast(self.tool, EventPayload::JobRemoved { job_id: id });
        Ok(job)
    }

    fn announce(&self, job: &JobRecord, status_changed: bool, progress_changed: bool) {
        if status_changed {
            self.events.broadcast(
                self.tool,
                EventPayload::JobStatusChanged {
                    job_id: job.id,
                    status: job.status,
                },
            );
            match (&job.status, &job.error) {
                (JobStatus::Cancelled, _) => self
                    .events
                    .broadcast(self.tool, EventPayload::JobCancelled { job_id: job.id }),
                (JobStatus::Error, Some(failure)) => self.events.broadcast(
                    self.tool,
                    EventPayload::JobFailed {
                        job_id: job.id,
                        kind: failure.kind,
                        error: failure.message.clone(),
                    },
                ),
                _ => {}
            }
        }
        if progress_changed {
            self.events.broadcast(
                self.tool,
                EventPayload::JobProgress {
                    job_id: job.id,
                    progress: job.progress,
                    stage: job.stage_label.clone().unwrap_or_default(),
                },
            );
        }
    }
}

/// Apply a patch, returning which observable fields changed and a snapshot.
fn apply_patch(job: &mut JobRecord, patch: JobPatch) -> (bool, bool, JobRecord) {
    let before_status = job.status;
    let before_progress = job.progress;

    if let Some((index, label)) = patch.stage {
        job.current_stage = index;
        job.stage_label = Some(label);
    }
    if let Some(error) = patch.error {
        job.error = error;
    }
    if let Some(p) = patch.progress {
        job.progress = job.progress.max(p.clamp(0.0, 100.0));
    }
    if let Some(status) = patch.status {
        job.status = status;
    }
    if patch.clear_run {
        job.active_run_id = None;
    }

    (
        job.status != before_status,
        job.progress != before_progress,
        job.clone(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn store() -> JobStore {
        JobStore::new(ToolKind::Translation, Arc::new(EventBus::new(64)))
    }

    #[test]
    fn add_creates_pending_job() {
        let store = store();
        let job = store.add(SourceRef::new("/m/a.srt"), serde_json::json!({})).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.source.file_name, "a.srt");
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn same_path_cannot_be_added_twice() {
        let store = store();
        let first = store.add(SourceRef::new("/m/a.srt"), serde_json::json!({})).unwrap();
        assert_matches!(
            store.add(SourceRef::new("/m/a.srt"), serde_json::json!({"batch_count": 2})),
            Err(Error::Conflict(m)) if m.contains(&first.id.to_string())
        );
        assert_eq!(store.list().len(), 1);

        // Removing the job frees the path.
        store.remove(first.id).unwrap();
        store.add(SourceRef::new("/m/a.srt"), serde_json::json!({})).unwrap();
    }

    #[test]
    fn list_preserves_insertion_order() {
        let store = store();
        let ids: Vec<_> = (0..4)
            .map(|i| store.add(SourceRef::new(format!("/m/{i}.srt")), serde_json::json!({})).unwrap().id)
            .collect();
        let listed: Vec<_> = store.list().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, listed);
    }

    #[test]
    fn stale_run_patch_is_ignored() {
        let store = store();
        let job = store.add(SourceRef::new("/m/a.srt"), serde_json::json!({})).unwrap();
        let current = RunId::new();
        store.begin_run(job.id, current, 2).unwrap();

        let stale = RunId::new();
        assert!(!store.update_if_active(job.id, stale, JobPatch::completed()));
        let after = store.get(job.id).unwrap();
        assert_eq!(after.status, JobStatus::Pending);
        assert_eq!(after.active_run_id, Some(current));

        assert!(store.update_if_active(
            job.id,
            current,
            JobPatch::stage(1, "scan", JobStatus::Scanning)
        ));
        assert_eq!(store.get(job.id).unwrap().status, JobStatus::Scanning);
    }

    #[test]
    fn progress_never_decreases_within_run() {
        let store = store();
        let job = store.add(SourceRef::new("/m/a.srt"), serde_json::json!({})).unwrap();
        let run = RunId::new();
        store.begin_run(job.id, run, 1).unwrap();

        store.update_if_active(job.id, run, JobPatch::progress(40.0));
        store.update_if_active(job.id, run, JobPatch::progress(25.0));
        assert_eq!(store.get(job.id).unwrap().progress, 40.0);
        store.update_if_active(job.id, run, JobPatch::progress(250.0));
        assert_eq!(store.get(job.id).unwrap().progress, 100.0);
    }

    #[test]
    fn terminal_patch_releases_run() {
        let store = store();
        let job = store.add(SourceRef::new("/m/a.srt"), serde_json::json!({})).unwrap();
        let run = RunId::new();
        store.begin_run(job.id, run, 1).unwrap();
        store.update_if_active(job.id, run, JobPatch::failed(FailureKind::Scan, "bad header"));

        let after = store.get(job.id).unwrap();
        assert_eq!(after.status, JobStatus::Error);
        assert!(after.active_run_id.is_none());
        assert_eq!(after.error.unwrap().kind, FailureKind::Scan);

        // A late callback from the finished run does nothing.
        assert!(!store.update_if_active(job.id, run, JobPatch::completed()));
    }

    #[test]
    fn begin_run_requires_pending() {
        let store = store();
        let job = store.add(SourceRef::new("/m/a.srt"), serde_json::json!({})).unwrap();
        store.begin_run(job.id, RunId::new(), 1).unwrap();
        let err = store.begin_run(job.id, RunId::new(), 1).unwrap_err();
        assert_matches!(err, Error::Conflict(_));
    }

    #[test]
    fn remove_active_job_conflicts() {
        let store = store();
        let job = store.add(SourceRef::new("/m/a.srt"), serde_json::json!({})).unwrap();
        store.begin_run(job.id, RunId::new(), 1).unwrap();
        assert_matches!(store.remove(job.id), Err(Error::Conflict(_)));

        assert!(store.detach_run(job.id).is_some());
        assert_eq!(store.get(job.id).unwrap().status, JobStatus::Cancelled);
        store.remove(job.id).unwrap();
        assert!(store.get(job.id).is_none());
    }

    #[test]
    fn remove_unknown_job_is_not_found() {
        assert_matches!(store().remove(JobId::new()), Err(Error::NotFound { .. }));
    }

    #[test]
    fn cancel_queued_only_affects_pending() {
        let store = store();
        let a = store.add(SourceRef::new("/m/a.srt"), serde_json::json!({})).unwrap();
        let b = store.add(SourceRef::new("/m/b.srt"), serde_json::json!({})).unwrap();
        store.begin_run(b.id, RunId::new(), 1).unwrap();

        assert!(store.cancel_queued(a.id));
        assert_eq!(store.get(a.id).unwrap().status, JobStatus::Cancelled);
        assert!(!store.cancel_queued(b.id));
    }

    #[test]
    fn requeue_resets_and_replaces_params() {
        let store = store();
        let job = store.add(SourceRef::new("/m/a.srt"), serde_json::json!({"batch_count": 1})).unwrap();
        let run = RunId::new();
        store.begin_run(job.id, run, 1).unwrap();
        store.update_if_active(job.id, run, JobPatch::failed(FailureKind::Truncated, "cut"));

        store.requeue(job.id, serde_json::json!({"batch_count": 2})).unwrap();
        let after = store.get(job.id).unwrap();
        assert_eq!(after.status, JobStatus::Pending);
        assert!(after.error.is_none());
        assert_eq!(after.params["batch_count"], 2);
    }

    #[test]
    fn failure_broadcasts_job_failed() {
        let events = Arc::new(EventBus::new(64));
        let store = JobStore::new(ToolKind::Ocr, events.clone());
        let mut rx = events.subscribe();
        let job = store.add(SourceRef::new("/m/v.mkv"), serde_json::json!({})).unwrap();
        let run = RunId::new();
        store.begin_run(job.id, run, 1).unwrap();
        store.update_if_active(job.id, run, JobPatch::failed(FailureKind::Processing, "boom"));

        let mut saw_failed = false;
        while let Ok(event) = rx.try_recv() {
            if let EventPayload::JobFailed { error, .. } = event.payload {
                assert_eq!(error, "boom");
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }
}
