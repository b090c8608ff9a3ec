//! Stage driver: runs one job through its tool's stages.
//!
//! A tool implements [`StageExecutor`] (scan, then processing). [`run_job`]
//! owns everything around it: minting the run, reporting stage changes,
//! deciding between keep and discard when processing returns, creating and
//! persisting the version, and converting errors into job state. Errors never
//! escape to the scheduler.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rx_core::events::{EventBus, EventPayload};
use rx_core::{Error, FailureKind, JobId, JobStatus, Result, RunId, ToolKind};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::cancel::CancellationController;
use crate::job::{JobPatch, JobRecord, JobStore, SourceRef};
use crate::progress::{ProgressSender, ProgressTracker};
use crate::version::{NewVersion, UsageMetrics, VersionOutcome, VersionStore};

/// One step of a tool's run as shown on the job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageSpec {
    pub name: &'static str,
    /// Status the job shows while in this stage.
    pub status: JobStatus,
    /// Share of the overall progress bar.
    pub weight: f32,
}

impl StageSpec {
    pub const fn new(name: &'static str, status: JobStatus, weight: f32) -> Self {
        Self {
            name,
            status,
            weight,
        }
    }
}

/// The stage used by every tool to read its source.
pub const SCAN_STAGE: StageSpec = StageSpec::new("scan", JobStatus::Scanning, 1.0);

/// What a successful processing stage hands back.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Tool output stored as the version payload.
    pub payload: serde_json::Value,
    /// Label for the version name (e.g. the model used).
    pub name_hint: Option<String>,
    pub usage: Option<UsageMetrics>,
    /// Set when the output hit a limit; the version is kept as truncated and
    /// the job ends in error.
    pub truncated: Option<String>,
}

impl ProcessOutput {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            payload,
            ..Self::default()
        }
    }
}

/// A tool's scan and processing logic.
///
/// The first entry of [`stages`](Self::stages) is the scan stage; the driver
/// enters it before [`scan`](Self::scan) and enters the second stage before
/// [`process`](Self::process). Executors with further stages enter them via
/// [`RunContext::enter_stage`].
#[async_trait]
pub trait StageExecutor: Send + Sync + 'static {
    /// What scanning learns about a source.
    type Metadata: Send + Sync;

    fn tool(&self) -> ToolKind;

    fn stages(&self) -> Vec<StageSpec>;

    /// Parameters a new job starts with.
    fn default_params(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    async fn scan(&self, ctx: &RunContext) -> Result<Self::Metadata>;

    async fn process(&self, ctx: &RunContext, metadata: Self::Metadata) -> Result<ProcessOutput>;
}

/// Everything a run needs: the tool plus the shared stores.
pub struct JobPipeline<E: StageExecutor> {
    pub executor: Arc<E>,
    pub jobs: Arc<JobStore>,
    pub versions: Arc<VersionStore>,
    pub cancel: Arc<CancellationController>,
    pub events: Arc<EventBus>,
    /// Where reusable intermediates (proxies) are written.
    pub cache_dir: PathBuf,
}

impl<E: StageExecutor> JobPipeline<E> {
    pub fn tool(&self) -> ToolKind {
        self.executor.tool()
    }
}

/// Per-run view handed to executor stages.
pub struct RunContext {
    job_id: JobId,
    run_id: RunId,
    source: SourceRef,
    params: serde_json::Value,
    token: CancellationToken,
    cache_dir: PathBuf,
    cached: BTreeMap<String, PathBuf>,
    stages: Vec<StageSpec>,
    tracker: ProgressTracker,
    jobs: Arc<JobStore>,
    versions: Arc<VersionStore>,
    partials: Mutex<Vec<PathBuf>>,
}

impl RunContext {
    #[allow(clippy::too_many_arguments)]
    fn new(
        job: &JobRecord,
        run_id: RunId,
        token: CancellationToken,
        stages: Vec<StageSpec>,
        jobs: Arc<JobStore>,
        versions: Arc<VersionStore>,
        cache_dir: PathBuf,
        params: serde_json::Value,
    ) -> Self {
        let cached = versions.cached_artifacts(job.id);
        let job_id = job.id;
        let sink = jobs.clone();
        let sender = ProgressSender::new(move |pct, stage| {
            if sink.update_if_active(job_id, run_id, JobPatch::progress(pct)) {
                tracing::debug!(job_id = %job_id, stage, "progress {pct:.1}%");
            }
        });
        let weights: Vec<(&'static str, f32)> = stages.iter().map(|s| (s.name, s.weight)).collect();

        Self {
            job_id,
            run_id,
            source: job.source.clone(),
            params,
            token,
            cache_dir,
            cached,
            tracker: ProgressTracker::new(&weights, sender),
            stages,
            jobs,
            versions,
            partials: Mutex::new(Vec::new()),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn source(&self) -> &SourceRef {
        &self.source
    }

    pub fn params(&self) -> &serde_json::Value {
        &self.params
    }

    /// Deserialize the run's parameters.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.params.clone())
            .map_err(|e| Error::Validation(format!("invalid parameters: {e}")))
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fail with [`Error::Cancelled`] once the run has been signalled.
    /// Call before each sub-unit.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.token.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// A previously recorded intermediate that still exists.
    pub fn cached_artifact(&self, key: &str) -> Option<&Path> {
        self.cached.get(key).map(PathBuf::as_path)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Move the job to stage `index` (0-based) of [`StageExecutor::stages`].
    pub fn enter_stage(&self, index: usize) {
        let Some(stage) = self.stages.get(index) else {
            return;
        };
        let patch = JobPatch::stage(index as u32 + 1, stage.name, stage.status);
        if self.jobs.update_if_active(self.job_id, self.run_id, patch) {
            tracing::debug!(job_id = %self.job_id, run_id = %self.run_id, stage = stage.name, "entering stage");
        }
        self.tracker.enter(index);
    }

    /// Report `fraction` (0 to 1) of the current stage.
    pub fn report(&self, fraction: f64) {
        self.tracker.report(fraction);
    }

    /// Track a file this run is writing; it is deleted unless the run
    /// completes.
    pub fn register_partial(&self, path: impl Into<PathBuf>) {
        self.partials.lock().push(path.into());
    }

    /// Stop tracking `path`: it is complete and survives a later cancel.
    pub fn keep_partial(&self, path: &Path) {
        self.partials.lock().retain(|p| p != path);
    }

    /// Offer a finished intermediate to later runs under `key`.
    ///
    /// Recorded at once and dropped from the partials, so the file outlives
    /// this run even if a later stage fails or is cancelled.
    pub fn record_artifact(&self, key: impl Into<String>, path: &Path) {
        self.keep_partial(path);
        let key = key.into();
        tracing::debug!(job_id = %self.job_id, key = %key, path = %path.display(), "artifact recorded");
        self.versions
            .record_artifacts(self.job_id, BTreeMap::from([(key, path.to_path_buf())]));
    }

    /// Delete every tracked partial file. Returns how many were removed.
    pub fn remove_partials(&self) -> usize {
        let paths = std::mem::take(&mut *self.partials.lock());
        let mut removed = 0;
        for path in paths {
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(job_id = %self.job_id, path = %path.display(), "failed to remove partial output: {e}");
                }
            }
        }
        removed
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("job_id", &self.job_id)
            .field("run_id", &self.run_id)
            .field("source", &self.source.path)
            .finish_non_exhaustive()
    }
}

/// Shallow merge of `overrides` on top of `defaults`.
pub fn merge_params(defaults: serde_json::Value, overrides: &serde_json::Value) -> serde_json::Value {
    match (defaults, overrides) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(extra)) => {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
            serde_json::Value::Object(base)
        }
        (defaults, serde_json::Value::Null) => defaults,
        (_, overrides) => overrides.clone(),
    }
}

/// Run one pending job to a terminal state.
///
/// Returns the terminal status, or `None` if the job was not pending (e.g.
/// cancelled while queued, removed, or already claimed).
pub async fn run_job<E: StageExecutor>(pipeline: &JobPipeline<E>, job_id: JobId) -> Option<JobStatus> {
    let job = pipeline.jobs.get(job_id)?;
    if job.status != JobStatus::Pending || job.is_active() {
        return None;
    }

    let stages = pipeline.executor.stages();
    // Claim the job before touching the cancellation registry; a losing
    // claim must leave the winner's token alone.
    let run_id = RunId::new();
    if let Err(e) = pipeline.jobs.begin_run(job_id, run_id, stages.len() as u32) {
        tracing::debug!(job_id = %job_id, "not starting run: {e}");
        return None;
    }
    let handle = pipeline.cancel.register_run(job_id, run_id);

    let params = merge_params(pipeline.executor.default_params(), &job.params);
    let ctx = RunContext::new(
        &job,
        handle.run_id,
        handle.token.clone(),
        stages,
        pipeline.jobs.clone(),
        pipeline.versions.clone(),
        pipeline.cache_dir.clone(),
        params,
    );

    tracing::info!(
        tool = %pipeline.tool(),
        job_id = %job_id,
        run_id = %handle.run_id,
        path = %job.source.path.display(),
        "run started"
    );

    let result = drive(pipeline.executor.as_ref(), &ctx).await;
    let status = settle(pipeline, &ctx, result).await;

    pipeline.cancel.finish_run(job_id, handle.run_id);
    status
}

async fn drive<E: StageExecutor>(executor: &E, ctx: &RunContext) -> Result<ProcessOutput> {
    ctx.check_cancelled()?;
    ctx.enter_stage(0);
    let metadata = executor.scan(ctx).await.map_err(|e| match e {
        Error::Cancelled | Error::Scan(_) => e,
        other => Error::scan(other.to_string()),
    })?;
    ctx.report(1.0);

    ctx.check_cancelled()?;
    if ctx.stage_count() > 1 {
        ctx.enter_stage(1);
    }
    executor.process(ctx, metadata).await
}

async fn settle<E: StageExecutor>(
    pipeline: &JobPipeline<E>,
    ctx: &RunContext,
    result: Result<ProcessOutput>,
) -> Option<JobStatus> {
    let tool = pipeline.tool();
    let (job_id, run_id) = (ctx.job_id, ctx.run_id);

    // A signal that arrived while processing wins over its result.
    if ctx.is_cancelled() || result.as_ref().is_err_and(Error::is_cancelled) {
        let removed = ctx.remove_partials();
        pipeline
            .jobs
            .update_if_active(job_id, run_id, JobPatch::cancelled());
        tracing::info!(tool = %tool, job_id = %job_id, run_id = %run_id, removed, "run cancelled");
        return Some(JobStatus::Cancelled);
    }

    let output = match result {
        Ok(output) => output,
        Err(e) => {
            ctx.remove_partials();
            let kind = e.failure_kind().unwrap_or(FailureKind::Processing);
            tracing::error!(tool = %tool, job_id = %job_id, run_id = %run_id, kind = %kind, "run failed: {e}");
            pipeline
                .jobs
                .update_if_active(job_id, run_id, JobPatch::failed(kind, e.to_string()));
            return Some(JobStatus::Error);
        }
    };

    let outcome = if output.truncated.is_some() {
        VersionOutcome::Truncated
    } else {
        VersionOutcome::Complete
    };
    let version = pipeline.versions.create_version(
        job_id,
        NewVersion {
            run_id: Some(run_id),
            config_snapshot: ctx.params.clone(),
            payload: output.payload,
            name_hint: output.name_hint,
            usage: output.usage,
            outcome,
        },
    );
    let version = match version {
        Ok(v) => v,
        Err(e) => {
            ctx.remove_partials();
            tracing::error!(tool = %tool, job_id = %job_id, "could not record result: {e}");
            pipeline.jobs.update_if_active(
                job_id,
                run_id,
                JobPatch::failed(FailureKind::Processing, e.to_string()),
            );
            return Some(JobStatus::Error);
        }
    };
    // Outputs are now owned by the version.
    ctx.partials.lock().clear();

    pipeline.versions.persist(job_id).await;

    match output.truncated {
        Some(reason) => {
            tracing::warn!(tool = %tool, job_id = %job_id, version = %version.name, "result truncated: {reason}");
            pipeline.jobs.update_if_active(
                job_id,
                run_id,
                JobPatch::failed(FailureKind::Truncated, reason),
            );
            Some(JobStatus::Error)
        }
        None => {
            if pipeline
                .jobs
                .update_if_active(job_id, run_id, JobPatch::completed())
            {
                pipeline.events.broadcast(
                    tool,
                    EventPayload::JobCompleted {
                        job_id,
                        version_id: version.id,
                    },
                );
            }
            tracing::info!(tool = %tool, job_id = %job_id, run_id = %run_id, version = %version.name, "run completed");
            Some(JobStatus::Completed)
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A scriptable executor shared by the pipeline's unit tests.

    use super::*;
    use crate::sidecar::{MemorySidecarStore, SidecarStore};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum Script {
        Succeed,
        FailScan,
        FailProcess,
        Truncate,
        /// Write a partial file, report 40%, then wait for cancellation.
        BlockUntilCancelled,
        /// Sleep, then succeed; used for concurrency checks.
        Sleep(u64),
    }

    pub struct ScriptedExecutor {
        pub script: Mutex<Script>,
        pub running: AtomicUsize,
        pub max_running: AtomicUsize,
        pub started: Mutex<Vec<JobId>>,
        pub partial_dir: PathBuf,
    }

    impl ScriptedExecutor {
        pub fn new(script: Script, partial_dir: &Path) -> Self {
            Self {
                script: Mutex::new(script),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                started: Mutex::new(Vec::new()),
                partial_dir: partial_dir.to_path_buf(),
            }
        }

        pub fn set_script(&self, script: Script) {
            *self.script.lock() = script;
        }
    }

    #[async_trait]
    impl StageExecutor for ScriptedExecutor {
        type Metadata = ();

        fn tool(&self) -> ToolKind {
            ToolKind::Translation
        }

        fn stages(&self) -> Vec<StageSpec> {
            vec![
                SCAN_STAGE,
                StageSpec::new("translate", JobStatus::Translating, 9.0),
            ]
        }

        fn default_params(&self) -> serde_json::Value {
            serde_json::json!({"batch_count": 1})
        }

        async fn scan(&self, ctx: &RunContext) -> Result<()> {
            self.started.lock().push(ctx.job_id());
            if *self.script.lock() == Script::FailScan {
                return Err(Error::scan("not a subtitle file"));
            }
            Ok(())
        }

        async fn process(&self, ctx: &RunContext, _metadata: ()) -> Result<ProcessOutput> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            let script = *self.script.lock();
            let result = match script {
                Script::Succeed | Script::FailScan => {
                    Ok(ProcessOutput::new(serde_json::json!({"text": "hello"})))
                }
                Script::FailProcess => Err(Error::processing("translate", "service unavailable")),
                Script::Truncate => Ok(ProcessOutput {
                    truncated: Some("3 of 5 lines returned".into()),
                    ..ProcessOutput::new(serde_json::json!({"text": "hel"}))
                }),
                Script::BlockUntilCancelled => {
                    let partial = self.partial_dir.join(format!("{}.part", ctx.job_id()));
                    ctx.register_partial(&partial);
                    std::fs::write(&partial, b"half")?;
                    ctx.report(1.0 / 3.0);
                    ctx.token().cancelled().await;
                    Err(Error::Cancelled)
                }
                Script::Sleep(ms) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                            Ok(ProcessOutput::new(serde_json::json!({"slept": ms})))
                        }
                        _ = ctx.token().cancelled() => Err(Error::Cancelled),
                    }
                }
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    pub async fn pipeline<E: StageExecutor>(executor: E) -> Arc<JobPipeline<E>> {
        pipeline_in(executor, &std::env::temp_dir()).await
    }

    pub async fn pipeline_in<E: StageExecutor>(executor: E, cache_dir: &Path) -> Arc<JobPipeline<E>> {
        let events = Arc::new(EventBus::new(256));
        let sidecar: Arc<dyn SidecarStore> = Arc::new(MemorySidecarStore::new());
        let tool = executor.tool();
        Arc::new(JobPipeline {
            executor: Arc::new(executor),
            jobs: Arc::new(JobStore::new(tool, events.clone())),
            versions: Arc::new(VersionStore::new(tool, sidecar, events.clone())),
            cancel: Arc::new(CancellationController::new()),
            events,
            cache_dir: cache_dir.to_path_buf(),
        })
    }

    pub async fn add_job<E: StageExecutor>(pipeline: &JobPipeline<E>, name: &str) -> JobId {
        add_source(pipeline, Path::new("/media").join(name), serde_json::Value::Null).await
    }

    pub async fn add_source<E: StageExecutor>(
        pipeline: &JobPipeline<E>,
        path: impl Into<PathBuf>,
        params: serde_json::Value,
    ) -> JobId {
        let source = SourceRef::new(path);
        let job = pipeline.jobs.add(source.clone(), params).unwrap();
        pipeline.versions.load(job.id, &source.path).await;
        job.id
    }
}
