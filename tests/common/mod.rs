//! Shared helpers for the pipeline integration tests.
//!
//! [`PacedExecutor`] stands in for a tool whose processing stage sleeps or
//! stalls on demand; [`LimitedTranslator`] is a translation service with an
//! output cap; [`FailingSidecar`] refuses every write.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rx_core::config::Config;
use rx_core::events::EventBus;
use rx_core::{Error, JobId, JobStatus, Result, ToolKind};
use rx_pipeline::subtitles::{to_srt, Cue};
use rx_pipeline::tools::{TranslationRequest, TranslationResponse, Translator};
use rx_pipeline::{
    MemorySidecarStore, ProcessOutput, RunContext, SidecarData, SidecarStore, StageExecutor,
    StageSpec, ToolSession, UsageMetrics, SCAN_STAGE,
};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

pub fn config(max_concurrent: usize, cache_dir: &Path) -> Config {
    let mut config = Config::default();
    config.jobs.max_concurrent = max_concurrent;
    config.cache.dir = cache_dir.to_path_buf();
    config
}

pub fn session<E: StageExecutor>(
    executor: E,
    sidecar: Arc<dyn SidecarStore>,
    config: &Config,
) -> Arc<ToolSession<E>> {
    Arc::new(ToolSession::new(
        executor,
        sidecar,
        Arc::new(EventBus::new(256)),
        config,
    ))
}

pub fn memory_sidecar() -> Arc<dyn SidecarStore> {
    Arc::new(MemorySidecarStore::new())
}

/// Poll `cond` until it holds, failing after five seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

// ---------------------------------------------------------------------------
// PacedExecutor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pace {
    /// Sleep this long, then succeed.
    Sleep(u64),
    /// Write a partial file, report 40% overall, then wait for cancellation.
    StallAtFortyPercent,
}

/// One entry of [`PacedExecutor::log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Start(JobId),
    Finish(JobId),
}

pub struct PacedExecutor {
    pub pace: Mutex<Pace>,
    pub scratch: PathBuf,
    pub running: AtomicUsize,
    pub max_running: AtomicUsize,
    pub started: Mutex<Vec<JobId>>,
    /// Processing starts and finishes in the order they happened.
    pub log: Mutex<Vec<Step>>,
}

impl PacedExecutor {
    pub fn new(pace: Pace, scratch: &Path) -> Self {
        Self {
            pace: Mutex::new(pace),
            scratch: scratch.to_path_buf(),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn steps(&self) -> Vec<Step> {
        self.log.lock().clone()
    }

    pub fn partial_path(&self, job_id: JobId) -> PathBuf {
        self.scratch.join(format!("{job_id}.partial"))
    }
}

#[async_trait]
impl StageExecutor for PacedExecutor {
    type Metadata = ();

    fn tool(&self) -> ToolKind {
        ToolKind::Extraction
    }

    fn stages(&self) -> Vec<StageSpec> {
        vec![
            SCAN_STAGE,
            StageSpec::new("process", JobStatus::Processing, 9.0),
        ]
    }

    async fn scan(&self, ctx: &RunContext) -> Result<()> {
        self.started.lock().push(ctx.job_id());
        Ok(())
    }

    async fn process(&self, ctx: &RunContext, _: ()) -> Result<ProcessOutput> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        self.log.lock().push(Step::Start(ctx.job_id()));

        let pace = *self.pace.lock();
        let result = match pace {
            Pace::Sleep(ms) => tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                    Ok(ProcessOutput::new(serde_json::json!({"file": ctx.source().file_name})))
                }
                _ = ctx.token().cancelled() => Err(Error::Cancelled),
            },
            Pace::StallAtFortyPercent => {
                let partial = self.partial_path(ctx.job_id());
                ctx.register_partial(&partial);
                std::fs::write(&partial, b"half written")?;
                // Scan weighs 1 of 10: (1 + 9 * 1/3) / 10 = 0.4
                ctx.report(1.0 / 3.0);
                ctx.token().cancelled().await;
                Err(Error::Cancelled)
            }
        };

        self.log.lock().push(Step::Finish(ctx.job_id()));
        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ---------------------------------------------------------------------------
// Translation
// ---------------------------------------------------------------------------

/// Translates by upper-casing; answers at most `limit` lines per request.
pub struct LimitedTranslator {
    pub limit: usize,
    pub requests: Mutex<Vec<usize>>,
}

impl LimitedTranslator {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            requests: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Translator for LimitedTranslator {
    async fn translate(
        &self,
        request: &TranslationRequest,
        cancel: &CancellationToken,
    ) -> Result<TranslationResponse> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.requests.lock().push(request.lines.len());
        Ok(TranslationResponse {
            lines: request
                .lines
                .iter()
                .take(self.limit)
                .map(|l| l.to_uppercase())
                .collect(),
            model: Some("test-model".into()),
            usage: Some(UsageMetrics {
                input_tokens: Some(request.lines.len() as u64 * 4),
                output_tokens: Some(request.lines.len().min(self.limit) as u64 * 4),
                ..UsageMetrics::default()
            }),
        })
    }
}

/// Write an SRT file with `count` one-second cues.
pub fn write_srt(dir: &Path, name: &str, count: u64) -> PathBuf {
    let cues: Vec<Cue> = (0..count)
        .map(|i| Cue::new(i * 1_000, i * 1_000 + 800, format!("line number {i}")))
        .collect();
    let path = dir.join(name);
    std::fs::write(&path, to_srt(&cues)).unwrap();
    path
}

// ---------------------------------------------------------------------------
// Sidecars
// ---------------------------------------------------------------------------

/// Loads nothing and fails every write.
#[derive(Default)]
pub struct FailingSidecar {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl SidecarStore for FailingSidecar {
    async fn load(&self, _source: &Path) -> Result<Option<SidecarData>> {
        Ok(None)
    }

    async fn save(&self, source: &Path, _data: &SidecarData) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(Error::persistence(format!(
            "read-only directory: {}",
            source.display()
        )))
    }

    async fn delete(&self, _source: &Path) -> Result<()> {
        Err(Error::persistence("read-only directory"))
    }
}
