//! # rx-pipeline
//!
//! The shared job pipeline behind every rsext tool: job records and their
//! store, per-run cancellation, the bounded worker pool, the stage driver,
//! versioned results with sidecar persistence, and the five tool executors.
//! Translation batches are sized with the token counter in [`tokens`].
//!
//! A [`ToolSession`] bundles all of it for one tool.

pub mod cancel;
pub mod debounce;
pub mod executor;
pub mod job;
pub mod progress;
pub mod scheduler;
pub mod session;
pub mod sidecar;
pub mod subtitles;
pub mod tokens;
pub mod tools;
pub mod version;

pub use cancel::{CancellationController, RunHandle};
pub use debounce::EditDebouncer;
pub use executor::{
    merge_params, run_job, JobPipeline, ProcessOutput, RunContext, StageExecutor, StageSpec,
    SCAN_STAGE,
};
pub use job::{JobFailure, JobPatch, JobRecord, JobStore, SourceRef};
pub use progress::{ProgressSender, ProgressTracker, WeightedUnits};
pub use scheduler::{RunSummary, Scheduler};
pub use session::{SessionSettings, ToolSession};
pub use sidecar::{JsonSidecarStore, MemorySidecarStore, SidecarData, SidecarStore, ToolSection};
pub use subtitles::{Cue, SubtitleFormat};
pub use tools::{
    ExtractionExecutor, MergeExecutor, OcrEngine, OcrExecutor, Transcriber, TranscriptionExecutor,
    TranslationExecutor, Translator,
};
pub use version::{NewVersion, UsageMetrics, Version, VersionOutcome, VersionStore};
