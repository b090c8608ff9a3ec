//! # rx-av
//!
//! Audio/video processing, probing, and external tool management for the
//! rsext job pipeline.
//!
//! This crate provides:
//!
//! - **Tool discovery** ([`ToolRegistry`]) -- find and cache paths to ffmpeg
//!   and ffprobe, honouring custom paths from config.
//! - **Command execution** ([`ToolCommand`]) -- async builder that streams
//!   output lines, kills the child when its cancellation token fires, and
//!   supports an optional timeout.
//! - **Probing** ([`probe`]) -- ffprobe JSON into [`MediaMetadata`].
//! - **Workspace management** ([`Workspace`]) -- per-run scratch directories
//!   with move-into-place finalization.
//! - **Backend** ([`MediaBackend`], [`FfmpegBackend`]) -- the per-stage native
//!   processing interface used by the tool executors.

pub mod actions;
pub mod backend;
pub mod command;
pub mod probe;
pub mod progress;
pub mod tools;
pub mod validation;
pub mod workspace;

// ---- Re-exports for convenience ----

pub use actions::{
    AudioTranscodeRequest, CropRegion, ExtractRequest, FrameExtractRequest, MergeRequest,
    MergeTrack, SourceStreamConfig,
};
pub use backend::{FfmpegBackend, MediaBackend, ProgressFn};
pub use command::{ToolCommand, ToolOutput};
pub use probe::{MediaMetadata, StreamInfo};
pub use progress::FfmpegProgress;
pub use tools::{ToolConfig, ToolInfo, ToolRegistry};
pub use validation::{validate_media_path, validate_output_path};
pub use workspace::Workspace;
