//! Media-domain enums for tools, job states, tracks and source file types.
//!
//! All enums serialize in lowercase (via `serde(rename_all = "lowercase")`) and
//! implement `Display` manually for consistent string representation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

// ---------------------------------------------------------------------------
// ToolKind
// ---------------------------------------------------------------------------

/// The five processing tools sharing the job pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Extraction,
    Merge,
    Transcription,
    Ocr,
    Translation,
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Extraction => write!(f, "extraction"),
            Self::Merge => write!(f, "merge"),
            Self::Transcription => write!(f, "transcription"),
            Self::Ocr => write!(f, "ocr"),
            Self::Translation => write!(f, "translation"),
        }
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
///
/// The in-progress variants name the stage a tool is in; which ones a job
/// passes through depends on its tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Scanning,
    Transcoding,
    Processing,
    Transcribing,
    Ocr,
    Translating,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    /// Whether the job has settled and holds no run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    /// Whether a run is currently driving the job through its stages.
    pub fn is_in_progress(self) -> bool {
        !self.is_terminal() && self != Self::Pending
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Scanning => write!(f, "scanning"),
            Self::Transcoding => write!(f, "transcoding"),
            Self::Processing => write!(f, "processing"),
            Self::Transcribing => write!(f, "transcribing"),
            Self::Ocr => write!(f, "ocr"),
            Self::Translating => write!(f, "translating"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// TrackKind
// ---------------------------------------------------------------------------

/// Stream type inside a media container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
    Subtitle,
    Attachment,
    Data,
}

impl TrackKind {
    /// Map an ffprobe `codec_type` string onto a track kind.
    pub fn from_codec_type(codec_type: &str) -> Self {
        match codec_type {
            "video" => Self::Video,
            "audio" => Self::Audio,
            "subtitle" => Self::Subtitle,
            "attachment" => Self::Attachment,
            _ => Self::Data,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
            Self::Subtitle => write!(f, "subtitle"),
            Self::Attachment => write!(f, "attachment"),
            Self::Data => write!(f, "data"),
        }
    }
}

// ---------------------------------------------------------------------------
// Allowed extensions
// ---------------------------------------------------------------------------

/// File extensions accepted as job sources.
pub const ALLOWED_MEDIA_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "mov", "webm", "m4v", "mks", "mka", "m4a", "mp3", "flac", "wav", "ogg",
    "aac", "ac3", "dts", "srt", "ass", "ssa", "vtt", "sub", "sup", "opus", "wma",
];

/// Subtitle extensions that the translation tool can parse.
pub const SUBTITLE_EXTENSIONS: &[&str] = &["srt", "vtt"];

/// Lowercased extension of `path`, or an empty string.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}
