//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries all
//! sub-configs for job scheduling, external tools, the proxy cache and the
//! per-tool defaults. Every section defaults sensibly so a completely empty
//! `{}` file is valid. Values are read when a run starts; a running batch
//! never observes a changed config.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::Error;

/// Lower bound for the number of jobs processed at once.
pub const MIN_CONCURRENT: usize = 1;
/// Upper bound for the number of jobs processed at once.
pub const MAX_CONCURRENT: usize = 10;

/// Clamp a requested concurrency into `[MIN_CONCURRENT, MAX_CONCURRENT]`.
pub fn clamp_concurrency(requested: usize) -> usize {
    requested.clamp(MIN_CONCURRENT, MAX_CONCURRENT)
}

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub jobs: JobsConfig,
    pub tools: ToolsConfig,
    pub cache: CacheConfig,
    pub translation: TranslationConfig,
    pub transcription: TranscriptionConfig,
    pub ocr: OcrConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Validation(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.jobs.max_concurrent != clamp_concurrency(self.jobs.max_concurrent) {
            warnings.push(format!(
                "jobs.max_concurrent {} is outside [{MIN_CONCURRENT}, {MAX_CONCURRENT}] and will be clamped",
                self.jobs.max_concurrent
            ));
        }

        for (label, custom) in [
            ("tools.ffmpeg_path", &self.tools.ffmpeg_path),
            ("tools.ffprobe_path", &self.tools.ffprobe_path),
        ] {
            if let Some(p) = custom {
                if !p.is_file() {
                    warnings.push(format!("{label} '{}' is not an existing file", p.display()));
                }
            }
        }

        if self.translation.default_batch_count == 0 {
            warnings.push("translation.default_batch_count is 0; 1 will be used".into());
        }
        if self.translation.max_batch_count < self.translation.default_batch_count {
            warnings.push(
                "translation.max_batch_count is lower than default_batch_count".into(),
            );
        }

        if self.ocr.fps <= 0.0 {
            warnings.push(format!("ocr.fps must be greater than 0 (got {})", self.ocr.fps));
        }
        if !(0.0..=1.0).contains(&self.ocr.min_confidence) {
            warnings.push(format!(
                "ocr.min_confidence {} is outside [0, 1]",
                self.ocr.min_confidence
            ));
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Job scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Requested number of jobs processed at once (clamped on use).
    pub max_concurrent: usize,
    /// Quiet period before a content edit is written to the sidecar.
    pub edit_debounce_ms: u64,
}

impl JobsConfig {
    /// The effective, clamped concurrency limit.
    pub fn effective_concurrency(&self) -> usize {
        clamp_concurrency(self.max_concurrent)
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            edit_debounce_ms: 800,
        }
    }
}

/// Paths to external CLI tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}

/// Location of reusable intermediate artifacts (transcoded proxies).
///
/// The directory is assumed to be ephemeral; cached paths are re-validated
/// before reuse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("rsext-cache"),
        }
    }
}

/// Subtitle translation defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub default_batch_count: u32,
    pub max_batch_count: u32,
    pub target_language: String,
    pub model: Option<String>,
    pub api_key: Option<String>,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            default_batch_count: 1,
            max_batch_count: 64,
            target_language: "en".into(),
            model: None,
            api_key: None,
        }
    }
}

/// Audio transcription defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub model: Option<String>,
    pub language: Option<String>,
    pub api_key: Option<String>,
}

/// Video OCR defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    /// Frames sampled per second of video.
    pub fps: f64,
    /// Frames recognised below this confidence are ignored.
    pub min_confidence: f64,
    pub language: String,
    pub cleanup: OcrCleanupConfig,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            fps: 2.0,
            min_confidence: 0.5,
            language: "en".into(),
            cleanup: OcrCleanupConfig::default(),
        }
    }
}

/// Post-processing applied when OCR frames are turned into subtitle cues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OcrCleanupConfig {
    pub merge_similar: bool,
    pub similarity_threshold: f64,
    pub max_gap_ms: u64,
    pub min_cue_duration_ms: u64,
    pub filter_url_like: bool,
}

impl Default for OcrCleanupConfig {
    fn default() -> Self {
        Self {
            merge_similar: true,
            similarity_threshold: 0.92,
            max_gap_ms: 250,
            min_cue_duration_ms: 500,
            filter_url_like: true,
        }
    }
}
