//! Burned-in subtitle recognition.
//!
//! Frames are sampled at the configured rate into a scratch directory under
//! the cache dir, recognised one by one, and folded into cues by
//! [`build_ocr_cues`]. Results can be written out as SRT, WebVTT or plain
//! text with [`export_subtitles`].

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rx_av::{
    validate_output_path, CropRegion, FrameExtractRequest, MediaBackend, MediaMetadata, Workspace,
};
use rx_core::config::{OcrCleanupConfig, OcrConfig};
use rx_core::{Error, JobStatus, Result, ToolKind, TrackKind};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::executor::{ProcessOutput, RunContext, StageExecutor, StageSpec, SCAN_STAGE};
use crate::progress::WeightedUnits;
use crate::subtitles::{build_ocr_cues, to_srt, to_txt, to_vtt, Cue, FrameText};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrParams {
    pub fps: f64,
    pub min_confidence: f64,
    pub language: String,
    /// Part of the frame to read, as fractions of its size.
    pub crop: Option<CropRegion>,
    pub cleanup: OcrCleanupConfig,
}

impl Default for OcrParams {
    fn default() -> Self {
        Self::from(&OcrConfig::default())
    }
}

impl From<&OcrConfig> for OcrParams {
    fn from(config: &OcrConfig) -> Self {
        Self {
            fps: config.fps,
            min_confidence: config.min_confidence,
            language: config.language.clone(),
            crop: None,
            cleanup: config.cleanup.clone(),
        }
    }
}

/// Text found on one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recognition {
    pub text: String,
    pub confidence: f64,
}

/// An OCR service.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(
        &self,
        frame: &Path,
        language: &str,
        cancel: &CancellationToken,
    ) -> Result<Recognition>;
}

pub struct OcrExecutor {
    backend: Arc<dyn MediaBackend>,
    engine: Arc<dyn OcrEngine>,
    defaults: OcrParams,
}

impl OcrExecutor {
    pub fn new(backend: Arc<dyn MediaBackend>, engine: Arc<dyn OcrEngine>, config: &OcrConfig) -> Self {
        Self {
            backend,
            engine,
            defaults: OcrParams::from(config),
        }
    }
}

#[async_trait]
impl StageExecutor for OcrExecutor {
    type Metadata = MediaMetadata;

    fn tool(&self) -> ToolKind {
        ToolKind::Ocr
    }

    fn stages(&self) -> Vec<StageSpec> {
        vec![
            SCAN_STAGE,
            StageSpec::new("frames", JobStatus::Transcoding, 3.0),
            StageSpec::new("ocr", JobStatus::Ocr, 6.0),
        ]
    }

    fn default_params(&self) -> serde_json::Value {
        serde_json::to_value(&self.defaults).unwrap_or_else(|_| serde_json::json!({}))
    }

    async fn scan(&self, ctx: &RunContext) -> Result<MediaMetadata> {
        let params: OcrParams = ctx.params_as()?;
        if !(params.fps > 0.0 && params.fps.is_finite()) {
            return Err(Error::Validation(format!(
                "fps must be greater than 0 (got {})",
                params.fps
            )));
        }
        if params.crop.is_some_and(|c| !c.is_valid()) {
            return Err(Error::Validation("crop region must lie within the frame".into()));
        }

        let metadata = super::scan_media(self.backend.as_ref(), ctx).await?;
        if metadata.streams_of(TrackKind::Video).next().is_none() {
            return Err(Error::scan("No video stream found"));
        }
        Ok(metadata)
    }

    async fn process(&self, ctx: &RunContext, metadata: MediaMetadata) -> Result<ProcessOutput> {
        let params: OcrParams = ctx.params_as()?;
        let workspace = Workspace::new_in(ctx.cache_dir())?;
        let request = FrameExtractRequest {
            input: ctx.source().path().to_path_buf(),
            output_dir: workspace.subdir("frames")?,
            fps: params.fps,
            crop: params.crop,
        };
        let frames = self
            .backend
            .extract_frames(&request, metadata.duration_secs, ctx.token(), &|f: f64| {
                ctx.report(f)
            })
            .await?;
        ctx.report(1.0);
        tracing::debug!(job_id = %ctx.job_id(), frames = frames.len(), "frames sampled");

        ctx.check_cancelled()?;
        ctx.enter_stage(2);
        let mut units = WeightedUnits::uniform(frames.len());
        let mut texts = Vec::with_capacity(frames.len());
        for (i, frame) in frames.iter().enumerate() {
            ctx.check_cancelled()?;
            let recognition = self
                .engine
                .recognize(frame, &params.language, ctx.token())
                .await?;
            texts.push(FrameText {
                frame_index: i as u32,
                time_ms: (i as f64 * 1000.0 / params.fps).round() as u64,
                text: recognition.text,
                confidence: recognition.confidence,
            });
            ctx.report(units.complete(i));
        }

        let cues = build_ocr_cues(&texts, params.fps, params.min_confidence, &params.cleanup)?;
        tracing::info!(
            job_id = %ctx.job_id(),
            frames = frames.len(),
            cues = cues.len(),
            "ocr finished"
        );

        Ok(ProcessOutput::new(serde_json::json!({
            "frames": frames.len(),
            "srt": to_srt(&cues),
            "cues": cues,
        })))
    }
}

/// Output syntax of an OCR export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Srt,
    Vtt,
    Txt,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Srt => "srt",
            Self::Vtt => "vtt",
            Self::Txt => "txt",
        }
    }

    pub fn render(self, cues: &[Cue]) -> String {
        match self {
            Self::Srt => to_srt(cues),
            Self::Vtt => to_vtt(cues),
            Self::Txt => to_txt(cues),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "srt" => Ok(Self::Srt),
            "vtt" => Ok(Self::Vtt),
            "txt" => Ok(Self::Txt),
            _ => Err(Error::Validation(format!("Unsupported format: {s}"))),
        }
    }
}

/// The cues stored in an OCR version's payload.
pub fn payload_cues(payload: &serde_json::Value) -> Result<Vec<Cue>> {
    let cues = payload
        .get("cues")
        .cloned()
        .ok_or_else(|| Error::Validation("version has no OCR cues".into()))?;
    serde_json::from_value(cues).map_err(|e| Error::Validation(format!("invalid OCR cues: {e}")))
}

/// Write `cues` to `output` in `format`. The parent directory must exist.
pub fn export_subtitles(cues: &[Cue], output: &Path, format: ExportFormat) -> Result<()> {
    validate_output_path(output)?;
    std::fs::write(output, format.render(cues))?;
    tracing::info!(
        path = %output.display(),
        format = format.extension(),
        cues = cues.len(),
        "ocr subtitles exported"
    );
    Ok(())
}
