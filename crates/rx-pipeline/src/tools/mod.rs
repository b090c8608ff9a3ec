//! The five tool executors.
//!
//! Media tools scan through [`MediaBackend::probe`] after validating the
//! source path; translation parses the subtitle file itself. External
//! services (speech, OCR, translation) are reached through the traits
//! defined next to their executor.

pub mod extraction;
pub mod merge;
pub mod ocr;
pub mod transcription;
pub mod translation;

pub use extraction::{ExtractedTrack, ExtractionExecutor, ExtractionParams};
pub use merge::{MergeExecutor, MergeParams};
pub use ocr::{
    export_subtitles, payload_cues, ExportFormat, OcrEngine, OcrExecutor, OcrParams, Recognition,
};
pub use transcription::{Transcriber, Transcript, TranscriptionExecutor, TranscriptionParams};
pub use translation::{
    TranslationExecutor, TranslationParams, TranslationRequest, TranslationResponse, Translator,
};

use rx_av::{validate_media_path, MediaBackend, MediaMetadata};
use rx_core::Result;

use crate::executor::RunContext;

/// Check the source path, then probe it.
async fn scan_media(backend: &dyn MediaBackend, ctx: &RunContext) -> Result<MediaMetadata> {
    let path = ctx.source().path();
    validate_media_path(path)?;
    ctx.check_cancelled()?;
    let metadata = backend.probe(path).await?;
    tracing::debug!(
        job_id = %ctx.job_id(),
        streams = metadata.streams.len(),
        duration = ?metadata.duration_secs,
        "source scanned"
    );
    Ok(metadata)
}
