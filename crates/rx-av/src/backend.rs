//! The native media interface used by the tool stages.
//!
//! Executors talk to [`MediaBackend`] rather than to ffmpeg directly, so the
//! pipeline can be driven by a fake in tests.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::actions::{
    self, AudioTranscodeRequest, ExtractRequest, FrameExtractRequest, MergeRequest,
};
use crate::probe::{self, MediaMetadata};
use crate::tools::ToolRegistry;

/// Progress sink receiving a fraction in `[0, 1]` of the current operation.
pub type ProgressFn<'a> = &'a (dyn Fn(f64) + Send + Sync);

/// Probing and transcoding operations on media files.
///
/// Every long-running method observes `cancel` and returns
/// [`rx_core::Error::Cancelled`] once it fires.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Inspect a media file.
    async fn probe(&self, path: &Path) -> rx_core::Result<MediaMetadata>;

    /// Copy one track out of a container.
    async fn extract_track(
        &self,
        req: &ExtractRequest,
        duration_secs: Option<f64>,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> rx_core::Result<()>;

    /// Produce a merged container.
    async fn merge(
        &self,
        req: &MergeRequest,
        duration_secs: Option<f64>,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> rx_core::Result<()>;

    /// Transcode an audio stream into a speech proxy.
    async fn transcode_audio(
        &self,
        req: &AudioTranscodeRequest,
        duration_secs: Option<f64>,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> rx_core::Result<()>;

    /// Sample frames, returning their paths in timestamp order.
    async fn extract_frames(
        &self,
        req: &FrameExtractRequest,
        duration_secs: Option<f64>,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> rx_core::Result<Vec<PathBuf>>;
}

/// [`MediaBackend`] backed by the ffmpeg and ffprobe CLIs.
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    tools: ToolRegistry,
}

impl FfmpegBackend {
    pub fn new(tools: ToolRegistry) -> Self {
        Self { tools }
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    fn ffmpeg(&self) -> rx_core::Result<&Path> {
        Ok(self.tools.require("ffmpeg")?.path.as_path())
    }
}

#[async_trait]
impl MediaBackend for FfmpegBackend {
    async fn probe(&self, path: &Path) -> rx_core::Result<MediaMetadata> {
        let ffprobe = self.tools.require("ffprobe")?;
        probe::probe(&ffprobe.path, path).await
    }

    async fn extract_track(
        &self,
        req: &ExtractRequest,
        duration_secs: Option<f64>,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> rx_core::Result<()> {
        actions::extract_track(self.ffmpeg()?, req, duration_secs, cancel, progress).await
    }

    async fn merge(
        &self,
        req: &MergeRequest,
        duration_secs: Option<f64>,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> rx_core::Result<()> {
        actions::merge_tracks(self.ffmpeg()?, req, duration_secs, cancel, progress).await
    }

    async fn transcode_audio(
        &self,
        req: &AudioTranscodeRequest,
        duration_secs: Option<f64>,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> rx_core::Result<()> {
        actions::transcode_audio(self.ffmpeg()?, req, duration_secs, cancel, progress).await
    }

    async fn extract_frames(
        &self,
        req: &FrameExtractRequest,
        duration_secs: Option<f64>,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> rx_core::Result<Vec<PathBuf>> {
        actions::extract_frames(self.ffmpeg()?, req, duration_secs, cancel, progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn missing_tools_surface_as_tool_errors() {
        let backend = FfmpegBackend::new(ToolRegistry::default());
        let err = backend.probe(Path::new("/a.mkv")).await.unwrap_err();
        assert_matches!(err, rx_core::Error::Tool { ref tool, .. } if tool == "ffprobe");

        let req = AudioTranscodeRequest {
            input: "/a.mkv".into(),
            output: "/a.opus".into(),
            audio_index: None,
        };
        let token = CancellationToken::new();
        let err = backend
            .transcode_audio(&req, None, &token, &|_| {})
            .await
            .unwrap_err();
        assert_matches!(err, rx_core::Error::Tool { ref tool, .. } if tool == "ffmpeg");
    }
}
