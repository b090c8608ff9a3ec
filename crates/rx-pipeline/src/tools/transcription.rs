//! Speech to text.
//!
//! The chosen audio stream is first transcoded into a small Opus proxy in the
//! cache directory. The proxy path is recorded with the job's versions and
//! reused by later runs while the file still exists.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rx_av::{AudioTranscodeRequest, MediaBackend, MediaMetadata, ProgressFn};
use rx_core::config::TranscriptionConfig;
use rx_core::{Error, JobStatus, Result, ToolKind, TrackKind};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::executor::{ProcessOutput, RunContext, StageExecutor, StageSpec, SCAN_STAGE};
use crate::subtitles::{to_srt, Cue};
use crate::version::UsageMetrics;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionParams {
    /// Container index of the audio stream; the first audio stream when
    /// unset.
    pub audio_stream: Option<u32>,
    pub model: Option<String>,
    /// Spoken language hint; detected by the service when unset.
    pub language: Option<String>,
}

/// What a speech service returns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub segments: Vec<Cue>,
    /// Detected or requested language.
    pub language: Option<String>,
    pub model: Option<String>,
    pub usage: Option<UsageMetrics>,
}

/// A speech-to-text service.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        audio: &Path,
        params: &TranscriptionParams,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<Transcript>;
}

/// The audio stream picked by the scan.
#[derive(Debug)]
pub struct AudioSelection {
    metadata: MediaMetadata,
    stream_index: u32,
    /// Position among the audio streams.
    audio_index: u32,
}

pub struct TranscriptionExecutor {
    backend: Arc<dyn MediaBackend>,
    transcriber: Arc<dyn Transcriber>,
    defaults: TranscriptionConfig,
}

impl TranscriptionExecutor {
    pub fn new(
        backend: Arc<dyn MediaBackend>,
        transcriber: Arc<dyn Transcriber>,
        defaults: TranscriptionConfig,
    ) -> Self {
        Self {
            backend,
            transcriber,
            defaults,
        }
    }

    /// Reuse a cached proxy or transcode a new one.
    async fn audio_proxy(&self, ctx: &RunContext, audio: &AudioSelection) -> Result<PathBuf> {
        let key = proxy_key(audio.stream_index);
        if let Some(cached) = ctx.cached_artifact(&key) {
            tracing::info!(job_id = %ctx.job_id(), proxy = %cached.display(), "reusing audio proxy");
            ctx.report(1.0);
            return Ok(cached.to_path_buf());
        }

        std::fs::create_dir_all(ctx.cache_dir())?;
        let proxy = ctx.cache_dir().join(format!(
            "{}.{}.a{}.opus",
            ctx.source().stem(),
            ctx.run_id(),
            audio.stream_index
        ));
        let request = AudioTranscodeRequest {
            input: ctx.source().path().to_path_buf(),
            output: proxy.clone(),
            audio_index: Some(audio.audio_index),
        };
        ctx.register_partial(&proxy);
        self.backend
            .transcode_audio(&request, audio.metadata.duration_secs, ctx.token(), &|f: f64| {
                ctx.report(f)
            })
            .await?;
        ctx.record_artifact(key, &proxy);
        ctx.report(1.0);
        Ok(proxy)
    }
}

/// Artifact key of the proxy for container stream `stream_index`.
pub fn proxy_key(stream_index: u32) -> String {
    format!("audio_proxy:{stream_index}")
}

#[async_trait]
impl StageExecutor for TranscriptionExecutor {
    type Metadata = AudioSelection;

    fn tool(&self) -> ToolKind {
        ToolKind::Transcription
    }

    fn stages(&self) -> Vec<StageSpec> {
        vec![
            SCAN_STAGE,
            StageSpec::new("transcode", JobStatus::Transcoding, 3.0),
            StageSpec::new("transcribe", JobStatus::Transcribing, 6.0),
        ]
    }

    fn default_params(&self) -> serde_json::Value {
        serde_json::json!({
            "model": self.defaults.model,
            "language": self.defaults.language,
        })
    }

    async fn scan(&self, ctx: &RunContext) -> Result<AudioSelection> {
        let params: TranscriptionParams = ctx.params_as()?;
        let metadata = super::scan_media(self.backend.as_ref(), ctx).await?;

        let stream = match params.audio_stream {
            Some(idx) => metadata
                .stream(idx)
                .filter(|s| s.kind == TrackKind::Audio)
                .ok_or_else(|| Error::scan(format!("Stream {idx} is not an audio stream")))?,
            None => metadata
                .streams_of(TrackKind::Audio)
                .next()
                .ok_or_else(|| Error::scan("No audio stream found"))?,
        };
        let stream_index = stream.index;
        let audio_index = metadata.relative_index(stream_index).unwrap_or(0) as u32;

        Ok(AudioSelection {
            metadata,
            stream_index,
            audio_index,
        })
    }

    async fn process(&self, ctx: &RunContext, audio: AudioSelection) -> Result<ProcessOutput> {
        let params: TranscriptionParams = ctx.params_as()?;
        let proxy = self.audio_proxy(ctx, &audio).await?;

        ctx.check_cancelled()?;
        ctx.enter_stage(2);
        let transcript = self
            .transcriber
            .transcribe(&proxy, &params, ctx.token(), &|f: f64| ctx.report(f))
            .await?;
        ctx.report(1.0);

        tracing::info!(
            job_id = %ctx.job_id(),
            segments = transcript.segments.len(),
            "transcription finished"
        );

        let model = transcript.model.clone().or(params.model);
        let payload = serde_json::json!({
            "language": transcript.language,
            "segments": transcript.segments,
            "srt": to_srt(&transcript.segments),
        });
        let mut output = ProcessOutput::new(payload);
        output.name_hint = model;
        output.usage = transcript.usage;
        Ok(output)
    }
}
