//! Mux external tracks into a copy of the source video.
//!
//! ffmpeg writes into a scratch [`Workspace`] next to the destination; the
//! finished file is moved into place only after the backend succeeds, so a
//! cancelled merge never leaves a half-written output behind.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rx_av::{
    validate_media_path, validate_output_path, MediaBackend, MediaMetadata, MergeRequest,
    MergeTrack, SourceStreamConfig, Workspace,
};
use rx_core::{Error, JobStatus, Result, ToolKind};
use serde::{Deserialize, Serialize};

use crate::executor::{ProcessOutput, RunContext, StageExecutor, StageSpec, SCAN_STAGE};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeParams {
    /// Destination file; `<stem>.merged.mkv` next to the source when unset.
    pub output: Option<PathBuf>,
    pub tracks: Vec<MergeTrack>,
    /// Per-stream overrides for the source video. `None` keeps every stream.
    pub source_streams: Option<Vec<SourceStreamConfig>>,
}

pub struct MergeExecutor {
    backend: Arc<dyn MediaBackend>,
}

impl MergeExecutor {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self { backend }
    }
}

fn default_output(ctx: &RunContext) -> PathBuf {
    let source = ctx.source();
    let name = format!("{}.merged.mkv", source.stem());
    match source.path().parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

#[async_trait]
impl StageExecutor for MergeExecutor {
    type Metadata = MediaMetadata;

    fn tool(&self) -> ToolKind {
        ToolKind::Merge
    }

    fn stages(&self) -> Vec<StageSpec> {
        vec![SCAN_STAGE, StageSpec::new("merge", JobStatus::Processing, 9.0)]
    }

    async fn scan(&self, ctx: &RunContext) -> Result<MediaMetadata> {
        let params: MergeParams = ctx.params_as()?;
        if params.tracks.is_empty() && params.source_streams.is_none() {
            return Err(Error::scan("Nothing to merge: no tracks attached"));
        }
        for track in &params.tracks {
            validate_media_path(&track.input)?;
        }
        super::scan_media(self.backend.as_ref(), ctx).await
    }

    async fn process(&self, ctx: &RunContext, metadata: MediaMetadata) -> Result<ProcessOutput> {
        let params: MergeParams = ctx.params_as()?;
        let output = params.output.clone().unwrap_or_else(|| default_output(ctx));
        validate_output_path(&output)?;
        if output == ctx.source().path() {
            return Err(Error::Validation(
                "Output must not overwrite the source video".into(),
            ));
        }

        let parent = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let workspace = Workspace::new_in(&parent)?;
        let file_name = output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "merged.mkv".into());
        let staged = workspace.temp_file(&file_name);

        let request = MergeRequest {
            video: ctx.source().path().to_path_buf(),
            output: staged.clone(),
            source_streams: params.source_streams.clone(),
            source_stream_count: metadata.streams.len(),
            tracks: params.tracks.clone(),
        };
        self.backend
            .merge(&request, metadata.duration_secs, ctx.token(), &|f: f64| ctx.report(f))
            .await?;
        ctx.check_cancelled()?;

        if !output.exists() {
            ctx.register_partial(&output);
        }
        workspace.finalize_into(&staged, &output)?;
        ctx.report(1.0);

        tracing::info!(
            job_id = %ctx.job_id(),
            tracks = params.tracks.len(),
            output = %output.display(),
            "merge finished"
        );
        Ok(ProcessOutput::new(serde_json::json!({
            "output": output,
            "tracks": params.tracks.len(),
            "source_streams": request.enabled_source_indices(),
        })))
    }
}
