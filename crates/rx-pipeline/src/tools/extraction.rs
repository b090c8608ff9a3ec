//! Copy selected streams out of a container into standalone files.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rx_av::actions::output_file_name;
use rx_av::{
    validate_output_path, ExtractRequest, MediaBackend, MediaMetadata, StreamInfo, Workspace,
};
use rx_core::{Error, JobStatus, Result, ToolKind, TrackKind};
use serde::{Deserialize, Serialize};

use crate::executor::{ProcessOutput, RunContext, StageExecutor, StageSpec, SCAN_STAGE};
use crate::progress::WeightedUnits;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionParams {
    /// Directory for the extracted files; next to the source when unset.
    pub output_dir: Option<PathBuf>,
    /// Container stream indices to extract. Empty selects every audio and
    /// subtitle stream (plus video with `include_video`).
    pub streams: Vec<u32>,
    pub include_video: bool,
}

/// One file written by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedTrack {
    pub stream_index: u32,
    pub kind: TrackKind,
    pub codec: String,
    pub language: Option<String>,
    pub path: PathBuf,
}

/// Streams chosen by the scan.
#[derive(Debug)]
pub struct ExtractionPlan {
    metadata: MediaMetadata,
    streams: Vec<StreamInfo>,
}

pub struct ExtractionExecutor {
    backend: Arc<dyn MediaBackend>,
}

impl ExtractionExecutor {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        Self { backend }
    }
}

/// Relative cost of copying one stream of `kind`.
fn track_weight(kind: TrackKind) -> f64 {
    match kind {
        TrackKind::Video => 4.0,
        TrackKind::Audio => 2.0,
        _ => 1.0,
    }
}

fn select_streams(metadata: &MediaMetadata, params: &ExtractionParams) -> Result<Vec<StreamInfo>> {
    if params.streams.is_empty() {
        let selected: Vec<StreamInfo> = metadata
            .streams
            .iter()
            .filter(|s| match s.kind {
                TrackKind::Audio | TrackKind::Subtitle => true,
                TrackKind::Video => params.include_video,
                TrackKind::Attachment | TrackKind::Data => false,
            })
            .cloned()
            .collect();
        if selected.is_empty() {
            return Err(Error::scan("No extractable tracks found"));
        }
        return Ok(selected);
    }

    params
        .streams
        .iter()
        .map(|idx| {
            metadata
                .stream(*idx)
                .cloned()
                .ok_or_else(|| Error::scan(format!("Stream {idx} not found in source")))
        })
        .collect()
}

#[async_trait]
impl StageExecutor for ExtractionExecutor {
    type Metadata = ExtractionPlan;

    fn tool(&self) -> ToolKind {
        ToolKind::Extraction
    }

    fn stages(&self) -> Vec<StageSpec> {
        vec![
            SCAN_STAGE,
            StageSpec::new("extract", JobStatus::Processing, 9.0),
        ]
    }

    async fn scan(&self, ctx: &RunContext) -> Result<ExtractionPlan> {
        let params: ExtractionParams = ctx.params_as()?;
        let metadata = super::scan_media(self.backend.as_ref(), ctx).await?;
        let streams = select_streams(&metadata, &params)?;
        Ok(ExtractionPlan { metadata, streams })
    }

    async fn process(&self, ctx: &RunContext, plan: ExtractionPlan) -> Result<ProcessOutput> {
        let params: ExtractionParams = ctx.params_as()?;
        let source = ctx.source();
        let output_dir = match params.output_dir {
            Some(dir) => dir,
            None => source
                .path()
                .parent()
                .map(PathBuf::from)
                .unwrap_or_default(),
        };
        let stem = source.stem();
        // Tracks are staged next to their destination and moved into place
        // only once every track is written.
        let workspace = Workspace::new_in(&output_dir)?;

        let mut units =
            WeightedUnits::new(plan.streams.iter().map(|s| track_weight(s.kind)).collect());
        let mut staged = Vec::with_capacity(plan.streams.len());

        for (i, stream) in plan.streams.iter().enumerate() {
            ctx.check_cancelled()?;
            let name = output_file_name(&stem, stream);
            let output = output_dir.join(&name);
            validate_output_path(&output)?;

            let request = ExtractRequest {
                input: source.path().to_path_buf(),
                output: workspace.temp_file(&name),
                stream_index: stream.index,
                kind: stream.kind,
                codec: stream.codec.clone(),
            };
            self.backend
                .extract_track(
                    &request,
                    plan.metadata.duration_secs,
                    ctx.token(),
                    &|f: f64| ctx.report(units.fraction_with(i, f)),
                )
                .await?;
            ctx.report(units.complete(i));
            tracing::debug!(job_id = %ctx.job_id(), stream = stream.index, "track staged");
            staged.push((stream, request.output, output));
        }
        ctx.check_cancelled()?;

        let mut extracted = Vec::with_capacity(staged.len());
        for (stream, staged_path, output) in staged {
            // Files of earlier versions are replaced but never claimed by
            // this run, so a late cancel cannot delete them.
            if !output.exists() {
                ctx.register_partial(&output);
            }
            workspace.finalize_into(&staged_path, &output)?;
            tracing::info!(
                job_id = %ctx.job_id(),
                stream = stream.index,
                output = %output.display(),
                "track extracted"
            );
            extracted.push(ExtractedTrack {
                stream_index: stream.index,
                kind: stream.kind,
                codec: stream.codec.clone(),
                language: stream.language.clone(),
                path: output,
            });
        }

        let payload = serde_json::json!({ "tracks": extracted });
        Ok(ProcessOutput::new(payload))
    }
}
