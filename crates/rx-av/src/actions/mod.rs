//! ffmpeg invocations used by the tool stages: track extraction, merging,
//! audio proxy transcoding, and frame sampling for OCR.
//!
//! Each action is a plain request struct whose `args()` builds the ffmpeg
//! argument list, plus an async `run` that executes it with progress and
//! cancellation.

mod audio;
mod extract;
mod frames;
mod merge;

pub use audio::{transcode_audio, AudioTranscodeRequest};
pub use extract::{
    extension_for_codec, extract_track, ffmpeg_format_for_codec, output_file_name,
    ExtractRequest,
};
pub use frames::{extract_frames, list_frames, CropRegion, FrameExtractRequest};
pub use merge::{merge_tracks, MergeRequest, MergeTrack, SourceStreamConfig};

use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::command::ToolCommand;
use crate::progress::FfmpegProgress;

/// Run ffmpeg with `args`, forwarding `-progress` updates to `on_progress`.
async fn run_ffmpeg_with_progress(
    ffmpeg: &Path,
    args: Vec<String>,
    duration_secs: Option<f64>,
    cancel: &CancellationToken,
    on_progress: &(dyn Fn(f64) + Send + Sync),
) -> rx_core::Result<()> {
    let mut cmd = ToolCommand::new(ffmpeg.to_path_buf());
    cmd.args(args).cancel_token(cancel.clone());

    let mut tracker = FfmpegProgress::new(duration_secs);
    cmd.execute_with_line_callback(|line| {
        if let Some(fraction) = tracker.feed(line) {
            on_progress(fraction);
        }
    })
    .await?;
    Ok(())
}
