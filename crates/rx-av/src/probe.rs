//! ffprobe-based media inspection.
//!
//! Shells out to `ffprobe -v quiet -print_format json -show_format -show_streams`
//! and maps the JSON output into [`MediaMetadata`]. The scan stage of every
//! media tool goes through here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rx_core::TrackKind;
use serde::{Deserialize, Serialize};

use crate::command::ToolCommand;

/// Upper bound on a single ffprobe invocation.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Container-level facts about a media file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub path: PathBuf,
    pub format_name: Option<String>,
    pub duration_secs: Option<f64>,
    pub size_bytes: Option<u64>,
    pub streams: Vec<StreamInfo>,
}

impl MediaMetadata {
    /// Streams of one kind, in container order.
    pub fn streams_of(&self, kind: TrackKind) -> impl Iterator<Item = &StreamInfo> {
        self.streams.iter().filter(move |s| s.kind == kind)
    }

    /// Look up a stream by its container index.
    pub fn stream(&self, index: u32) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.index == index)
    }

    /// The position of stream `index` among streams of the same kind
    /// (the `N` in ffmpeg's `0:a:N`).
    pub fn relative_index(&self, index: u32) -> Option<usize> {
        let stream = self.stream(index)?;
        self.streams_of(stream.kind).position(|s| s.index == index)
    }
}

/// One stream inside a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub index: u32,
    pub kind: TrackKind,
    pub codec: String,
    pub language: Option<String>,
    pub title: Option<String>,
    pub default: bool,
    pub forced: bool,
    pub channels: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_secs: Option<f64>,
}

/// Run ffprobe against `path`.
///
/// A tool failure or unparseable output is reported as [`rx_core::Error::Scan`]:
/// the source is treated as unreadable.
pub async fn probe(ffprobe: &Path, path: &Path) -> rx_core::Result<MediaMetadata> {
    let mut cmd = ToolCommand::new(ffprobe.to_path_buf());
    cmd.args([
        "-v",
        "quiet",
        "-print_format",
        "json",
        "-show_format",
        "-show_streams",
    ]);
    cmd.arg(path.to_string_lossy().as_ref());
    cmd.timeout(PROBE_TIMEOUT);

    let output = cmd
        .execute()
        .await
        .map_err(|e| rx_core::Error::scan(format!("ffprobe failed for {}: {e}", path.display())))?;

    parse_ffprobe_json(path, &output.stdout)
}

/// Parse ffprobe's JSON output.
pub fn parse_ffprobe_json(path: &Path, json: &str) -> rx_core::Result<MediaMetadata> {
    let ff: FfprobeOutput = serde_json::from_str(json)
        .map_err(|e| rx_core::Error::scan(format!("ffprobe JSON parse error: {e}")))?;

    let format = ff.format.unwrap_or_default();
    let streams = ff
        .streams
        .into_iter()
        .map(|s| StreamInfo {
            index: s.index,
            kind: TrackKind::from_codec_type(s.codec_type.as_deref().unwrap_or("")),
            codec: s.codec_name.unwrap_or_default(),
            language: s.tags.language.filter(|l| !l.is_empty()),
            title: s.tags.title.filter(|t| !t.is_empty()),
            default: s.disposition.default == 1,
            forced: s.disposition.forced == 1,
            channels: s.channels,
            width: s.width,
            height: s.height,
            duration_secs: s.duration.as_deref().and_then(parse_secs),
        })
        .collect();

    Ok(MediaMetadata {
        path: path.to_path_buf(),
        format_name: format.format_name,
        duration_secs: format.duration.as_deref().and_then(parse_secs),
        size_bytes: format.size.and_then(|s| s.parse().ok()),
        streams,
    })
}

fn parse_secs(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|d| d.is_finite() && *d >= 0.0)
}

// ---------------------------------------------------------------------------
// JSON structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    #[serde(default)]
    index: u32,
    codec_type: Option<String>,
    codec_name: Option<String>,
    channels: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
    #[serde(default)]
    disposition: FfprobeDisposition,
    #[serde(default)]
    tags: FfprobeTags,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeDisposition {
    #[serde(default)]
    default: u8,
    #[serde(default)]
    forced: u8,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeTags {
    language: Option<String>,
    title: Option<String>,
}
