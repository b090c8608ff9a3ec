//! Mux external tracks into a video, with per-stream metadata.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Per-stream settings for a stream already in the source video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceStreamConfig {
    /// Container index of the stream in the source video.
    pub index: u32,
    pub enabled: bool,
    pub language: Option<String>,
    /// `Some("")` clears an existing title.
    pub title: Option<String>,
    pub default: bool,
    pub forced: bool,
}

impl Default for SourceStreamConfig {
    fn default() -> Self {
        Self {
            index: 0,
            enabled: true,
            language: None,
            title: None,
            default: false,
            forced: false,
        }
    }
}

/// An external file whose first stream is added to the output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeTrack {
    pub input: PathBuf,
    /// Positive values delay the track, negative values advance it.
    #[serde(default)]
    pub delay_ms: i64,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub forced: bool,
}

/// Everything needed to produce one merged file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeRequest {
    pub video: PathBuf,
    pub output: PathBuf,
    /// `None` keeps every source stream untouched.
    #[serde(default)]
    pub source_streams: Option<Vec<SourceStreamConfig>>,
    /// Number of streams in the source video; used when `source_streams`
    /// is `None`.
    #[serde(default)]
    pub source_stream_count: usize,
    #[serde(default)]
    pub tracks: Vec<MergeTrack>,
}

impl MergeRequest {
    /// Source stream indices that survive into the output, in order.
    pub fn enabled_source_indices(&self) -> Vec<u32> {
        match &self.source_streams {
            Some(configs) => configs
                .iter()
                .filter(|c| c.enabled)
                .map(|c| c.index)
                .collect(),
            None => (0..self.source_stream_count as u32).collect(),
        }
    }

    /// Build the ffmpeg argument list.
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-i".into(),
            self.video.to_string_lossy().into_owned(),
        ];

        for track in &self.tracks {
            if track.delay_ms != 0 {
                args.push("-itsoffset".into());
                args.push(format!("{:.3}", track.delay_ms as f64 / 1000.0));
            }
            args.push("-i".into());
            args.push(track.input.to_string_lossy().into_owned());
        }

        let enabled = self.enabled_source_indices();
        for idx in &enabled {
            args.push("-map".into());
            args.push(format!("0:{idx}"));
        }
        for input_idx in 1..=self.tracks.len() {
            args.push("-map".into());
            args.push(format!("{input_idx}:0"));
        }

        args.extend(
            ["-c:v", "copy", "-c:a", "copy", "-c:s", "copy"]
                .into_iter()
                .map(String::from),
        );

        if let Some(configs) = &self.source_streams {
            for (out_idx, cfg) in configs.iter().filter(|c| c.enabled).enumerate() {
                if let Some(lang) = cfg.language.as_deref().filter(|l| !l.is_empty()) {
                    push_metadata(&mut args, out_idx, "language", lang);
                }
                if let Some(title) = cfg.title.as_deref() {
                    push_metadata(&mut args, out_idx, "title", title);
                }
                push_disposition(&mut args, out_idx, cfg.default, cfg.forced);
            }
        }

        let attached_start = enabled.len();
        for (i, track) in self.tracks.iter().enumerate() {
            let out_idx = attached_start + i;
            if let Some(lang) = track
                .language
                .as_deref()
                .filter(|l| !l.is_empty() && *l != "und")
            {
                push_metadata(&mut args, out_idx, "language", lang);
            }
            if let Some(title) = track.title.as_deref().filter(|t| !t.is_empty()) {
                push_metadata(&mut args, out_idx, "title", title);
            }
            push_disposition(&mut args, out_idx, track.default, track.forced);
        }

        args.extend(["-progress".into(), "pipe:1".into()]);
        args.push(self.output.to_string_lossy().into_owned());
        args
    }
}

fn push_metadata(args: &mut Vec<String>, out_idx: usize, key: &str, value: &str) {
    args.push(format!("-metadata:s:{out_idx}"));
    args.push(format!("{key}={value}"));
}

fn push_disposition(args: &mut Vec<String>, out_idx: usize, default: bool, forced: bool) {
    let mut flags = Vec::new();
    if default {
        flags.push("default");
    }
    if forced {
        flags.push("forced");
    }
    args.push(format!("-disposition:{out_idx}"));
    args.push(if flags.is_empty() {
        "0".to_string()
    } else {
        flags.join("+")
    });
}

/// Write the merged file to `req.output`.
pub async fn merge_tracks(
    ffmpeg: &Path,
    req: &MergeRequest,
    duration_secs: Option<f64>,
    cancel: &CancellationToken,
    on_progress: &(dyn Fn(f64) + Send + Sync),
) -> rx_core::Result<()> {
    tracing::info!(
        video = %req.video.display(),
        tracks = req.tracks.len(),
        "merging tracks"
    );
    super::run_ffmpeg_with_progress(ffmpeg, req.args(), duration_secs, cancel, on_progress).await
}
