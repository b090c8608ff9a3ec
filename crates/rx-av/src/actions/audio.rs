//! Transcode one audio stream into a compact mono Opus proxy for speech
//! recognition.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Bitrate of the speech proxy.
pub const PROXY_BITRATE: &str = "96k";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioTranscodeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Position among the audio streams (`0:a:N`); the first when `None`.
    #[serde(default)]
    pub audio_index: Option<u32>,
}

impl AudioTranscodeRequest {
    /// Build the ffmpeg argument list.
    pub fn args(&self) -> Vec<String> {
        let map = format!("0:a:{}", self.audio_index.unwrap_or(0));
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-i".into(),
            self.input.to_string_lossy().into_owned(),
            "-map".into(),
            map,
        ];
        args.extend(
            [
                "-c:a", "libopus", "-b:a", PROXY_BITRATE, "-ac", "1", "-progress", "pipe:1",
            ]
            .into_iter()
            .map(String::from),
        );
        args.push(self.output.to_string_lossy().into_owned());
        args
    }
}

/// Write the Opus proxy to `req.output`.
pub async fn transcode_audio(
    ffmpeg: &Path,
    req: &AudioTranscodeRequest,
    duration_secs: Option<f64>,
    cancel: &CancellationToken,
    on_progress: &(dyn Fn(f64) + Send + Sync),
) -> rx_core::Result<()> {
    tracing::info!(input = %req.input.display(), "transcoding audio proxy");
    super::run_ffmpeg_with_progress(ffmpeg, req.args(), duration_secs, cancel, on_progress).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_first_audio_stream() {
        let req = AudioTranscodeRequest {
            input: "/in/talk.mkv".into(),
            output: "/cache/talk.opus".into(),
            audio_index: None,
        };
        let args = req.args();
        let pos = args.iter().position(|a| a == "-map").unwrap();
        assert_eq!(args[pos + 1], "0:a:0");
        assert!(args.windows(2).any(|w| w[0] == "-ac" && w[1] == "1"));
        assert!(args.windows(2).any(|w| w[0] == "-c:a" && w[1] == "libopus"));
        assert_eq!(args.last().unwrap(), "/cache/talk.opus");
    }

    #[test]
    fn explicit_audio_index() {
        let req = AudioTranscodeRequest {
            input: "/in/talk.mkv".into(),
            output: "/cache/talk.opus".into(),
            audio_index: Some(2),
        };
        assert!(req.args().contains(&"0:a:2".to_string()));
    }
}
