//! Stream-copy a single track out of a container.

use std::path::{Path, PathBuf};

use rx_core::TrackKind;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::probe::StreamInfo;

/// Codecs whose raw stream needs an explicit `-f` muxer.
const CODEC_TO_FFMPEG_FORMAT: &[(&str, &str)] = &[
    ("wmav2", "asf"),
    ("wmav1", "asf"),
    ("wma", "asf"),
    ("wmapro", "asf"),
    ("wmavoice", "asf"),
    ("pcm_s16le", "wav"),
    ("pcm_s24le", "wav"),
    ("pcm_s32le", "wav"),
    ("pcm_s16be", "wav"),
    ("pcm_s24be", "wav"),
    ("pcm_s32be", "wav"),
    ("pcm_u8", "wav"),
    ("pcm_u16le", "wav"),
    ("pcm_u24le", "wav"),
    ("pcm_u32le", "wav"),
    ("pcm_u16be", "wav"),
    ("pcm_u24be", "wav"),
    ("pcm_u32be", "wav"),
    ("adpcm_ima_wav", "wav"),
    ("adpcm_ms", "wav"),
    ("adpcm_yamaha", "wav"),
    ("mp2", "mp3"),
    ("truehd", "mlp"),
    ("mlp", "mlp"),
    ("wavpack", "wv"),
];

/// Extensions ffmpeg picks a muxer for on its own.
const KNOWN_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "webm", "m4v", "m4a", "mp3", "aac", "ac3", "eac3", "dts", "flac",
    "ogg", "opus", "wav", "wma", "ass", "ssa", "srt", "vtt", "sub", "sup",
];

/// The muxer to force for `codec`, if ffmpeg cannot infer it.
pub fn ffmpeg_format_for_codec(codec: &str) -> Option<&'static str> {
    CODEC_TO_FFMPEG_FORMAT
        .iter()
        .find(|(c, _)| c.eq_ignore_ascii_case(codec))
        .map(|(_, format)| *format)
}

fn has_recognized_extension(path: &Path) -> bool {
    let ext = rx_core::media::extension_of(path);
    KNOWN_EXTENSIONS.contains(&ext.as_str())
}

/// File extension used when writing a stream of `kind` encoded as `codec`.
pub fn extension_for_codec(kind: TrackKind, codec: &str) -> &'static str {
    match (kind, codec.to_ascii_lowercase().as_str()) {
        (TrackKind::Subtitle, "subrip" | "srt") => "srt",
        (TrackKind::Subtitle, "ass") => "ass",
        (TrackKind::Subtitle, "ssa") => "ssa",
        (TrackKind::Subtitle, "webvtt") => "vtt",
        (TrackKind::Subtitle, "hdmv_pgs_subtitle") => "sup",
        (TrackKind::Subtitle, "dvd_subtitle") => "sub",
        (TrackKind::Subtitle, _) => "mks",
        (TrackKind::Audio, "aac") => "m4a",
        (TrackKind::Audio, "ac3") => "ac3",
        (TrackKind::Audio, "eac3") => "eac3",
        (TrackKind::Audio, "dts") => "dts",
        (TrackKind::Audio, "flac") => "flac",
        (TrackKind::Audio, "opus") => "opus",
        (TrackKind::Audio, "vorbis") => "ogg",
        (TrackKind::Audio, "mp3" | "mp2") => "mp3",
        (TrackKind::Audio, c) if c.starts_with("wma") => "wma",
        (TrackKind::Audio, c) if c.starts_with("pcm_") || c.starts_with("adpcm_") => "wav",
        (TrackKind::Audio, "truehd" | "mlp") => "mlp",
        (TrackKind::Audio, "wavpack") => "wv",
        (TrackKind::Audio, _) => "mka",
        (TrackKind::Video, _) => "mkv",
        (TrackKind::Attachment | TrackKind::Data, _) => "bin",
    }
}

/// `<stem>.track<N>.<lang>.<ext>`, with the language segment omitted when
/// the stream has none.
pub fn output_file_name(stem: &str, stream: &StreamInfo) -> String {
    let ext = extension_for_codec(stream.kind, &stream.codec);
    match stream.language.as_deref().filter(|l| *l != "und") {
        Some(lang) => format!("{stem}.track{}.{lang}.{ext}", stream.index),
        None => format!("{stem}.track{}.{ext}", stream.index),
    }
}

/// One track to copy out of `input`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Container-level stream index.
    pub stream_index: u32,
    pub kind: TrackKind,
    pub codec: String,
}

impl ExtractRequest {
    /// Build the ffmpeg argument list.
    pub fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-i".into(),
            self.input.to_string_lossy().into_owned(),
            "-map".into(),
            format!("0:{}", self.stream_index),
        ];

        let needs_format = match self.kind {
            TrackKind::Subtitle => {
                let codec = match self.codec.as_str() {
                    "subrip" | "srt" => "srt",
                    "webvtt" => "webvtt",
                    _ => "copy",
                };
                args.extend(["-c:s".into(), codec.into()]);
                false
            }
            TrackKind::Audio => {
                args.extend(["-c:a".into(), "copy".into(), "-vn".into()]);
                ffmpeg_format_for_codec(&self.codec).is_some()
                    || !has_recognized_extension(&self.output)
            }
            TrackKind::Video => {
                args.extend(["-c:v".into(), "copy".into(), "-an".into(), "-sn".into()]);
                false
            }
            TrackKind::Attachment | TrackKind::Data => {
                args.extend(["-c".into(), "copy".into()]);
                false
            }
        };

        if needs_format {
            if let Some(format) = ffmpeg_format_for_codec(&self.codec) {
                args.extend(["-f".into(), format.into()]);
            }
        }

        args.extend(["-progress".into(), "pipe:1".into()]);
        args.push(self.output.to_string_lossy().into_owned());
        args
    }
}

/// Copy one track to `req.output`.
pub async fn extract_track(
    ffmpeg: &Path,
    req: &ExtractRequest,
    duration_secs: Option<f64>,
    cancel: &CancellationToken,
    on_progress: &(dyn Fn(f64) + Send + Sync),
) -> rx_core::Result<()> {
    tracing::info!(
        input = %req.input.display(),
        stream = req.stream_index,
        codec = %req.codec,
        "extracting track"
    );
    super::run_ffmpeg_with_progress(ffmpeg, req.args(), duration_secs, cancel, on_progress).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: TrackKind, codec: &str, output: &str) -> ExtractRequest {
        ExtractRequest {
            input: PathBuf::from("/in/movie.mkv"),
            output: PathBuf::from(output),
            stream_index: 2,
            kind,
            codec: codec.into(),
        }
    }

    #[test]
    fn format_lookup_is_case_insensitive() {
        assert_eq!(ffmpeg_format_for_codec("WMAV2"), Some("asf"));
        assert_eq!(ffmpeg_format_for_codec("pcm_s24le"), Some("wav"));
        assert_eq!(ffmpeg_format_for_codec("truehd"), Some("mlp"));
        assert_eq!(ffmpeg_format_for_codec("aac"), None);
    }

    #[test]
    fn audio_with_special_codec_forces_format() {
        let args = request(TrackKind::Audio, "wmav2", "/out/a.wma").args();
        let pos = args.iter().position(|a| a == "-f").unwrap();
        assert_eq!(args[pos + 1], "asf");
        assert!(args.contains(&"-vn".to_string()));
    }

    #[test]
    fn plain_audio_has_no_format_flag() {
        let args = request(TrackKind::Audio, "aac", "/out/a.m4a").args();
        assert!(!args.contains(&"-f".to_string()));
        assert_eq!(args.last().unwrap(), "/out/a.m4a");
    }

    #[test]
    fn subtitle_codecs_map_to_encoders() {
        let args = request(TrackKind::Subtitle, "subrip", "/out/s.srt").args();
        let pos = args.iter().position(|a| a == "-c:s").unwrap();
        assert_eq!(args[pos + 1], "srt");

        let args = request(TrackKind::Subtitle, "hdmv_pgs_subtitle", "/out/s.sup").args();
        let pos = args.iter().position(|a| a == "-c:s").unwrap();
        assert_eq!(args[pos + 1], "copy");
    }

    #[test]
    fn map_uses_container_index() {
        let args = request(TrackKind::Video, "h264", "/out/v.mkv").args();
        let pos = args.iter().position(|a| a == "-map").unwrap();
        assert_eq!(args[pos + 1], "0:2");
        assert!(args.contains(&"-sn".to_string()));
    }

    #[test]
    fn output_names_include_language() {
        let stream = StreamInfo {
            index: 3,
            kind: TrackKind::Subtitle,
            codec: "subrip".into(),
            language: Some("eng".into()),
            title: None,
            default: false,
            forced: false,
            channels: None,
            width: None,
            height: None,
            duration_secs: None,
        };
        assert_eq!(output_file_name("movie", &stream), "movie.track3.eng.srt");

        let und = StreamInfo {
            language: Some("und".into()),
            kind: TrackKind::Audio,
            codec: "pcm_s16le".into(),
            ..stream
        };
        assert_eq!(output_file_name("movie", &und), "movie.track3.wav");
    }
}
