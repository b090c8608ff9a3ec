//! Sample still frames from a video for OCR.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// File name pattern of sampled frames.
const FRAME_PATTERN: &str = "frame_%06d.png";

/// Region of the frame to keep, as fractions of width and height.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropRegion {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl CropRegion {
    /// Whether the region lies within the unit square and is non-empty.
    pub fn is_valid(&self) -> bool {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        in_unit(self.x)
            && in_unit(self.y)
            && self.width > 0.0
            && self.height > 0.0
            && self.x + self.width <= 1.0 + f64::EPSILON
            && self.y + self.height <= 1.0 + f64::EPSILON
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameExtractRequest {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    /// Frames sampled per second.
    pub fps: f64,
    #[serde(default)]
    pub crop: Option<CropRegion>,
}

impl FrameExtractRequest {
    /// The `-vf` filter chain.
    pub fn filter(&self) -> String {
        let mut filters = vec![format!("fps={}", self.fps)];
        if let Some(r) = &self.crop {
            filters.push(format!(
                "crop=iw*{}:ih*{}:iw*{}:ih*{}",
                r.width, r.height, r.x, r.y
            ));
        }
        filters.join(",")
    }

    /// Build the ffmpeg argument list.
    pub fn args(&self) -> Vec<String> {
        vec![
            "-y".into(),
            "-i".into(),
            self.input.to_string_lossy().into_owned(),
            "-vf".into(),
            self.filter(),
            "-f".into(),
            "image2".into(),
            "-progress".into(),
            "pipe:1".into(),
            self.output_dir
                .join(FRAME_PATTERN)
                .to_string_lossy()
                .into_owned(),
        ]
    }
}

/// Sample frames into `req.output_dir` and return them in timestamp order.
pub async fn extract_frames(
    ffmpeg: &Path,
    req: &FrameExtractRequest,
    duration_secs: Option<f64>,
    cancel: &CancellationToken,
    on_progress: &(dyn Fn(f64) + Send + Sync),
) -> rx_core::Result<Vec<PathBuf>> {
    if req.fps <= 0.0 {
        return Err(rx_core::Error::Validation(format!(
            "frame rate must be positive (got {})",
            req.fps
        )));
    }
    std::fs::create_dir_all(&req.output_dir)?;
    tracing::info!(input = %req.input.display(), fps = req.fps, "sampling frames");
    super::run_ffmpeg_with_progress(ffmpeg, req.args(), duration_secs, cancel, on_progress)
        .await?;
    list_frames(&req.output_dir)
}

/// PNG files in `dir`, sorted by name (and therefore by frame number).
pub fn list_frames(dir: &Path) -> rx_core::Result<Vec<PathBuf>> {
    let mut frames: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "png"))
        .collect();
    frames.sort();
    Ok(frames)
}
