//! Parser for ffmpeg's `-progress pipe:1` key/value stream.
//!
//! ffmpeg emits blocks of `key=value` lines terminated by
//! `progress=continue` or `progress=end`. Only the position is of interest
//! here; it is turned into a fraction of the known input duration.

/// Incremental state for one ffmpeg invocation.
#[derive(Debug, Clone)]
pub struct FfmpegProgress {
    duration_secs: Option<f64>,
    last_out_time_us: Option<i64>,
    last_fraction: f64,
}

impl FfmpegProgress {
    /// Track progress against an input of `duration_secs` (if known).
    pub fn new(duration_secs: Option<f64>) -> Self {
        Self {
            duration_secs: duration_secs.filter(|d| *d > 0.0),
            last_out_time_us: None,
            last_fraction: 0.0,
        }
    }

    /// Feed one stdout line. Returns the completed fraction in `[0, 1]` at
    /// the end of each block, never lower than a previously returned value.
    pub fn feed(&mut self, line: &str) -> Option<f64> {
        let line = line.trim();
        if let Some(val) = line
            .strip_prefix("out_time_us=")
            .or_else(|| line.strip_prefix("out_time_ms="))
        {
            // ffmpeg reports `N/A` before the first packet.
            if let Ok(us) = val.trim().parse::<i64>() {
                self.last_out_time_us = Some(us);
            }
            return None;
        }

        let state = line.strip_prefix("progress=")?;
        let fraction = if state == "end" {
            1.0
        } else {
            let dur = self.duration_secs?;
            let us = self.last_out_time_us?;
            (us.max(0) as f64 / 1_000_000.0 / dur).clamp(0.0, 1.0)
        };

        self.last_fraction = self.last_fraction.max(fraction);
        Some(self.last_fraction)
    }
}
