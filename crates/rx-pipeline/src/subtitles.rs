//! Subtitle cues: SRT/WebVTT parsing and formatting, and turning per-frame
//! OCR text into cues.

use std::collections::HashMap;
use std::fmt::Write as _;

use rx_core::config::OcrCleanupConfig;
use rx_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// One timed subtitle line (possibly multi-line text).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cue {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
    /// Recognition confidence for OCR cues.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl Cue {
    pub fn new(start_ms: u64, end_ms: u64, text: impl Into<String>) -> Self {
        Self {
            start_ms,
            end_ms,
            text: text.into(),
            confidence: None,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// Subtitle file syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtitleFormat {
    Srt,
    Vtt,
}

impl SubtitleFormat {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "srt" => Some(Self::Srt),
            "vtt" => Some(Self::Vtt),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Srt => "srt",
            Self::Vtt => "vtt",
        }
    }
}

/// Parse subtitle text in the given syntax.
pub fn parse(format: SubtitleFormat, input: &str) -> Result<Vec<Cue>> {
    match format {
        SubtitleFormat::Srt => parse_srt(input),
        SubtitleFormat::Vtt => parse_vtt(input),
    }
}

pub fn format(format: SubtitleFormat, cues: &[Cue]) -> String {
    match format {
        SubtitleFormat::Srt => to_srt(cues),
        SubtitleFormat::Vtt => to_vtt(cues),
    }
}

/// Parse SubRip. Blocks without a timing line are skipped.
pub fn parse_srt(input: &str) -> Result<Vec<Cue>> {
    parse_blocks(input.trim_start_matches('\u{feff}'), false)
}

/// Parse WebVTT. The `WEBVTT` header is required; NOTE, STYLE and REGION
/// blocks are skipped.
pub fn parse_vtt(input: &str) -> Result<Vec<Cue>> {
    let input = input.trim_start_matches('\u{feff}');
    if !input.trim_start().starts_with("WEBVTT") {
        return Err(Error::scan("missing WEBVTT header"));
    }
    parse_blocks(input, true)
}

fn parse_blocks(input: &str, vtt: bool) -> Result<Vec<Cue>> {
    let normalized = input.replace("\r\n", "\n").replace('\r', "\n");
    let mut cues = Vec::new();

    for block in normalized.split("\n\n") {
        let mut lines = block.lines().filter(|l| !l.trim().is_empty()).peekable();
        let Some(first) = lines.peek().copied() else {
            continue;
        };
        if vtt && ["WEBVTT", "NOTE", "STYLE", "REGION"].iter().any(|k| first.starts_with(k)) {
            continue;
        }
        // Skip the counter or cue identifier.
        if !first.contains("-->") {
            lines.next();
        }
        let Some(timing) = lines.next() else {
            continue;
        };
        let Some((start, end)) = parse_timing(timing) else {
            if cues.is_empty() && !vtt {
                return Err(Error::scan(format!("invalid timing line: {timing}")));
            }
            tracing::debug!("skipping cue with invalid timing: {timing}");
            continue;
        };
        let text = lines.collect::<Vec<_>>().join("\n");
        cues.push(Cue::new(start, end, text));
    }

    Ok(cues)
}

fn parse_timing(line: &str) -> Option<(u64, u64)> {
    let (start, rest) = line.split_once("-->")?;
    // WebVTT cue settings follow the end time.
    let end = rest.split_whitespace().next()?;
    Some((parse_timestamp(start.trim())?, parse_timestamp(end)?))
}

/// `HH:MM:SS,mmm`, `HH:MM:SS.mmm` or `MM:SS.mmm` into milliseconds.
pub fn parse_timestamp(s: &str) -> Option<u64> {
    let s = s.replace(',', ".");
    let (clock, millis) = s.split_once('.').unwrap_or((s.as_str(), "0"));
    let parts: Vec<u64> = clock
        .split(':')
        .map(|p| p.trim().parse().ok())
        .collect::<Option<_>>()?;
    let (h, m, sec) = match parts.as_slice() {
        [h, m, s] => (*h, *m, *s),
        [m, s] => (0, *m, *s),
        _ => return None,
    };
    if m >= 60 || sec >= 60 {
        return None;
    }
    let digits: String = millis.chars().take(3).collect();
    let ms = format!("{digits:0<3}").parse::<u64>().ok()?;
    Some(((h * 60 + m) * 60 + sec) * 1000 + ms)
}

fn timestamp(ms: u64, sep: char) -> String {
    let (h, rest) = (ms / 3_600_000, ms % 3_600_000);
    let (m, rest) = (rest / 60_000, rest % 60_000);
    let (s, ms) = (rest / 1000, rest % 1000);
    format!("{h:02}:{m:02}:{s:02}{sep}{ms:03}")
}

pub fn to_srt(cues: &[Cue]) -> String {
    let mut out = String::new();
    for (i, cue) in cues.iter().enumerate() {
        let _ = write!(
            out,
            "{}\n{} --> {}\n{}\n\n",
            i + 1,
            timestamp(cue.start_ms, ','),
            timestamp(cue.end_ms, ','),
            cue.text
        );
    }
    out
}

pub fn to_vtt(cues: &[Cue]) -> String {
    let mut out = String::from("WEBVTT\n\n");
    for cue in cues {
        let _ = write!(
            out,
            "{} --> {}\n{}\n\n",
            timestamp(cue.start_ms, '.'),
            timestamp(cue.end_ms, '.'),
            cue.text
        );
    }
    out
}

/// Cue text only, one cue per line.
pub fn to_txt(cues: &[Cue]) -> String {
    cues.iter()
        .map(|c| c.text.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// OCR cue building
// ---------------------------------------------------------------------------

/// Text recognised on one sampled frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameText {
    pub frame_index: u32,
    pub time_ms: u64,
    pub text: String,
    pub confidence: f64,
}

/// Similarity bounds applied when merging is enabled.
const MIN_SIMILARITY: f64 = 0.80;
const MAX_SIMILARITY: f64 = 0.98;
/// Below this many characters only a single-character difference merges.
const SHORT_TEXT_CHARS: usize = 6;
const EPS: f64 = 1e-9;

/// Whitespace runs collapsed to single spaces, trimmed.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_edge_punctuation(c: char) -> bool {
    c.is_whitespace()
        || c.is_ascii_punctuation()
        || "，。！？：；、“”‘’《》（）【】—…～·".contains(c)
}

/// Lowercased text without surrounding punctuation, used to compare frames.
pub fn comparison_key(text: &str) -> String {
    collapse_whitespace(text)
        .trim_matches(is_edge_punctuation)
        .to_lowercase()
}

/// Edit distance between `a` and `b`, or `None` once it exceeds `limit`.
pub fn bounded_levenshtein(a: &[char], b: &[char], limit: usize) -> Option<usize> {
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if long.len() - short.len() > limit {
        return None;
    }

    let mut prev: Vec<usize> = (0..=short.len()).collect();
    let mut row = vec![0; short.len() + 1];
    for (j, lc) in long.iter().enumerate() {
        row[0] = j + 1;
        let mut best = row[0];
        for (i, sc) in short.iter().enumerate() {
            let substitute = prev[i] + usize::from(sc != lc);
            row[i + 1] = substitute.min(prev[i + 1] + 1).min(row[i] + 1);
            best = best.min(row[i + 1]);
        }
        if best > limit {
            return None;
        }
        std::mem::swap(&mut prev, &mut row);
    }

    let distance = prev[short.len()];
    (distance <= limit).then_some(distance)
}

/// Whether two comparison keys name the same on-screen text.
///
/// Short texts merge only with equal length and at most one differing
/// character; longer ones need `1 - distance / len >= threshold`.
pub fn texts_similar(a: &str, b: &str, threshold: f64) -> bool {
    if a == b {
        return true;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());

    if a.len().min(b.len()) < SHORT_TEXT_CHARS {
        return a.len() == b.len() && bounded_levenshtein(&a, &b, 1).is_some();
    }

    let threshold = if threshold.is_nan() {
        0.0
    } else {
        threshold.clamp(0.0, 1.0)
    };
    let limit = ((1.0 - threshold) * longest as f64).ceil() as usize;
    if limit == 0 {
        return false;
    }
    bounded_levenshtein(&a, &b, limit)
        .is_some_and(|d| 1.0 - d as f64 / longest as f64 + EPS >= threshold)
}

fn looks_like_domain(token: &str) -> bool {
    let token = token.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '.' && c != '-');
    let labels: Vec<&str> = token.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return false;
    }
    let tld = labels[labels.len() - 1];
    let name = labels[labels.len() - 2];
    (2..=6).contains(&tld.len())
        && tld.chars().all(|c| c.is_ascii_alphabetic())
        && name.len() >= 2
        && name.chars().any(|c| c.is_ascii_alphabetic())
}

/// Watermarks and channel links burnt into video.
pub fn looks_url_like(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    const MARKERS: &[&str] = &[
        "http://", "https://", "www.", ".com", ".net", ".org", ".co", ".io", ".me", ".tv", ".app",
    ];
    MARKERS.iter().any(|m| lower.contains(m)) || lower.split_whitespace().any(looks_like_domain)
}

#[derive(Debug, Clone)]
struct Reading {
    key: String,
    text: String,
    confidence: f64,
}

/// Consecutive frames showing the same text.
#[derive(Debug, Clone)]
struct Run {
    start_ms: u64,
    last_ms: u64,
    last_frame: u32,
    anchor_key: String,
    anchor_confidence: f64,
    readings: Vec<Reading>,
}

impl Run {
    fn start(frame: &FrameText, reading: Reading) -> Self {
        Self {
            start_ms: frame.time_ms,
            last_ms: frame.time_ms,
            last_frame: frame.frame_index,
            anchor_key: reading.key.clone(),
            anchor_confidence: reading.confidence,
            readings: vec![reading],
        }
    }

    fn extend(&mut self, frame: &FrameText, reading: Reading) {
        self.last_ms = frame.time_ms;
        self.last_frame = frame.frame_index;
        if reading.confidence > self.anchor_confidence + EPS {
            self.anchor_key = reading.key.clone();
            self.anchor_confidence = reading.confidence;
        }
        self.readings.push(reading);
    }

    /// The reading with the best confidence; ties go to the key seen most.
    fn best_reading(&self) -> Option<(&str, f64)> {
        let mut by_key: HashMap<&str, (usize, &Reading)> = HashMap::new();
        for r in &self.readings {
            let entry = by_key.entry(r.key.as_str()).or_insert((0, r));
            entry.0 += 1;
            if r.confidence > entry.1.confidence {
                entry.1 = r;
            }
        }
        by_key
            .into_values()
            .max_by(|(ca, a), (cb, b)| {
                if (a.confidence - b.confidence).abs() <= EPS {
                    ca.cmp(cb)
                } else {
                    a.confidence.total_cmp(&b.confidence)
                }
            })
            .map(|(_, r)| (r.text.as_str(), r.confidence))
    }

    fn into_cue(self, frame_ms: f64) -> Option<Cue> {
        let (text, confidence) = self.best_reading()?;
        let mut end_ms = ((self.last_frame as f64 + 1.0) * frame_ms).round() as u64;
        if end_ms <= self.start_ms {
            end_ms = self.start_ms + 1;
        }
        Some(Cue {
            start_ms: self.start_ms,
            end_ms,
            text: text.to_string(),
            confidence: Some(confidence),
        })
    }
}

/// Turn per-frame OCR text into subtitle cues.
///
/// Frames below `min_confidence` or with empty text break a run only once
/// the gap since its last frame exceeds `max_gap_ms`. Adjacent cues that are
/// similar (or short and loosely similar) are merged afterwards.
pub fn build_ocr_cues(
    frames: &[FrameText],
    fps: f64,
    min_confidence: f64,
    cleanup: &OcrCleanupConfig,
) -> Result<Vec<Cue>> {
    if fps <= 0.0 || !fps.is_finite() {
        return Err(Error::Validation(format!("fps must be greater than 0 (got {fps})")));
    }
    let threshold = if cleanup.merge_similar {
        cleanup.similarity_threshold.clamp(MIN_SIMILARITY, MAX_SIMILARITY)
    } else {
        1.0
    };
    let min_confidence = if min_confidence.is_nan() {
        0.0
    } else {
        min_confidence.clamp(0.0, 1.0)
    };

    let mut runs: Vec<Run> = Vec::new();
    let mut current: Option<Run> = None;

    for frame in frames {
        let text = collapse_whitespace(&frame.text);
        let key = comparison_key(&text);
        let gap_exceeded = current
            .as_ref()
            .is_some_and(|run| frame.time_ms.saturating_sub(run.last_ms) > cleanup.max_gap_ms);

        if frame.confidence < min_confidence || key.is_empty() {
            if gap_exceeded {
                runs.extend(current.take());
            }
            continue;
        }

        let reading = Reading {
            key,
            text,
            confidence: frame.confidence,
        };
        let continues = !gap_exceeded
            && current.as_ref().is_some_and(|run| {
                run.anchor_key == reading.key
                    || (cleanup.merge_similar
                        && texts_similar(&run.anchor_key, &reading.key, threshold))
            });
        match current.as_mut() {
            Some(run) if continues => run.extend(frame, reading),
            _ => {
                runs.extend(current.take());
                current = Some(Run::start(frame, reading));
            }
        }
    }
    runs.extend(current);

    let frame_ms = 1000.0 / fps;
    let mut cues: Vec<Cue> = runs.into_iter().filter_map(|r| r.into_cue(frame_ms)).collect();

    if cleanup.filter_url_like {
        cues.retain(|c| !looks_url_like(&c.text));
    }
    if cleanup.merge_similar {
        cues = merge_adjacent(cues, threshold, cleanup);
    }
    Ok(cues)
}

fn merge_adjacent(cues: Vec<Cue>, threshold: f64, cleanup: &OcrCleanupConfig) -> Vec<Cue> {
    let mut merged: Vec<Cue> = Vec::with_capacity(cues.len());
    for cue in cues {
        if let Some(prev) = merged.last_mut() {
            let gap = cue.start_ms.saturating_sub(prev.end_ms);
            let (pk, ck) = (comparison_key(&prev.text), comparison_key(&cue.text));
            let short = prev.duration_ms() < cleanup.min_cue_duration_ms
                || cue.duration_ms() < cleanup.min_cue_duration_ms;
            if gap <= cleanup.max_gap_ms
                && (texts_similar(&pk, &ck, threshold)
                    || (short && texts_similar(&pk, &ck, MIN_SIMILARITY)))
            {
                let (pc, cc) = (prev.confidence.unwrap_or(0.0), cue.confidence.unwrap_or(0.0));
                prev.end_ms = prev.end_ms.max(cue.end_ms);
                if cc > pc + EPS || ((cc - pc).abs() <= EPS && cue.text.len() > prev.text.len()) {
                    prev.text = cue.text;
                }
                prev.confidence = Some(pc.max(cc));
                continue;
            }
        }
        merged.push(cue);
    }
    merged
}
