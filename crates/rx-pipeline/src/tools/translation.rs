//! Subtitle translation.
//!
//! Cues are split into `batch_count` contiguous batches that are sent one
//! after the other. A service that answers with fewer lines than it was sent
//! (typically an output token limit) ends the run with a truncated version
//! holding what was translated so far; retrying with more batches usually
//! gets the whole file through.

use std::sync::Arc;

use async_trait::async_trait;
use rx_av::validate_media_path;
use rx_core::config::TranslationConfig;
use rx_core::media::{extension_of, SUBTITLE_EXTENSIONS};
use rx_core::{Error, JobStatus, Result, ToolKind};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::executor::{ProcessOutput, RunContext, StageExecutor, StageSpec, SCAN_STAGE};
use crate::progress::WeightedUnits;
use crate::subtitles::{self, Cue, SubtitleFormat};
use crate::tokens;
use crate::version::UsageMetrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslationParams {
    pub batch_count: u32,
    pub target_language: String,
    /// Detected by the service when unset.
    pub source_language: Option<String>,
    pub model: Option<String>,
}

impl Default for TranslationParams {
    fn default() -> Self {
        Self::from(&TranslationConfig::default())
    }
}

impl From<&TranslationConfig> for TranslationParams {
    fn from(config: &TranslationConfig) -> Self {
        Self {
            batch_count: config.default_batch_count,
            target_language: config.target_language.clone(),
            source_language: None,
            model: config.model.clone(),
        }
    }
}

/// One batch sent to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationRequest {
    pub lines: Vec<String>,
    pub source_language: Option<String>,
    pub target_language: String,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranslationResponse {
    /// One entry per request line, in order. Fewer entries mean the answer
    /// was cut off.
    pub lines: Vec<String>,
    pub model: Option<String>,
    pub usage: Option<UsageMetrics>,
}

/// A translation service.
#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(
        &self,
        request: &TranslationRequest,
        cancel: &CancellationToken,
    ) -> Result<TranslationResponse>;
}

/// The parsed source file.
#[derive(Debug)]
pub struct SubtitleDocument {
    format: SubtitleFormat,
    cues: Vec<Cue>,
}

pub struct TranslationExecutor {
    translator: Arc<dyn Translator>,
    defaults: TranslationParams,
    max_batch_count: u32,
}

impl TranslationExecutor {
    pub fn new(translator: Arc<dyn Translator>, config: &TranslationConfig) -> Self {
        Self {
            translator,
            defaults: TranslationParams::from(config),
            max_batch_count: config.max_batch_count.max(1),
        }
    }

    pub fn max_batch_count(&self) -> u32 {
        self.max_batch_count
    }
}

/// Split `len` items into at most `batch_count` contiguous, near-equal
/// ranges.
fn batch_ranges(len: usize, batch_count: u32) -> Vec<std::ops::Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    let batches = (batch_count.max(1) as usize).min(len);
    let size = len.div_ceil(batches);
    (0..len)
        .step_by(size)
        .map(|start| start..(start + size).min(len))
        .collect()
}

fn add_usage(total: &mut Option<UsageMetrics>, usage: Option<UsageMetrics>) {
    let Some(usage) = usage else {
        return;
    };
    let total = total.get_or_insert_with(UsageMetrics::default);
    let sum = |a: Option<u64>, b: Option<u64>| match (a, b) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
    };
    total.input_tokens = sum(total.input_tokens, usage.input_tokens);
    total.output_tokens = sum(total.output_tokens, usage.output_tokens);
    total.duration_ms = sum(total.duration_ms, usage.duration_ms);
    if usage.model.is_some() {
        total.model = usage.model;
    }
}

#[async_trait]
impl StageExecutor for TranslationExecutor {
    type Metadata = SubtitleDocument;

    fn tool(&self) -> ToolKind {
        ToolKind::Translation
    }

    fn stages(&self) -> Vec<StageSpec> {
        vec![
            SCAN_STAGE,
            StageSpec::new("translate", JobStatus::Translating, 9.0),
        ]
    }

    fn default_params(&self) -> serde_json::Value {
        serde_json::to_value(&self.defaults).unwrap_or_else(|_| serde_json::json!({}))
    }

    async fn scan(&self, ctx: &RunContext) -> Result<SubtitleDocument> {
        let path = ctx.source().path();
        validate_media_path(path)?;
        let ext = extension_of(path);
        let format = SubtitleFormat::from_extension(&ext)
            .filter(|_| SUBTITLE_EXTENSIONS.contains(&ext.as_str()))
            .ok_or_else(|| Error::scan(format!("Not a translatable subtitle file: .{ext}")))?;

        let text = tokio::fs::read_to_string(path).await?;
        let cues = subtitles::parse(format, &text)?;
        if cues.is_empty() {
            return Err(Error::scan("No subtitle cues found"));
        }
        tracing::debug!(job_id = %ctx.job_id(), cues = cues.len(), "subtitles parsed");
        Ok(SubtitleDocument { format, cues })
    }

    async fn process(&self, ctx: &RunContext, doc: SubtitleDocument) -> Result<ProcessOutput> {
        let params: TranslationParams = ctx.params_as()?;
        let batch_count = params.batch_count.clamp(1, self.max_batch_count);
        let ranges = batch_ranges(doc.cues.len(), batch_count);
        let mut units = WeightedUnits::new(ranges.iter().map(|r| r.len() as f64).collect());

        let mut translated: Vec<Cue> = Vec::with_capacity(doc.cues.len());
        let mut usage: Option<UsageMetrics> = None;
        let mut model = params.model.clone();
        let mut truncated = None;
        let mut estimated_tokens = 0;

        for (i, range) in ranges.iter().enumerate() {
            ctx.check_cancelled()?;
            let batch = &doc.cues[range.clone()];
            let request = TranslationRequest {
                lines: batch.iter().map(|c| c.text.clone()).collect(),
                source_language: params.source_language.clone(),
                target_language: params.target_language.clone(),
                model: params.model.clone(),
            };
            let estimate = tokens::count_tokens(request.lines.join("\n")).await?;
            estimated_tokens += estimate;
            tracing::debug!(job_id = %ctx.job_id(), batch = i, lines = batch.len(), tokens = estimate, "sending batch");
            let response = self.translator.translate(&request, ctx.token()).await?;
            add_usage(&mut usage, response.usage);
            if response.model.is_some() {
                model = response.model;
            }

            let returned = response.lines.len();
            if returned > batch.len() {
                tracing::warn!(
                    job_id = %ctx.job_id(),
                    batch = i,
                    sent = batch.len(),
                    returned,
                    "service returned extra lines; ignoring them"
                );
            }
            translated.extend(batch.iter().zip(response.lines).map(|(cue, line)| Cue {
                text: line,
                ..cue.clone()
            }));

            if returned < batch.len() {
                let reason = format!(
                    "translation truncated: {} of {} lines returned (batch {} of {}); retry with more batches",
                    translated.len(),
                    doc.cues.len(),
                    i + 1,
                    ranges.len()
                );
                tracing::warn!(job_id = %ctx.job_id(), "{reason}");
                truncated = Some(reason);
                break;
            }
            ctx.report(units.complete(i));
        }

        let payload = serde_json::json!({
            "format": doc.format,
            "target_language": params.target_language,
            "batch_count": ranges.len(),
            "translated_lines": translated.len(),
            "total_lines": doc.cues.len(),
            "estimated_input_tokens": estimated_tokens,
            "subtitles": subtitles::format(doc.format, &translated),
            "cues": translated,
        });
        let mut output = ProcessOutput::new(payload);
        output.name_hint = model.clone();
        output.usage = usage.map(|mut u| {
            u.model = u.model.or(model);
            u
        });
        output.truncated = truncated;
        Ok(output)
    }
}
