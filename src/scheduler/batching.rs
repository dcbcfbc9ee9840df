//! Batch shaping: similar-length grouping and dynamic batch sizing.
//!
//! Similar-length texts have similar token counts, so grouping them makes
//! batch durations predictable. Dynamic sizing then clamps each batch to a
//! target wall-clock time and to the model's context window.

use std::collections::HashMap;
use std::collections::VecDeque;

use crate::config::ProcessingConfig;

use super::WorkRow;

/// Conservative chars-per-token heuristic for mixed CJK/Cyrillic text.
pub const CHARS_PER_TOKEN: usize = 4;

/// Estimate token count from text length.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() / CHARS_PER_TOKEN).max(1) as u64
}

/// Estimate the total prompt tokens for a batch.
pub fn estimate_batch_tokens(rows: &[WorkRow], system_prompt: &str) -> u64 {
    let mut total = estimate_tokens(system_prompt);
    for row in rows {
        total += estimate_tokens(&row.source_text);
        total += 8; // id + JSON scaffolding per item
    }
    total
}

/// Sort rows by source length and split where the length gap exceeds the
/// variance threshold. Group order follows ascending length.
pub fn group_similar_lengths(mut rows: Vec<WorkRow>, max_variance: usize) -> Vec<Vec<WorkRow>> {
    if rows.is_empty() {
        return Vec::new();
    }
    rows.sort_by_key(|r| r.source_text.len());

    let mut groups = Vec::new();
    let mut current: Vec<WorkRow> = Vec::new();
    let mut current_len = rows[0].source_text.len();
    for row in rows {
        let len = row.source_text.len();
        if current.is_empty() || len.abs_diff(current_len) <= max_variance {
            current.push(row);
        } else {
            groups.push(std::mem::take(&mut current));
            current_len = len;
            current.push(row);
        }
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

/// Batch size bounded by the target batch duration and the model's
/// context window minus a safety buffer.
pub fn dynamic_batch_size(
    model: &str,
    avg_text_len: usize,
    config: &ProcessingConfig,
    historical_latency_per_token: Option<f64>,
) -> usize {
    let context_window = config
        .model_context_windows
        .get(model)
        .copied()
        .unwrap_or(128_000);

    let latency_per_token = historical_latency_per_token
        .or_else(|| config.latency_model.get(model).copied())
        .unwrap_or(0.5);

    // Prompt + response, plus per-row overhead.
    let tokens_per_text = (avg_text_len / CHARS_PER_TOKEN) * 2 + 50;

    let target_tokens = config.target_batch_time_ms as f64 / latency_per_token.max(0.1);
    let time_based = (target_tokens / tokens_per_text.max(1) as f64) as usize;

    let available_context = context_window.saturating_sub(config.token_buffer) as usize;
    let context_based = available_context / tokens_per_text.max(1);

    time_based.min(context_based).clamp(1, 100)
}

/// Rolling latency-per-token history, per model. The median feeds
/// [`dynamic_batch_size`] once enough calls have landed.
#[derive(Debug, Default)]
pub struct LatencyHistory {
    samples: HashMap<String, VecDeque<f64>>,
}

impl LatencyHistory {
    const KEEP: usize = 100;

    pub fn record(&mut self, model: &str, latency_ms: u64, tokens: u64) {
        if tokens == 0 {
            return;
        }
        let per_token = latency_ms as f64 / tokens as f64;
        let samples = self.samples.entry(model.to_string()).or_default();
        samples.push_back(per_token);
        while samples.len() > Self::KEEP {
            samples.pop_front();
        }
    }

    /// Median latency per token for a model, if any samples exist.
    pub fn median(&self, model: &str) -> Option<f64> {
        let samples = self.samples.get(model)?;
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        Some(sorted[sorted.len() / 2])
    }
}
