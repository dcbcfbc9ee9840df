//! Cost aggregator: an offline reducer over the trace file.
//!
//! Uses endpoint-reported token usage where present and falls back to a
//! single documented heuristic (ceil(chars / 4)) where not. Totals are
//! folded per model, per step, and per (model, step) pair, then rendered
//! as a JSON summary and a Markdown report.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::pricing::PricingBook;
use crate::trace;

/// ceil(chars / 4): conservative for mixed CJK/Cyrillic text.
pub fn estimate_tokens(chars: u64) -> u64 {
    chars.div_ceil(4)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageTotals {
    pub total_calls: u64,
    pub usage_present_calls: u64,
    pub estimated_calls: u64,
    pub unknown_step_calls: u64,
    pub unknown_step_ratio: f64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub estimated_prompt_tokens: u64,
    pub estimated_completion_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CostTotals {
    pub total_cost: f64,
    pub cost_estimated_portion: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_per_1k_lines: Option<f64>,
}

/// One (model, step) bucket.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BreakdownEntry {
    pub model: String,
    pub step: String,
    pub calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost: f64,
    pub usage_present_calls: u64,
    pub estimated_calls: u64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PricingInfo {
    pub models_loaded: usize,
    pub warnings: Vec<String>,
    pub missing_models: Vec<String>,
}

/// The full aggregation result.
#[derive(Debug, Clone, Serialize)]
pub struct CostSummary {
    pub generated_at: String,
    pub currency: String,
    pub usage: UsageTotals,
    pub tokens: TokenTotals,
    pub cost: CostTotals,
    pub pricing: PricingInfo,
    /// Per (model, step), sorted by descending cost.
    pub breakdown: Vec<BreakdownEntry>,
    pub by_model: BTreeMap<String, f64>,
    pub by_step: BTreeMap<String, f64>,
}

/// Fold `llm_call` trace events into totals.
pub fn aggregate(
    events: &[Value],
    book: &PricingBook,
    output_lines: Option<u64>,
) -> CostSummary {
    let mut usage = UsageTotals::default();
    let mut tokens = TokenTotals::default();
    let mut cost = CostTotals::default();
    let mut buckets: BTreeMap<(String, String), BreakdownEntry> = BTreeMap::new();
    let mut latency_sums: BTreeMap<(String, String), u64> = BTreeMap::new();
    let mut missing: BTreeSet<String> = BTreeSet::new();
    let mut by_model: BTreeMap<String, f64> = BTreeMap::new();
    let mut by_step: BTreeMap<String, f64> = BTreeMap::new();
    let mut latency_sum_all = 0u64;

    for event in events {
        if event.get("type").and_then(Value::as_str) != Some("llm_call") {
            continue;
        }
        let model = event
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let step = event
            .get("step")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let latency_ms = event.get("latency_ms").and_then(Value::as_u64).unwrap_or(0);

        if step == "unknown" {
            usage.unknown_step_calls += 1;
        }

        let usage_obj = event.get("usage").filter(|u| u.is_object());
        let usage_present = usage_obj
            .map(|u| {
                u.get("prompt_tokens").is_some() || u.get("completion_tokens").is_some()
            })
            .unwrap_or(false);

        let (pt, ct) = if usage_present {
            let u = usage_obj.unwrap();
            (
                u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0),
                u.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0),
            )
        } else {
            let req_chars = event.get("req_chars").and_then(Value::as_u64).unwrap_or(0);
            let resp_chars = event.get("resp_chars").and_then(Value::as_u64).unwrap_or(0);
            (estimate_tokens(req_chars), estimate_tokens(resp_chars))
        };
        let tt = pt + ct;

        if !book.is_known(&model) {
            missing.insert(model.clone());
        }
        let call_cost = book.cost_for(&model, pt, ct);

        usage.total_calls += 1;
        latency_sum_all += latency_ms;
        tokens.prompt_tokens += pt;
        tokens.completion_tokens += ct;
        tokens.total_tokens += tt;
        cost.total_cost += call_cost;
        if usage_present {
            usage.usage_present_calls += 1;
        } else {
            usage.estimated_calls += 1;
            tokens.estimated_prompt_tokens += pt;
            tokens.estimated_completion_tokens += ct;
            cost.cost_estimated_portion += call_cost;
        }

        *by_model.entry(model.clone()).or_default() += call_cost;
        *by_step.entry(step.clone()).or_default() += call_cost;

        let key = (model.clone(), step.clone());
        let entry = buckets.entry(key.clone()).or_insert_with(|| BreakdownEntry {
            model,
            step,
            ..BreakdownEntry::default()
        });
        entry.calls += 1;
        entry.prompt_tokens += pt;
        entry.completion_tokens += ct;
        entry.total_tokens += tt;
        entry.cost += call_cost;
        entry.usage_present_calls += if usage_present { 1 } else { 0 };
        entry.estimated_calls += if usage_present { 0 } else { 1 };
        *latency_sums.entry(key).or_default() += latency_ms;
    }

    for (key, entry) in buckets.iter_mut() {
        let sum = latency_sums.get(key).copied().unwrap_or(0);
        entry.avg_latency_ms = if entry.calls > 0 {
            sum as f64 / entry.calls as f64
        } else {
            0.0
        };
    }

    usage.avg_latency_ms = if usage.total_calls > 0 {
        latency_sum_all as f64 / usage.total_calls as f64
    } else {
        0.0
    };
    usage.unknown_step_ratio = if usage.total_calls > 0 {
        usage.unknown_step_calls as f64 / usage.total_calls as f64
    } else {
        0.0
    };

    if let Some(lines) = output_lines.filter(|l| *l > 0) {
        cost.cost_per_1k_lines = Some(cost.total_cost / (lines as f64 / 1000.0));
    }

    let mut breakdown: Vec<BreakdownEntry> = buckets.into_values().collect();
    breakdown.sort_by(|a, b| b.cost.partial_cmp(&a.cost).unwrap_or(std::cmp::Ordering::Equal));

    CostSummary {
        generated_at: chrono::Utc::now().to_rfc3339(),
        currency: "USD".to_string(),
        usage,
        tokens,
        cost,
        pricing: PricingInfo {
            models_loaded: book.model_count(),
            warnings: book.warnings().to_vec(),
            missing_models: missing.into_iter().collect(),
        },
        breakdown,
        by_model,
        by_step,
    }
}

/// Aggregate straight from a trace file.
pub fn aggregate_file(
    trace_path: impl AsRef<Path>,
    book: &PricingBook,
    output_lines: Option<u64>,
) -> Result<CostSummary> {
    let events = trace::read_events(trace_path)?;
    Ok(aggregate(&events, book, output_lines))
}

/// Human-readable Markdown rendering of a summary.
pub fn render_markdown(summary: &CostSummary) -> String {
    let mut md = String::new();
    md.push_str("# Localization Cost Report\n\n");
    md.push_str(&format!("Generated: {}\n\n", summary.generated_at));

    md.push_str("## Summary\n\n");
    md.push_str("| Metric | Value |\n|--------|-------|\n");
    md.push_str(&format!("| Total LLM Calls | {} |\n", summary.usage.total_calls));
    md.push_str(&format!("| Avg Latency | {:.1} ms |\n", summary.usage.avg_latency_ms));
    md.push_str(&format!("| Total Tokens | {} |\n", summary.tokens.total_tokens));
    md.push_str(&format!("| Prompt Tokens | {} |\n", summary.tokens.prompt_tokens));
    md.push_str(&format!(
        "| Completion Tokens | {} |\n",
        summary.tokens.completion_tokens
    ));
    md.push_str(&format!(
        "| Total Cost | ${:.6} {} |\n",
        summary.cost.total_cost, summary.currency
    ));
    if let Some(per_1k) = summary.cost.cost_per_1k_lines {
        md.push_str(&format!("| Cost per 1k Lines | ${:.6} |\n", per_1k));
    }
    if summary.usage.estimated_calls > 0 {
        md.push_str(&format!(
            "| Estimated Calls | {} (no usage data, chars/4 heuristic) |\n",
            summary.usage.estimated_calls
        ));
    }
    md.push('\n');

    if !summary.pricing.missing_models.is_empty() {
        md.push_str("## Missing Pricing\n\nNo pricing data for:\n\n");
        for model in &summary.pricing.missing_models {
            md.push_str(&format!("- `{}`\n", model));
        }
        md.push('\n');
    }

    if !summary.pricing.warnings.is_empty() {
        md.push_str("## Pricing Warnings\n\n");
        for warning in summary.pricing.warnings.iter().take(20) {
            md.push_str(&format!("- {}\n", warning));
        }
        if summary.pricing.warnings.len() > 20 {
            md.push_str(&format!(
                "- ... ({} more)\n",
                summary.pricing.warnings.len() - 20
            ));
        }
        md.push('\n');
    }

    md.push_str("## Cost by Model & Step\n\n");
    md.push_str("| Model | Step | Calls | Tokens | Cost |\n");
    md.push_str("|-------|------|-------|--------|------|\n");
    for entry in summary.breakdown.iter().take(30) {
        md.push_str(&format!(
            "| {} | {} | {} | {} | ${:.6} |\n",
            entry.model, entry.step, entry.calls, entry.total_tokens, entry.cost
        ));
    }
    md.push('\n');

    if summary.usage.unknown_step_ratio > 0.01 {
        md.push_str("## Unknown Step Warning\n\n");
        md.push_str(&format!(
            "> **{}** LLM calls ({:.1}%) carry `step=unknown`. Every call \
             should be attributed to a pipeline step.\n\n",
            summary.usage.unknown_step_calls,
            summary.usage.unknown_step_ratio * 100.0
        ));
    }

    md
}

/// Write the JSON summary and Markdown report next to each other.
pub fn write_reports(
    summary: &CostSummary,
    json_path: impl AsRef<Path>,
    md_path: impl AsRef<Path>,
) -> Result<()> {
    for path in [json_path.as_ref(), md_path.as_ref()] {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(json_path, serde_json::to_string_pretty(summary)?)?;
    std::fs::write(md_path, render_markdown(summary))?;
    Ok(())
}
