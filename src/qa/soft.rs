//! Soft QA: LLM-backed stylistic review.
//!
//! A thin stage over the batch scheduler. The model reviews each
//! translation against the style guide and glossary summary and returns
//! per-row issue lists; rows with issues become repair tasks downstream.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::Result;
use crate::rows::Row;
use crate::scheduler::{BatchScheduler, PromptBuilder, StepRequest, WorkRow};

use super::hard::Severity;

/// One stylistic finding on a row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftQaIssue {
    #[serde(rename = "type")]
    pub issue_type: String,
    pub severity: Severity,
    #[serde(default)]
    pub detail: String,
}

/// Review results keyed by `string_id`; rows without findings are absent.
#[derive(Debug, Default)]
pub struct SoftQaOutcome {
    pub reviewed: usize,
    pub issues: BTreeMap<String, Vec<SoftQaIssue>>,
    pub failed_ids: Vec<String>,
}

impl SoftQaOutcome {
    pub fn rows_with_issues(&self) -> usize {
        self.issues.len()
    }

    pub fn major_count(&self) -> usize {
        self.issues
            .values()
            .flatten()
            .filter(|i| matches!(i.severity, Severity::Major | Severity::Critical))
            .count()
    }
}

fn build_system_prompt(style_guide: &str, glossary_summary: &str) -> String {
    format!(
        "You are a strict localization reviewer.\n\n\
         [Output Contract]\n\
         1. Output MUST be valid JSON: {{\"items\": [{{\"id\": \"...\", \"issues\": [...]}}]}}\n\
         2. Every input id MUST appear in the output.\n\
         3. Each issue is {{\"type\": \"...\", \"severity\": \"minor|major\", \"detail\": \"...\"}}.\n\
         4. A correct translation gets an empty issues list.\n\n\
         [Review Rules]\n\
         - Terminology must follow the glossary.\n\
         - Tokens like ⟦PH_1⟧ / ⟦TAG_1⟧ must be left as-is; never flag them.\n\
         - Flag awkward phrasing, wrong register, and meaning drift.\n\n\
         Glossary summary:\n{}\n\nStyle guide:\n{}\n",
        glossary_summary, style_guide
    )
}

/// Run the review over rows that already carry a translation.
pub async fn run_soft_qa(
    scheduler: &Arc<BatchScheduler>,
    rows: &[Row],
    style_guide: &str,
    glossary_summary: &str,
    checkpoint_path: Option<PathBuf>,
) -> Result<SoftQaOutcome> {
    let reviewable: Vec<&Row> = rows
        .iter()
        .filter(|r| !r.target_text.trim().is_empty())
        .collect();

    let work_rows: Vec<WorkRow> = reviewable
        .iter()
        .map(|r| WorkRow {
            string_id: r.string_id.clone(),
            source_text: if r.tokenized_text.is_empty() {
                r.source_text.clone()
            } else {
                r.tokenized_text.clone()
            },
            max_length_target: r.max_length_target,
            is_long_text: r.is_long_text,
        })
        .collect();

    let translations: Arc<BTreeMap<String, String>> = Arc::new(
        reviewable
            .iter()
            .map(|r| (r.string_id.clone(), r.target_text.clone()))
            .collect(),
    );

    let system = build_system_prompt(style_guide, glossary_summary);
    let system_prompt: PromptBuilder = Arc::new(move |_rows: &[WorkRow]| system.clone());
    let user_prompt: PromptBuilder = Arc::new(move |rows: &[WorkRow]| {
        let items: Vec<serde_json::Value> = rows
            .iter()
            .map(|r| {
                json!({
                    "id": r.string_id,
                    "source_text": r.source_text,
                    "target_text": translations.get(&r.string_id).cloned().unwrap_or_default(),
                })
            })
            .collect();
        serde_json::to_string_pretty(&items).unwrap_or_default()
    });

    let outcome = scheduler
        .run_step(StepRequest {
            step: "soft_qa".to_string(),
            rows: work_rows,
            system_prompt,
            user_prompt,
            model_override: None,
            checkpoint_path,
        })
        .await?;

    let mut result = SoftQaOutcome {
        reviewed: outcome.results.len(),
        issues: BTreeMap::new(),
        failed_ids: outcome.failed_ids,
    };
    for row_result in outcome.results {
        // The payload is the serialized issues array; anything unreadable
        // counts as a clean review rather than a pipeline failure.
        let issues: Vec<SoftQaIssue> =
            serde_json::from_str(&row_result.text).unwrap_or_default();
        if !issues.is_empty() {
            result.issues.insert(row_result.string_id, issues);
        }
    }
    Ok(result)
}
