//! Multi-round repair of QA failures.
//!
//! Failed rows are retranslated through successively stronger models with
//! increasingly explicit prompts. Fixes are validated locally (token set,
//! length, non-empty, no human-review sentinel); whatever survives all
//! rounds unrepaired is escalated to a reviewer CSV and excluded from the
//! final output. Heartbeat, checkpoint, and DONE markers let external
//! watchdogs observe progress.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::codec::token_signature;
use crate::config::{PromptVariant, RepairConfig};
use crate::error::Result;
use crate::qa::hard::{QaError, Severity};
use crate::qa::soft::SoftQaIssue;
use crate::scheduler::{BatchScheduler, PromptBuilder, StepRequest, WorkRow};

/// Marker a model may emit when a fix is impossible within constraints.
pub const NEEDS_HUMAN_SENTINEL: &str = "[NEEDS_HUMAN]";

/// Which QA stage produced the tasks; decides the routing step and file
/// names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QaKind {
    Hard,
    Soft,
}

impl QaKind {
    pub fn step(&self) -> &'static str {
        match self {
            QaKind::Hard => "repair_hard",
            QaKind::Soft => "repair_soft",
        }
    }

    fn file_tag(&self) -> &'static str {
        match self {
            QaKind::Hard => "hard",
            QaKind::Soft => "soft",
        }
    }
}

/// A single issue attached to a repair task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairIssue {
    #[serde(rename = "type")]
    pub issue_type: String,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Repaired,
    Escalated,
}

/// One attempt recorded in a task's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairAttempt {
    pub round: usize,
    pub model: String,
    pub timestamp: String,
    pub attempted_fix: String,
    /// Names of the local checks that failed; empty on success.
    pub validation_result: Vec<String>,
    pub success: bool,
}

/// A row needing repair, with its full attempt history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairTask {
    pub string_id: String,
    pub source_text: String,
    pub current_translation: String,
    pub issues: Vec<RepairIssue>,
    pub severity: Severity,
    #[serde(default)]
    pub max_length_target: Option<u32>,
    #[serde(default)]
    pub history: Vec<RepairAttempt>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_translation: Option<String>,
}

impl RepairTask {
    pub fn new(
        string_id: impl Into<String>,
        source_text: impl Into<String>,
        current_translation: impl Into<String>,
        issues: Vec<RepairIssue>,
        severity: Severity,
        max_length_target: Option<u32>,
    ) -> Self {
        Self {
            string_id: string_id.into(),
            source_text: source_text.into(),
            current_translation: current_translation.into(),
            issues,
            severity,
            max_length_target,
            history: Vec::new(),
            status: TaskStatus::Pending,
            final_translation: None,
        }
    }

    /// Build a task from a hard-QA error row.
    pub fn from_qa_error(error: &QaError, source_text: &str, current_translation: &str) -> Self {
        Self::new(
            error.string_id.clone(),
            source_text,
            current_translation,
            vec![RepairIssue {
                issue_type: error.error_type.as_str().to_string(),
                detail: error.detail.clone(),
            }],
            error.severity,
            None,
        )
    }

    /// Build a task from a soft-QA issue list.
    pub fn from_soft_issues(
        string_id: &str,
        source_text: &str,
        current_translation: &str,
        issues: &[SoftQaIssue],
    ) -> Self {
        let severity = issues
            .iter()
            .map(|i| i.severity)
            .max_by_key(|s| match s {
                Severity::Minor => 0,
                Severity::Major => 1,
                Severity::Critical => 2,
            })
            .unwrap_or(Severity::Minor);
        Self::new(
            string_id,
            source_text,
            current_translation,
            issues
                .iter()
                .map(|i| RepairIssue {
                    issue_type: i.issue_type.clone(),
                    detail: i.detail.clone(),
                })
                .collect(),
            severity,
            None,
        )
    }

    /// Reviewer-facing hint derived from the issue mix.
    pub fn suggested_action(&self) -> &'static str {
        let types: Vec<&str> = self.issues.iter().map(|i| i.issue_type.as_str()).collect();
        if types.iter().any(|t| t.contains("token") || t.contains("placeholder")) {
            "Check placeholders: source and target must carry identical tokens"
        } else if types.iter().any(|t| t.contains("length")) {
            "Shorten the translation; prefer concise wording over omission"
        } else if types.iter().any(|t| t.contains("glossary") || t.contains("term")) {
            "Align terminology with the approved glossary"
        } else {
            "Review manually and improve quality in context"
        }
    }

    fn issues_summary(&self) -> String {
        self.issues
            .iter()
            .map(|i| format!("{}: {}", i.issue_type, i.detail))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn last_attempted_fix(&self) -> String {
        self.history
            .iter()
            .rev()
            .find(|a| !a.attempted_fix.is_empty())
            .map(|a| a.attempted_fix.clone())
            .unwrap_or_default()
    }
}

/// Counters for one repair run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairStats {
    pub total_tasks: usize,
    pub repaired: usize,
    pub escalated: usize,
    pub by_round: BTreeMap<usize, usize>,
}

/// Result of a full repair run.
pub struct RepairOutcome {
    /// `string_id -> fixed translation` for every repaired task.
    pub fixes: BTreeMap<String, String>,
    pub escalations: Vec<RepairTask>,
    pub stats: RepairStats,
}

/// The multi-round repair engine.
pub struct RepairLoop {
    scheduler: Arc<BatchScheduler>,
    config: RepairConfig,
    qa_kind: QaKind,
    output_dir: PathBuf,
}

impl RepairLoop {
    pub fn new(
        scheduler: Arc<BatchScheduler>,
        config: RepairConfig,
        qa_kind: QaKind,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            scheduler,
            config,
            qa_kind,
            output_dir: output_dir.into(),
        }
    }

    /// Run every pending task through up to `max_rounds` rounds, then
    /// escalate what is left.
    pub async fn run(&self, tasks: &mut [RepairTask]) -> Result<RepairOutcome> {
        let mut stats = RepairStats {
            total_tasks: tasks.len(),
            ..RepairStats::default()
        };
        std::fs::create_dir_all(&self.output_dir)?;
        self.write_heartbeat("starting");

        for round in 1..=self.config.max_rounds {
            let pending: Vec<usize> = tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.status == TaskStatus::Pending)
                .map(|(i, _)| i)
                .collect();
            if pending.is_empty() {
                break;
            }

            let round_config = self.config.round(round);
            let model_override = round_config.map(|r| r.model.clone());
            let variant = round_config.map(|r| r.prompt_variant).unwrap_or_default();

            tracing::info!(
                round,
                pending = pending.len(),
                model = model_override.as_deref().unwrap_or("(routing)"),
                "repair round starting"
            );
            self.write_heartbeat(&format!("round_{}", round));
            self.write_checkpoint(round, pending.len(), &stats)?;

            let results = self
                .run_round(tasks, &pending, variant, model_override.clone())
                .await?;

            for (idx, fix) in results {
                let task = &mut tasks[idx];
                let model = model_override.clone().unwrap_or_else(|| "(routing)".to_string());
                let failed_checks = validate_fix(task, &fix);
                let success = failed_checks.is_empty();
                task.history.push(RepairAttempt {
                    round,
                    model,
                    timestamp: chrono::Utc::now().to_rfc3339(),
                    attempted_fix: fix.clone(),
                    validation_result: failed_checks,
                    success,
                });
                if success {
                    task.status = TaskStatus::Repaired;
                    task.final_translation = Some(fix);
                    stats.repaired += 1;
                    *stats.by_round.entry(round).or_default() += 1;
                }
            }
        }

        let mut fixes = BTreeMap::new();
        let mut escalations = Vec::new();
        for task in tasks.iter_mut() {
            match task.status {
                TaskStatus::Repaired => {
                    if let Some(fix) = &task.final_translation {
                        fixes.insert(task.string_id.clone(), fix.clone());
                    }
                }
                TaskStatus::Pending => {
                    task.status = TaskStatus::Escalated;
                    stats.escalated += 1;
                    escalations.push(task.clone());
                }
                TaskStatus::Escalated => {
                    stats.escalated += 1;
                    escalations.push(task.clone());
                }
            }
        }

        if !escalations.is_empty() {
            self.write_escalation_csv(&escalations)?;
        }
        self.write_stats(&stats)?;
        self.write_done(&stats);

        tracing::info!(
            total = stats.total_tasks,
            repaired = stats.repaired,
            escalated = stats.escalated,
            "repair loop finished"
        );
        Ok(RepairOutcome {
            fixes,
            escalations,
            stats,
        })
    }

    /// One round: batch the pending tasks through the scheduler and map
    /// results back to task indices.
    async fn run_round(
        &self,
        tasks: &[RepairTask],
        pending: &[usize],
        variant: PromptVariant,
        model_override: Option<String>,
    ) -> Result<Vec<(usize, String)>> {
        let index_by_id: BTreeMap<String, usize> = pending
            .iter()
            .map(|&i| (tasks[i].string_id.clone(), i))
            .collect();

        let work_rows: Vec<WorkRow> = pending
            .iter()
            .map(|&i| WorkRow {
                string_id: tasks[i].string_id.clone(),
                source_text: tasks[i].source_text.clone(),
                max_length_target: tasks[i].max_length_target,
                is_long_text: false,
            })
            .collect();

        // Per-row context for the user prompt: issues, current text, and
        // (in later rounds) the failed attempts.
        let task_context: Arc<BTreeMap<String, serde_json::Value>> = Arc::new(
            pending
                .iter()
                .map(|&i| {
                    let task = &tasks[i];
                    let mut item = json!({
                        "current_translation": task.current_translation,
                        "issues": task.issues,
                        "max_length_target": task.max_length_target,
                    });
                    if variant != PromptVariant::Standard {
                        item["previous_attempts"] = json!(task
                            .history
                            .iter()
                            .map(|a| json!({
                                "round": a.round,
                                "attempted_fix": a.attempted_fix,
                                "failed_checks": a.validation_result,
                            }))
                            .collect::<Vec<_>>());
                    }
                    (task.string_id.clone(), item)
                })
                .collect(),
        );

        let system = system_prompt_for(variant);
        let system_prompt: PromptBuilder = Arc::new(move |_rows: &[WorkRow]| system.clone());
        let user_prompt: PromptBuilder = Arc::new(move |rows: &[WorkRow]| {
            let items: Vec<serde_json::Value> = rows
                .iter()
                .map(|r| {
                    let mut item = json!({"id": r.string_id, "source_text": r.source_text});
                    if let Some(ctx) = task_context.get(&r.string_id) {
                        if let (Some(obj), Some(ctx_obj)) = (item.as_object_mut(), ctx.as_object())
                        {
                            for (k, v) in ctx_obj {
                                obj.insert(k.clone(), v.clone());
                            }
                        }
                    }
                    item
                })
                .collect();
            serde_json::to_string_pretty(&items).unwrap_or_default()
        });

        let outcome = self
            .scheduler
            .run_step(StepRequest {
                step: self.qa_kind.step().to_string(),
                rows: work_rows,
                system_prompt,
                user_prompt,
                model_override,
                checkpoint_path: None,
            })
            .await?;

        Ok(outcome
            .results
            .into_iter()
            .filter_map(|r| index_by_id.get(&r.string_id).map(|&i| (i, r.text)))
            .collect())
    }

    fn write_heartbeat(&self, status: &str) {
        let line = format!("{} | {}\n", chrono::Utc::now().to_rfc3339(), status);
        let _ = std::fs::write(self.output_dir.join("repair_heartbeat.txt"), line);
    }

    fn write_checkpoint(&self, round: usize, pending: usize, stats: &RepairStats) -> Result<()> {
        let checkpoint = json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "round": round,
            "pending_tasks": pending,
            "stats": stats,
        });
        std::fs::write(
            self.output_dir.join("repair_checkpoint.json"),
            serde_json::to_string_pretty(&checkpoint)?,
        )?;
        Ok(())
    }

    fn write_done(&self, stats: &RepairStats) {
        let body = format!(
            "Completed at {}\nStats: {}\n",
            chrono::Utc::now().to_rfc3339(),
            serde_json::to_string(stats).unwrap_or_default()
        );
        let _ = std::fs::write(self.output_dir.join("repair_DONE"), body);
    }

    fn write_stats(&self, stats: &RepairStats) -> Result<()> {
        let path = self
            .output_dir
            .join(format!("repair_{}_stats.json", self.qa_kind.file_tag()));
        std::fs::write(path, serde_json::to_string_pretty(stats)?)?;
        Ok(())
    }

    /// Reviewer-oriented CSV of everything that needs a human.
    fn write_escalation_csv(&self, escalations: &[RepairTask]) -> Result<()> {
        let path = self.escalation_csv_path();
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record([
            "string_id",
            "source_text",
            "current_translation",
            "last_attempted_fix",
            "max_length_target",
            "severity",
            "issues_summary",
            "repair_attempts",
            "suggested_action",
        ])?;
        for task in escalations {
            let record: Vec<String> = vec![
                task.string_id.clone(),
                task.source_text.clone(),
                task.current_translation.clone(),
                task.last_attempted_fix(),
                task.max_length_target
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
                match task.severity {
                    Severity::Minor => "minor",
                    Severity::Major => "major",
                    Severity::Critical => "critical",
                }
                .to_string(),
                task.issues_summary(),
                task.history.len().to_string(),
                task.suggested_action().to_string(),
            ];
            writer.write_record(&record)?;
        }
        writer.flush()?;
        tracing::info!(path = %path.display(), count = escalations.len(), "escalation report written");
        Ok(())
    }

    pub fn escalation_csv_path(&self) -> PathBuf {
        self.output_dir
            .join(format!("escalated_{}_qa.csv", self.qa_kind.file_tag()))
    }
}

/// Local validation of a proposed fix. Returns the names of failed
/// checks; an empty list means the fix is accepted.
fn validate_fix(task: &RepairTask, fix: &str) -> Vec<String> {
    let mut failed = Vec::new();

    if fix.trim_start().starts_with(NEEDS_HUMAN_SENTINEL) {
        failed.push("needs_human".to_string());
        return failed;
    }
    if fix.trim().is_empty() {
        failed.push("empty".to_string());
        return failed;
    }
    if let Some(limit) = task.max_length_target.filter(|l| *l > 0) {
        if fix.chars().count() as u32 > limit {
            failed.push("length".to_string());
        }
    }
    if token_signature(&task.source_text) != token_signature(fix) {
        failed.push("token_set".to_string());
    }
    failed
}

fn system_prompt_for(variant: PromptVariant) -> String {
    let contract = "\n[Output Contract]\n\
        Return valid JSON: {\"items\": [{\"id\": \"...\", \"text\": \"...\"}]}.\n\
        Every input id MUST appear in the output with its corrected translation.\n";
    match variant {
        PromptVariant::Standard => format!(
            "You are a translation repair specialist. Each item lists the \
             issues found in its current translation. Fix them.\n\
             - Respect max_length_target when given.\n\
             - Preserve every ⟦PH_x⟧ / ⟦TAG_x⟧ token exactly as in the source.\n\
             - Keep the original tone.\n{}",
            contract
        ),
        PromptVariant::Detailed => format!(
            "You are an expert translation repair specialist. Previous repair \
             attempts failed; each item includes them. Analyze why they failed, \
             take a different approach, and verify constraints before answering.\n\
             - max_length_target is STRICT.\n\
             - Every ⟦PH_x⟧ / ⟦TAG_x⟧ token must match the source exactly.\n{}",
            contract
        ),
        PromptVariant::Expert => format!(
            "You are a senior localization expert handling difficult repair \
             cases. Each item carries the full failed history. Provide a \
             definitive fix. If no fix can satisfy the constraints, start the \
             text with {} followed by a short reason.\n\
             - max_length_target is STRICT.\n\
             - Tokens must match the source exactly.\n\
             - Professional game localization register.\n{}",
            NEEDS_HUMAN_SENTINEL, contract
        ),
    }
}
