//! Pipeline orchestrator: wires the stages together and owns the run
//! lifecycle.
//!
//! `CSV → freeze → {cache || router+scheduler→LLM} → hard QA → repair ↺ →
//! rehydrate → CSV`, with checkpoints under the run's output directory so
//! an interrupted run resumes where it stopped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheStore;
use crate::codec::{
    detect_unbalanced, segmenter_for, CompiledSchema, PlaceholderFreezer, PlaceholderMap,
    Rehydrator,
};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::glossary::GlossaryIndex;
use crate::qa::hard::{early_balance_report, HardQaValidator, QaReport};
use crate::qa::soft::{run_soft_qa, SoftQaOutcome};
use crate::repair::{QaKind, RepairLoop, RepairOutcome, RepairTask};
use crate::router::ModelRouter;
use crate::rows::{read_rows, write_rows, Row, RowFile};
use crate::scheduler::{BatchScheduler, PromptBuilder, StepRequest, WorkRow};
use crate::trace::TraceSink;
use crate::transport::LlmTransport;

/// Terminal status of a full run, mapped to the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// No hard-QA errors after repair.
    Success,
    /// Errors survived the repair loop (best-effort output still written).
    QaFailed,
}

/// What `freeze` produced.
#[derive(Debug)]
pub struct FreezeOutcome {
    pub rows: usize,
    pub ph_count: u64,
    pub tag_count: u64,
    pub sanity_warnings: usize,
}

/// What `translate` produced.
#[derive(Debug)]
pub struct TranslateOutcome {
    pub translated: usize,
    pub cache_hits: usize,
    pub failed_ids: Vec<String>,
}

/// What `rehydrate` produced.
#[derive(Debug)]
pub struct RehydrateOutcome {
    pub rows: usize,
    pub tokens_restored: u64,
}

/// All loaded collaborators for one run.
pub struct Pipeline {
    pub config: PipelineConfig,
    schema: CompiledSchema,
    glossary: Arc<GlossaryIndex>,
    scheduler: Arc<BatchScheduler>,
    output_dir: PathBuf,
    source_lang: String,
    style_guide: String,
}

impl Pipeline {
    /// Assemble a pipeline from loaded parts. The transport is injected
    /// so tests can substitute a scripted fake.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        schema: CompiledSchema,
        glossary: GlossaryIndex,
        router: ModelRouter,
        transport: Arc<dyn LlmTransport>,
        trace: Arc<TraceSink>,
        output_dir: impl Into<PathBuf>,
        style_guide: String,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;

        let cache = if config.cache.enabled {
            match CacheStore::open(config.cache.clone()) {
                Ok(store) => Some(Arc::new(store)),
                Err(e) => {
                    tracing::warn!(error = %e, "cache unavailable, continuing without it");
                    None
                }
            }
        } else {
            None
        };

        let glossary = Arc::new(glossary);
        let env_default_model = std::env::var("LLM_MODEL")
            .ok()
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());

        let scheduler = Arc::new(BatchScheduler::new(
            transport,
            Arc::new(router),
            cache,
            trace,
            config.processing.clone(),
            config.batch.clone(),
            env_default_model,
            glossary.digest().to_string(),
            cancel,
        ));

        let source_lang = if config.source_lang.is_empty() {
            "zh-CN".to_string()
        } else {
            config.source_lang.clone()
        };

        Ok(Self {
            config,
            schema,
            glossary,
            scheduler,
            output_dir,
            source_lang,
            style_guide,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn checkpoint_path(&self, step: &str) -> PathBuf {
        self.output_dir.join(format!("checkpoint_{}.json", step))
    }

    /// Freeze an input CSV into a draft CSV plus a placeholder map.
    pub fn freeze_file(
        &self,
        input: impl AsRef<Path>,
        draft_out: impl AsRef<Path>,
        map_out: impl AsRef<Path>,
    ) -> Result<FreezeOutcome> {
        let input = input.as_ref();
        let mut file = read_rows(input)?;

        let segmenter = segmenter_for(&self.source_lang);
        let mut freezer = PlaceholderFreezer::new(&self.schema);
        let mut sanity: Vec<(usize, String, Vec<&'static str>, String)> = Vec::new();

        for (idx, row) in file.rows.iter_mut().enumerate() {
            let row_num = idx + 2;
            let segmented = segmenter.segment(&row.source_text, &self.source_lang);

            let issues = detect_unbalanced(&segmented);
            if !issues.is_empty() {
                sanity.push((row_num, row.string_id.clone(), issues, row.source_text.clone()));
            }

            let (tokenized, local) = freezer.freeze_text(&segmented);
            if !local.is_empty() {
                tracing::debug!(string_id = %row.string_id, frozen = local.len(), "froze placeholders");
            }
            row.tokenized_text = tokenized;
        }

        file.tokenized_column = Some(file.tokenized_column_name());
        write_rows(draft_out, &file)?;

        let stats = freezer.stats();
        let map = PlaceholderMap::from_pass(
            freezer.mappings().clone(),
            stats.ph_count,
            stats.tag_count,
            Some(input.display().to_string()),
        );
        map.save(map_out)?;

        if !sanity.is_empty() {
            let report = early_balance_report(
                file.rows.len(),
                &sanity,
                Some(input.display().to_string()),
            );
            report.save(self.output_dir.join("qa_early_report.json"))?;
            tracing::warn!(count = sanity.len(), "source balance issues found");
        }

        Ok(FreezeOutcome {
            rows: file.rows.len(),
            ph_count: stats.ph_count,
            tag_count: stats.tag_count,
            sanity_warnings: sanity.len(),
        })
    }

    fn translate_prompts(&self, glossary: Arc<GlossaryIndex>) -> (PromptBuilder, PromptBuilder) {
        let style_guide = self.style_guide.clone();
        let system: PromptBuilder = Arc::new(move |rows: &[WorkRow]| {
            let mut constraints = String::new();
            for row in rows {
                if let Some(max_len) = row.max_length_target.filter(|l| *l > 0) {
                    constraints.push_str(&format!(
                        "- Row {}: max {} chars\n",
                        row.string_id, max_len
                    ));
                }
            }
            let constraint_section = if constraints.is_empty() {
                String::new()
            } else {
                format!(
                    "\n[Length Constraints (Mandatory)]\n\
                     Each translation MUST NOT exceed its limit:\n{}\
                     If too long: use abbreviations or synonyms but preserve meaning.\n",
                    constraints
                )
            };
            format!(
                "You are a rigorous game localization translator.\n\n\
                 [Output Contract]\n\
                 1. Output MUST be valid JSON: {{\"items\": [{{\"id\": \"...\", \"target_text\": \"...\"}}]}}\n\
                 2. Every input id MUST appear in the output.\n\n\
                 [Translation Rules]\n\
                 - Glossary terms must be used consistently.\n\
                 - Tokens ⟦PH_xx⟧ / ⟦TAG_xx⟧ must be preserved byte-exact.\n\
                 {}\n\
                 Glossary summary:\n{}\n\n\
                 Style guide:\n{}\n",
                constraint_section,
                glossary.summary(50),
                style_guide
            )
        });

        let user: PromptBuilder = Arc::new(|rows: &[WorkRow]| {
            let items: Vec<serde_json::Value> = rows
                .iter()
                .map(|r| json!({"id": r.string_id, "source_text": r.source_text}))
                .collect();
            serde_json::to_string_pretty(&items).unwrap_or_default()
        });
        (system, user)
    }

    /// Translate a draft CSV, writing the translated CSV.
    pub async fn translate_file(
        &self,
        draft: impl AsRef<Path>,
        out: impl AsRef<Path>,
        force_model: Option<String>,
    ) -> Result<TranslateOutcome> {
        let mut file = read_rows(draft)?;

        let work_rows: Vec<WorkRow> = file
            .rows
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

        let (system, user) = self.translate_prompts(Arc::clone(&self.glossary));
        let outcome = self
            .scheduler
            .run_step(StepRequest {
                step: "translate".to_string(),
                rows: work_rows,
                system_prompt: system,
                user_prompt: user,
                model_override: force_model,
                checkpoint_path: Some(self.checkpoint_path("translate")),
            })
            .await?;

        let translations: BTreeMap<String, String> = outcome
            .results
            .iter()
            .map(|r| (r.string_id.clone(), r.text.clone()))
            .collect();
        for row in file.rows.iter_mut() {
            if let Some(translation) = translations.get(&row.string_id) {
                row.target_text = translation.clone();
            }
        }

        if file.target_column.is_none() {
            file.target_column = Some("target_text".to_string());
        }
        write_rows(out, &file)?;

        Ok(TranslateOutcome {
            translated: outcome.results.len(),
            cache_hits: outcome.cache_hits,
            failed_ids: outcome.failed_ids,
        })
    }

    /// Validate a translated CSV against the schema and map.
    pub fn hard_qa_file(
        &self,
        translated: impl AsRef<Path>,
        map_path: impl AsRef<Path>,
        report_out: impl AsRef<Path>,
    ) -> Result<QaReport> {
        let translated = translated.as_ref();
        let file = read_rows(translated)?;
        let map = PlaceholderMap::load(map_path)?;
        let report = self.hard_qa_rows(&file.rows, &map, Some(translated.display().to_string()));
        report.save(report_out)?;
        Ok(report)
    }

    fn hard_qa_rows(
        &self,
        rows: &[Row],
        map: &PlaceholderMap,
        input_file: Option<String>,
    ) -> QaReport {
        let mut validator = HardQaValidator::new(&self.schema, Some(map));
        validator.check_cjk_residue = self.source_lang.starts_with("zh");
        validator.validate(rows, input_file)
    }

    /// Run the LLM stylistic review, writing repair tasks as JSONL.
    pub async fn soft_qa_file(
        &self,
        translated: impl AsRef<Path>,
        tasks_out: impl AsRef<Path>,
    ) -> Result<SoftQaOutcome> {
        let file = read_rows(translated)?;
        let outcome = run_soft_qa(
            &self.scheduler,
            &file.rows,
            &self.style_guide,
            &self.glossary.summary(50),
            Some(self.checkpoint_path("soft_qa")),
        )
        .await?;

        let tasks_out = tasks_out.as_ref();
        if let Some(parent) = tasks_out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut lines = String::new();
        for row in &file.rows {
            if let Some(issues) = outcome.issues.get(&row.string_id) {
                let source = if row.tokenized_text.is_empty() {
                    &row.source_text
                } else {
                    &row.tokenized_text
                };
                let task = RepairTask::from_soft_issues(
                    &row.string_id,
                    source,
                    &row.target_text,
                    issues,
                );
                lines.push_str(&serde_json::to_string(&task)?);
                lines.push('\n');
            }
        }
        std::fs::write(tasks_out, lines)?;
        Ok(outcome)
    }

    /// Build repair tasks from a hard-QA report, grouping errors by row.
    fn tasks_from_report(report: &QaReport, rows: &[Row]) -> Vec<RepairTask> {
        let by_id: BTreeMap<&str, &Row> =
            rows.iter().map(|r| (r.string_id.as_str(), r)).collect();
        let mut tasks: BTreeMap<String, RepairTask> = BTreeMap::new();
        for error in &report.errors {
            let Some(row) = by_id.get(error.string_id.as_str()) else {
                continue;
            };
            let source = if row.tokenized_text.is_empty() {
                row.source_text.as_str()
            } else {
                row.tokenized_text.as_str()
            };
            tasks
                .entry(error.string_id.clone())
                .and_modify(|t| {
                    t.issues.push(crate::repair::RepairIssue {
                        issue_type: error.error_type.as_str().to_string(),
                        detail: error.detail.clone(),
                    })
                })
                .or_insert_with(|| {
                    let mut task =
                        RepairTask::from_qa_error(error, source, &row.target_text);
                    task.max_length_target = row.max_length_target;
                    task
                });
        }
        tasks.into_values().collect()
    }

    /// Repair QA failures in-memory and report what was fixed.
    pub async fn repair_rows(
        &self,
        rows: &mut [Row],
        report: &QaReport,
        qa_kind: QaKind,
    ) -> Result<RepairOutcome> {
        let mut tasks = Self::tasks_from_report(report, rows);
        let repair = RepairLoop::new(
            Arc::clone(&self.scheduler),
            self.config.repair.clone(),
            qa_kind,
            &self.output_dir,
        );
        let outcome = repair.run(&mut tasks).await?;

        for row in rows.iter_mut() {
            if let Some(fix) = outcome.fixes.get(&row.string_id) {
                row.target_text = fix.clone();
            }
        }
        Ok(outcome)
    }

    /// Repair a translated CSV against a saved QA report and write the
    /// repaired CSV. Escalated rows keep their old translation here; only
    /// the full `run` excludes them from the final deliverable.
    pub async fn repair_file(
        &self,
        translated: impl AsRef<Path>,
        report_path: impl AsRef<Path>,
        out: impl AsRef<Path>,
        qa_kind: QaKind,
    ) -> Result<RepairOutcome> {
        let mut file = read_rows(translated)?;
        let report: QaReport =
            serde_json::from_str(&std::fs::read_to_string(report_path.as_ref())?)?;
        let outcome = self.repair_rows(&mut file.rows, &report, qa_kind).await?;
        if file.target_column.is_none() {
            file.target_column = Some("target_text".to_string());
        }
        write_rows(out, &file)?;
        Ok(outcome)
    }

    /// Rehydrate a translated CSV into the final deliverable.
    ///
    /// `overwrite` replaces the target column in place; otherwise a
    /// `rehydrated_text` column is appended. Any unknown token aborts
    /// without writing the output file.
    pub fn rehydrate_file(
        &self,
        translated: impl AsRef<Path>,
        map_path: impl AsRef<Path>,
        final_out: impl AsRef<Path>,
        overwrite: bool,
    ) -> Result<RehydrateOutcome> {
        let mut file = read_rows(translated)?;
        let map = PlaceholderMap::load(map_path)?;
        let tokens_restored = self.rehydrate_rows(&mut file, &map, overwrite)?;
        write_rows(final_out, &file)?;
        Ok(RehydrateOutcome {
            rows: file.rows.len(),
            tokens_restored,
        })
    }

    fn rehydrate_rows(
        &self,
        file: &mut RowFile,
        map: &PlaceholderMap,
        overwrite: bool,
    ) -> Result<u64> {
        let mut rehydrator = Rehydrator::new(map);
        for (idx, row) in file.rows.iter_mut().enumerate() {
            let row_num = idx + 2;
            let restored = rehydrator.rehydrate_text(&row.target_text, &row.string_id, row_num)?;
            if overwrite {
                row.target_text = restored;
            } else {
                row.rehydrated_text = restored;
            }
        }
        if !overwrite {
            file.rehydrated_column = Some("rehydrated_text".to_string());
        }
        Ok(rehydrator.tokens_restored())
    }

    /// Full run: freeze, translate, validate, repair, rehydrate.
    ///
    /// Escalated rows are excluded from the final CSV; the status maps to
    /// the process exit code.
    pub async fn run_all(
        &self,
        input: impl AsRef<Path>,
        final_out: impl AsRef<Path>,
        with_soft_qa: bool,
    ) -> Result<RunStatus> {
        let draft_path = self.output_dir.join("draft.csv");
        let map_path = self.output_dir.join("placeholder_map.json");
        let translated_path = self.output_dir.join("translated.csv");

        self.freeze_file(input, &draft_path, &map_path)?;
        self.translate_file(&draft_path, &translated_path, None).await?;

        let mut file = read_rows(&translated_path)?;
        let map = PlaceholderMap::load(&map_path)?;

        let report = self.hard_qa_rows(&file.rows, &map, None);
        let mut escalated_ids: Vec<String> = Vec::new();
        if report.has_errors {
            let outcome = self.repair_rows(&mut file.rows, &report, QaKind::Hard).await?;
            escalated_ids.extend(outcome.escalations.iter().map(|t| t.string_id.clone()));
        }

        if with_soft_qa {
            let soft = run_soft_qa(
                &self.scheduler,
                &file.rows,
                &self.style_guide,
                &self.glossary.summary(50),
                Some(self.checkpoint_path("soft_qa")),
            )
            .await?;
            if !soft.issues.is_empty() {
                let mut tasks: Vec<RepairTask> = file
                    .rows
                    .iter()
                    .filter_map(|row| {
                        soft.issues.get(&row.string_id).map(|issues| {
                            let source = if row.tokenized_text.is_empty() {
                                row.source_text.as_str()
                            } else {
                                row.tokenized_text.as_str()
                            };
                            let mut task = RepairTask::from_soft_issues(
                                &row.string_id,
                                source,
                                &row.target_text,
                                issues,
                            );
                            task.max_length_target = row.max_length_target;
                            task
                        })
                    })
                    .collect();
                let repair = RepairLoop::new(
                    Arc::clone(&self.scheduler),
                    self.config.repair.clone(),
                    QaKind::Soft,
                    &self.output_dir,
                );
                let outcome = repair.run(&mut tasks).await?;
                for row in file.rows.iter_mut() {
                    if let Some(fix) = outcome.fixes.get(&row.string_id) {
                        row.target_text = fix.clone();
                    }
                }
                escalated_ids.extend(outcome.escalations.iter().map(|t| t.string_id.clone()));
            }
        }

        // Final verdict on the repaired rows.
        let final_report = self.hard_qa_rows(&file.rows, &map, None);
        final_report.save(self.output_dir.join("qa_hard_report.json"))?;

        // Escalations never reach the deliverable.
        if !escalated_ids.is_empty() {
            file.rows.retain(|r| !escalated_ids.contains(&r.string_id));
        }

        self.rehydrate_rows(&mut file, &map, true)?;
        write_rows(final_out, &file)?;

        // Escalations are excluded from the deliverable but still count
        // as a failed run, as do errors that survived repair.
        let remaining_errors = final_report
            .errors
            .iter()
            .any(|e| !escalated_ids.contains(&e.string_id));
        if remaining_errors || !escalated_ids.is_empty() {
            Ok(RunStatus::QaFailed)
        } else {
            Ok(RunStatus::Success)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qa::hard::{QaError, QaErrorType, Severity};

    fn report_with(errors: Vec<QaError>) -> QaReport {
        let json = serde_json::json!({
            "has_errors": !errors.is_empty(),
            "total_rows": 2,
            "error_counts": {},
            "errors": errors,
            "metadata": {"version": "2.0", "generated_at": "now", "partial": false}
        });
        serde_json::from_value(json).unwrap()
    }

    fn qa_error(string_id: &str, error_type: QaErrorType, detail: &str) -> QaError {
        QaError {
            row: 2,
            string_id: string_id.to_string(),
            error_type,
            severity: Severity::Critical,
            detail: detail.to_string(),
            source: None,
        }
    }

    fn row(id: &str, tokenized: &str, target: &str) -> Row {
        Row {
            string_id: id.to_string(),
            source_text: tokenized.to_string(),
            tokenized_text: tokenized.to_string(),
            target_text: target.to_string(),
            max_length_target: Some(40),
            ..Row::default()
        }
    }

    #[test]
    fn test_tasks_from_report_groups_errors_per_row() {
        let rows = vec![row("A", "⟦PH_1⟧ x", "broken"), row("B", "y", "fine")];
        let report = report_with(vec![
            qa_error("A", QaErrorType::TokenMismatch, "PH_1 missing"),
            qa_error("A", QaErrorType::LengthOverflow, "50 > 40"),
        ]);

        let tasks = Pipeline::tasks_from_report(&report, &rows);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].string_id, "A");
        assert_eq!(tasks[0].issues.len(), 2);
        assert_eq!(tasks[0].max_length_target, Some(40));
        assert_eq!(tasks[0].source_text, "⟦PH_1⟧ x");
        assert_eq!(tasks[0].current_translation, "broken");
    }

    #[test]
    fn test_tasks_from_report_skips_unknown_rows() {
        let rows = vec![row("A", "src", "tgt")];
        let report = report_with(vec![qa_error(
            "ghost",
            QaErrorType::TokenMismatch,
            "PH_9 missing",
        )]);
        let tasks = Pipeline::tasks_from_report(&report, &rows);
        assert!(tasks.is_empty());
    }
}
