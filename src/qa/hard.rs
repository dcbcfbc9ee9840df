//! Hard QA validator: structural checks every translated row must pass.
//!
//! Token-set equality, tag balance, forbidden patterns, model-invented
//! placeholders, and length limits. The validator aggregates everything
//! into a report and never aborts mid-file.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec::map::PlaceholderMap;
use crate::codec::schema::{CompiledSchema, PatternKind};
use crate::codec::token_signature;
use crate::rows::Row;

/// Cap on errors carried in one report.
const MAX_REPORT_ERRORS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

/// Error categories recognized by the validator and repair loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QaErrorType {
    TokenMismatch,
    TagUnbalanced,
    ForbiddenHit,
    NewPlaceholderFound,
    LengthOverflow,
    SourceUnbalancedBasic,
    CjkRemaining,
}

impl QaErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QaErrorType::TokenMismatch => "token_mismatch",
            QaErrorType::TagUnbalanced => "tag_unbalanced",
            QaErrorType::ForbiddenHit => "forbidden_hit",
            QaErrorType::NewPlaceholderFound => "new_placeholder_found",
            QaErrorType::LengthOverflow => "length_overflow",
            QaErrorType::SourceUnbalancedBasic => "source_unbalanced_basic",
            QaErrorType::CjkRemaining => "cjk_remaining",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaError {
    pub row: usize,
    pub string_id: String,
    #[serde(rename = "type")]
    pub error_type: QaErrorType,
    pub severity: Severity,
    pub detail: String,
    /// Source excerpt for reproduction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaReportMetadata {
    pub version: String,
    pub generated_at: String,
    #[serde(default)]
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_file: Option<String>,
}

/// Aggregated validation outcome, always written as v2.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaReport {
    pub has_errors: bool,
    pub total_rows: usize,
    pub error_counts: BTreeMap<String, usize>,
    pub errors: Vec<QaError>,
    #[serde(default)]
    pub errors_truncated: bool,
    pub metadata: QaReportMetadata,
}

impl QaReport {
    fn build(total_rows: usize, mut errors: Vec<QaError>, input_file: Option<String>) -> Self {
        let mut error_counts: BTreeMap<String, usize> = BTreeMap::new();
        for error in &errors {
            *error_counts
                .entry(error.error_type.as_str().to_string())
                .or_default() += 1;
        }
        let errors_truncated = errors.len() > MAX_REPORT_ERRORS;
        errors.truncate(MAX_REPORT_ERRORS);
        QaReport {
            has_errors: !errors.is_empty(),
            total_rows,
            error_counts,
            errors,
            errors_truncated,
            metadata: QaReportMetadata {
                version: "2.0".to_string(),
                generated_at: chrono::Utc::now().to_rfc3339(),
                partial: false,
                input_file,
            },
        }
    }

    pub fn save(&self, path: impl AsRef<std::path::Path>) -> crate::error::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Build the early report emitted when freeze-time balance checks find
/// suspicious source text. Warnings only, capped at 200.
pub fn early_balance_report(
    total_rows: usize,
    sanity: &[(usize, String, Vec<&'static str>, String)],
    input_file: Option<String>,
) -> QaReport {
    let errors: Vec<QaError> = sanity
        .iter()
        .take(200)
        .map(|(row, string_id, issues, source)| QaError {
            row: *row,
            string_id: string_id.clone(),
            error_type: QaErrorType::SourceUnbalancedBasic,
            severity: Severity::Minor,
            detail: issues.join(", "),
            source: Some(source.clone()),
        })
        .collect();
    QaReport::build(total_rows, errors, input_file)
}

/// The validator itself. Construct once per report.
pub struct HardQaValidator<'a> {
    schema: &'a CompiledSchema,
    map: Option<&'a PlaceholderMap>,
    /// Flag leftover CJK glyphs in targets (for zh-source projects).
    pub check_cjk_residue: bool,
    errors: Vec<QaError>,
}

impl<'a> HardQaValidator<'a> {
    pub fn new(schema: &'a CompiledSchema, map: Option<&'a PlaceholderMap>) -> Self {
        Self {
            schema,
            map,
            check_cjk_residue: false,
            errors: Vec::new(),
        }
    }

    /// Validate every row with a non-empty target and produce the report.
    pub fn validate(mut self, rows: &[Row], input_file: Option<String>) -> QaReport {
        for (idx, row) in rows.iter().enumerate() {
            let row_num = idx + 2;
            if row.target_text.trim().is_empty() {
                continue;
            }
            let source = if row.tokenized_text.is_empty() {
                &row.source_text
            } else {
                &row.tokenized_text
            };
            self.check_token_sets(row_num, &row.string_id, source, &row.target_text);
            self.check_tag_balance(row_num, &row.string_id, &row.target_text);
            self.check_forbidden(row_num, &row.string_id, &row.target_text);
            self.check_new_placeholders(row_num, &row.string_id, &row.target_text);
            self.check_length(row_num, &row.string_id, row.max_length_target, &row.target_text);
            if self.check_cjk_residue {
                self.check_cjk(row_num, &row.string_id, &row.target_text);
            }
        }
        QaReport::build(rows.len(), self.errors, input_file)
    }

    fn push(
        &mut self,
        row: usize,
        string_id: &str,
        error_type: QaErrorType,
        severity: Severity,
        detail: String,
        source: Option<String>,
    ) {
        self.errors.push(QaError {
            row,
            string_id: string_id.to_string(),
            error_type,
            severity,
            detail,
            source,
        });
    }

    /// One error per missing token name and one per extra.
    fn check_token_sets(&mut self, row: usize, string_id: &str, source: &str, target: &str) {
        let source_sig = token_signature(source);
        let target_sig = token_signature(target);
        if source_sig == target_sig {
            return;
        }
        for (name, count) in &source_sig {
            let target_count = target_sig.get(name).copied().unwrap_or(0);
            if target_count < *count {
                self.push(
                    row,
                    string_id,
                    QaErrorType::TokenMismatch,
                    Severity::Critical,
                    format!("{} missing ({} in source, {} in target)", name, count, target_count),
                    Some(source.chars().take(80).collect()),
                );
            }
        }
        for (name, count) in &target_sig {
            let source_count = source_sig.get(name).copied().unwrap_or(0);
            if *count > source_count {
                self.push(
                    row,
                    string_id,
                    QaErrorType::TokenMismatch,
                    Severity::Critical,
                    format!("{} extra ({} in source, {} in target)", name, source_count, count),
                    Some(source.chars().take(80).collect()),
                );
            }
        }
    }

    /// Count open/close tag tokens in the target. With `paired_tags` in
    /// the schema, originals resolve to token names via the map; without
    /// them, closers (`</x>`) are paired with openers by tag name.
    fn check_tag_balance(&mut self, row: usize, string_id: &str, target: &str) {
        let Some(map) = self.map else {
            return;
        };

        let count_token = |original: &str| -> usize {
            map.mappings
                .iter()
                .filter(|(name, value)| name.starts_with("TAG_") && value.as_str() == original)
                .map(|(name, _)| target.matches(&format!("⟦{}⟧", name)).count())
                .sum()
        };

        if !self.schema.paired_tags.is_empty() {
            let pairs: Vec<(String, String)> = self
                .schema
                .paired_tags
                .iter()
                .map(|p| (p.open.clone(), p.close.clone()))
                .collect();
            for (open, close) in pairs {
                let opens = count_token(&open);
                let closes = count_token(&close);
                if opens != closes {
                    self.push(
                        row,
                        string_id,
                        QaErrorType::TagUnbalanced,
                        Severity::Major,
                        format!("{} opened {} times, closed {}", open, opens, closes),
                        None,
                    );
                }
            }
            return;
        }

        // Coarse fallback: derive pairs from the frozen originals.
        let mut derived: Vec<(String, String)> = Vec::new();
        for value in map.mappings.values() {
            if let Some(name) = value.strip_prefix("</").and_then(|v| v.strip_suffix('>')) {
                let closer = value.clone();
                if let Some(opener) = map
                    .mappings
                    .values()
                    .find(|v| {
                        v.starts_with(&format!("<{}", name))
                            && !v.starts_with("</")
                            && v.ends_with('>')
                    })
                    .cloned()
                {
                    if !derived.iter().any(|(o, c)| *o == opener && *c == closer) {
                        derived.push((opener, closer));
                    }
                }
            }
        }
        for (open, close) in derived {
            let opens = count_token(&open);
            let closes = count_token(&close);
            if opens != closes {
                self.push(
                    row,
                    string_id,
                    QaErrorType::TagUnbalanced,
                    Severity::Major,
                    format!("{} opened {} times, closed {}", open, opens, closes),
                    None,
                );
            }
        }
    }

    /// First forbidden-pattern hit only, one error per row.
    fn check_forbidden(&mut self, row: usize, string_id: &str, target: &str) {
        let hit = self
            .schema
            .forbidden
            .iter()
            .find_map(|re| re.find(target).map(|m| (re.as_str().to_string(), m.as_str().to_string())));
        if let Some((pattern, matched)) = hit {
            self.push(
                row,
                string_id,
                QaErrorType::ForbiddenHit,
                Severity::Major,
                format!("pattern '{}' matched '{}'", pattern, matched),
                None,
            );
        }
    }

    /// A raw placeholder shape in the target means the model invented one
    /// the freezer would have captured.
    fn check_new_placeholders(&mut self, row: usize, string_id: &str, target: &str) {
        let hit = self
            .schema
            .patterns
            .iter()
            .filter(|p| p.kind == PatternKind::Placeholder)
            .find_map(|p| p.regex.find(target).map(|m| m.as_str().to_string()));
        if let Some(matched) = hit {
            self.push(
                row,
                string_id,
                QaErrorType::NewPlaceholderFound,
                Severity::Major,
                format!("raw placeholder '{}' in target", matched),
                None,
            );
        }
    }

    fn check_length(
        &mut self,
        row: usize,
        string_id: &str,
        max_length: Option<u32>,
        target: &str,
    ) {
        let Some(limit) = max_length.filter(|l| *l > 0) else {
            return;
        };
        let length = target.chars().count() as u32;
        if length <= limit {
            return;
        }
        let severity = if length as f64 > limit as f64 * 1.5 {
            Severity::Critical
        } else {
            Severity::Major
        };
        self.push(
            row,
            string_id,
            QaErrorType::LengthOverflow,
            severity,
            format!("{} chars > limit {}", length, limit),
            None,
        );
    }

    fn check_cjk(&mut self, row: usize, string_id: &str, target: &str) {
        if target.chars().any(|c| ('\u{4e00}'..='\u{9fff}').contains(&c)) {
            self.push(
                row,
                string_id,
                QaErrorType::CjkRemaining,
                Severity::Major,
                "untranslated CJK glyphs in target".to_string(),
                None,
            );
        }
    }
}
