//! Project glossary: compiled term index, per-row constraint subsets, and
//! the stable digest used for cache keying.
//!
//! Only approved/verified entries reach prompts. Everything else is kept
//! in a side index for the term miner and never leaks into LLM context.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{LocPipeError, Result};

/// Review status of a glossary entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TermStatus {
    Approved,
    Pending,
    Verified,
    Community,
    Auto,
}

impl TermStatus {
    /// Whether entries of this status may appear in prompt constraints.
    pub fn is_trusted(&self) -> bool {
        matches!(self, TermStatus::Approved | TermStatus::Verified)
    }
}

/// One glossary term pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlossaryEntry {
    #[serde(alias = "term_zh")]
    pub term_source: String,
    #[serde(alias = "term_ru")]
    pub term_target: String,
    pub status: TermStatus,
    #[serde(default = "default_priority")]
    pub priority: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

fn default_priority() -> f64 {
    1.0
}

#[derive(Debug, Default, Deserialize)]
struct GlossaryFile {
    #[serde(default)]
    entries: Vec<GlossaryEntry>,
}

/// Compiled glossary: trusted entries keyed by source term, plus the
/// untrusted remainder for the miner.
pub struct GlossaryIndex {
    trusted: BTreeMap<String, GlossaryEntry>,
    untrusted: Vec<GlossaryEntry>,
    digest: String,
}

impl GlossaryIndex {
    /// Compile an index from loaded entries.
    pub fn new(entries: Vec<GlossaryEntry>) -> Self {
        let mut trusted = BTreeMap::new();
        let mut untrusted = Vec::new();
        for entry in entries {
            if entry.term_source.is_empty() {
                continue;
            }
            if entry.status.is_trusted() {
                trusted.insert(entry.term_source.clone(), entry);
            } else {
                untrusted.push(entry);
            }
        }

        let digest = compute_digest(&trusted);
        Self {
            trusted,
            untrusted,
            digest,
        }
    }

    /// An index with no entries and a stable digest.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Load and compile a glossary YAML file. A missing path yields an
    /// empty index so the pipeline can run glossary-free.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "no glossary file, using empty index");
            return Ok(Self::empty());
        }
        let text = std::fs::read_to_string(path).map_err(|e| {
            LocPipeError::Config(format!("cannot read glossary {}: {}", path.display(), e))
        })?;
        let file: GlossaryFile = serde_yaml::from_str(&text)?;
        Ok(Self::new(file.entries))
    }

    /// Stable digest of the compiled trusted entries, for cache keying.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn trusted_len(&self) -> usize {
        self.trusted.len()
    }

    /// Entries whose source term occurs in the given pre-freeze text.
    pub fn constraints_for(&self, source_text: &str) -> Vec<&GlossaryEntry> {
        self.trusted
            .values()
            .filter(|e| source_text.contains(&e.term_source))
            .collect()
    }

    /// Source terms of all trusted entries.
    pub fn trusted_terms(&self) -> Vec<&str> {
        self.trusted.keys().map(String::as_str).collect()
    }

    /// Untrusted entries, exposed for the term miner only.
    pub fn miner_entries(&self) -> &[GlossaryEntry] {
        &self.untrusted
    }

    /// Prompt-ready summary of trusted terms, capped at `max_entries`.
    pub fn summary(&self, max_entries: usize) -> String {
        if self.trusted.is_empty() {
            return "(none)".to_string();
        }
        self.trusted
            .values()
            .take(max_entries)
            .map(|e| format!("- {} → {}", e.term_source, e.term_target))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn compute_digest(trusted: &BTreeMap<String, GlossaryEntry>) -> String {
    let mut hasher = Sha256::new();
    // BTreeMap iteration is already sorted by source term.
    for entry in trusted.values() {
        hasher.update(entry.term_source.as_bytes());
        hasher.update([0u8]);
        hasher.update(entry.term_target.as_bytes());
        hasher.update([0u8]);
        hasher.update(format!("{:?}|{}", entry.status, entry.priority).as_bytes());
        hasher.update([b'\n']);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn entry(src: &str, tgt: &str, status: TermStatus) -> GlossaryEntry {
        GlossaryEntry {
            term_source: src.to_string(),
            term_target: tgt.to_string(),
            status,
            priority: 1.0,
            notes: None,
        }
    }

    #[test]
    fn test_only_trusted_statuses_indexed() {
        let index = GlossaryIndex::new(vec![
            entry("攻击", "атака", TermStatus::Approved),
            entry("防御", "защита", TermStatus::Verified),
            entry("暴击", "крит", TermStatus::Pending),
            entry("闪避", "уклон", TermStatus::Auto),
        ]);
        assert_eq!(index.trusted_len(), 2);
        assert_eq!(index.miner_entries().len(), 2);
    }

    #[test]
    fn test_constraints_are_substring_matches() {
        let index = GlossaryIndex::new(vec![
            entry("攻击", "атака", TermStatus::Approved),
            entry("防御", "защита", TermStatus::Approved),
        ]);
        let constraints = index.constraints_for("提升攻击力10点");
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].term_target, "атака");
    }

    #[test]
    fn test_digest_stable_across_insertion_order() {
        let a = GlossaryIndex::new(vec![
            entry("a", "1", TermStatus::Approved),
            entry("b", "2", TermStatus::Approved),
        ]);
        let b = GlossaryIndex::new(vec![
            entry("b", "2", TermStatus::Approved),
            entry("a", "1", TermStatus::Approved),
        ]);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_digest_changes_with_entries() {
        let a = GlossaryIndex::new(vec![entry("a", "1", TermStatus::Approved)]);
        let b = GlossaryIndex::new(vec![entry("a", "2", TermStatus::Approved)]);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_untrusted_does_not_affect_digest() {
        let a = GlossaryIndex::new(vec![entry("a", "1", TermStatus::Approved)]);
        let b = GlossaryIndex::new(vec![
            entry("a", "1", TermStatus::Approved),
            entry("x", "y", TermStatus::Pending),
        ]);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_summary_format_and_cap() {
        let index = GlossaryIndex::new(vec![
            entry("攻击", "атака", TermStatus::Approved),
            entry("防御", "защита", TermStatus::Approved),
        ]);
        let summary = index.summary(1);
        assert_eq!(summary.lines().count(), 1);
        assert!(summary.starts_with("- "));
        assert!(summary.contains('→'));
    }

    #[test]
    fn test_empty_summary() {
        assert_eq!(GlossaryIndex::empty().summary(50), "(none)");
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let index = GlossaryIndex::load("/nonexistent/glossary.yaml").unwrap();
        assert_eq!(index.trusted_len(), 0);
    }

    #[test]
    fn test_load_yaml_with_legacy_aliases() {
        let mut f = NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
entries:
  - term_zh: 攻击
    term_ru: атака
    status: approved
  - term_source: 防御
    term_target: защита
    status: verified
    priority: 0.8
    notes: shield stat
"#
        )
        .unwrap();
        let index = GlossaryIndex::load(f.path()).unwrap();
        assert_eq!(index.trusted_len(), 2);
        let c = index.constraints_for("防御增加");
        assert_eq!(c[0].priority, 0.8);
    }
}
