//! Placeholder freezer: turns runtime placeholders and markup tags into
//! opaque tokens.
//!
//! Counters live on the freezer value, so one freeze pass never interferes
//! with another. Identical glyph runs reuse the same token within a pass.

use std::collections::BTreeMap;
use std::collections::HashMap;

use super::schema::{CompiledSchema, PatternKind};

/// Totals for one freeze pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreezeStats {
    pub ph_count: u64,
    pub tag_count: u64,
}

/// One freeze pass over a set of rows.
///
/// All rows of an input file share a pass so identical placeholders get
/// identical tokens across rows; a new file gets a new freezer.
pub struct PlaceholderFreezer<'a> {
    schema: &'a CompiledSchema,
    ph_counter: u64,
    tag_counter: u64,
    // token_name -> original glyph run, pass-wide
    mappings: BTreeMap<String, String>,
    // original glyph run -> token_name, for reuse
    reverse: HashMap<String, String>,
}

impl<'a> PlaceholderFreezer<'a> {
    pub fn new(schema: &'a CompiledSchema) -> Self {
        Self {
            schema,
            ph_counter: 0,
            tag_counter: 0,
            mappings: BTreeMap::new(),
            reverse: HashMap::new(),
        }
    }

    /// Freeze one text. Returns the tokenized text and the mappings minted
    /// (or reused) by this call.
    pub fn freeze_text(&mut self, text: &str) -> (String, BTreeMap<String, String>) {
        if text.is_empty() {
            return (String::new(), BTreeMap::new());
        }

        let mut local = BTreeMap::new();
        let mut result = text.to_string();

        for i in 0..self.schema.patterns.len() {
            result = self.apply_pattern(&result, i, &mut local);
        }

        (result, local)
    }

    fn apply_pattern(
        &mut self,
        text: &str,
        pattern_idx: usize,
        local: &mut BTreeMap<String, String>,
    ) -> String {
        let (kind, matches): (PatternKind, Vec<(usize, usize)>) = {
            let pat = &self.schema.patterns[pattern_idx];
            (
                pat.kind,
                pat.regex.find_iter(text).map(|m| (m.start(), m.end())).collect(),
            )
        };
        if matches.is_empty() {
            return text.to_string();
        }

        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for (start, end) in matches {
            out.push_str(&text[last..start]);
            let original = &text[start..end];
            let (token_name, rendered) = self.token_for(original, kind);
            local.insert(token_name, original.to_string());
            out.push_str(&rendered);
            last = end;
        }
        out.push_str(&text[last..]);
        out
    }

    /// Look up or mint the token for an original glyph run.
    fn token_for(&mut self, original: &str, kind: PatternKind) -> (String, String) {
        if let Some(name) = self.reverse.get(original) {
            let n: u64 = name
                .rsplit('_')
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let kind = if name.starts_with("PH_") {
                PatternKind::Placeholder
            } else {
                PatternKind::Tag
            };
            return (name.clone(), self.schema.render_token(kind, n));
        }

        let (name, n) = match kind {
            PatternKind::Placeholder => {
                self.ph_counter += 1;
                (format!("PH_{}", self.ph_counter), self.ph_counter)
            }
            PatternKind::Tag => {
                self.tag_counter += 1;
                (format!("TAG_{}", self.tag_counter), self.tag_counter)
            }
        };
        self.mappings.insert(name.clone(), original.to_string());
        self.reverse.insert(original.to_string(), name.clone());
        (name.clone(), self.schema.render_token(kind, n))
    }

    /// All mappings minted over the whole pass.
    pub fn mappings(&self) -> &BTreeMap<String, String> {
        &self.mappings
    }

    pub fn stats(&self) -> FreezeStats {
        FreezeStats {
            ph_count: self.ph_counter,
            tag_count: self.tag_counter,
        }
    }
}

/// Conservative bracket-balance check on source text.
///
/// Imbalances are sanity warnings for an early QA report, not fatal.
pub fn detect_unbalanced(text: &str) -> Vec<&'static str> {
    let mut issues = Vec::new();
    let count = |c: char| text.chars().filter(|&x| x == c).count();
    if count('{') != count('}') {
        issues.push("brace_unbalanced");
    }
    if count('<') != count('>') {
        issues.push("angle_unbalanced");
    }
    if count('[') != count(']') {
        issues.push("square_unbalanced");
    }
    issues
}
