//! Placeholder schema: the ordered pattern list that decides what gets
//! frozen, loaded from YAML.

use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{LocPipeError, Result};

/// Whether a pattern freezes to a `PH_` or a `TAG_` token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Placeholder,
    Tag,
}

/// One pattern definition, in priority order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternDef {
    pub name: String,
    pub regex: String,
    #[serde(rename = "type")]
    pub kind: PatternKind,
}

/// Token rendering templates with a single `{n}` slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenFormat {
    pub placeholder: String,
    pub tag: String,
}

impl Default for TokenFormat {
    fn default() -> Self {
        Self {
            placeholder: "⟦PH_{n}⟧".to_string(),
            tag: "⟦TAG_{n}⟧".to_string(),
        }
    }
}

/// An open/close tag pair used by the tag-balance QA check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedTag {
    pub open: String,
    pub close: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Schema file as written on disk (version 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaceholderSchema {
    pub version: u32,
    pub patterns: Vec<PatternDef>,
    pub token_format: TokenFormat,
    pub paired_tags: Vec<PairedTag>,
    /// Regexes that must never appear in a translation.
    pub forbidden: Vec<String>,
}

impl Default for PlaceholderSchema {
    fn default() -> Self {
        Self {
            version: 2,
            patterns: Vec::new(),
            token_format: TokenFormat::default(),
            paired_tags: Vec::new(),
            forbidden: Vec::new(),
        }
    }
}

impl PlaceholderSchema {
    /// Load a schema from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            LocPipeError::Schema(format!("cannot read {}: {}", path.display(), e))
        })?;
        let schema: PlaceholderSchema = serde_yaml::from_str(&text)?;
        if schema.patterns.is_empty() {
            tracing::warn!(path = %path.display(), "schema has no patterns");
        }
        Ok(schema)
    }

    /// Compile the pattern regexes, skipping malformed ones with a warning.
    pub fn compile(&self) -> CompiledSchema {
        let mut patterns = Vec::new();
        let mut skipped = Vec::new();
        for def in &self.patterns {
            match Regex::new(&def.regex) {
                Ok(regex) => patterns.push(CompiledPattern {
                    name: def.name.clone(),
                    kind: def.kind,
                    regex,
                }),
                Err(e) => {
                    tracing::warn!(pattern = %def.name, error = %e, "invalid regex in schema, skipping");
                    skipped.push(def.name.clone());
                }
            }
        }
        let mut forbidden = Vec::new();
        for raw in &self.forbidden {
            match Regex::new(raw) {
                Ok(regex) => forbidden.push(regex),
                Err(e) => {
                    tracing::warn!(pattern = %raw, error = %e, "invalid forbidden regex, skipping");
                    skipped.push(raw.clone());
                }
            }
        }
        CompiledSchema {
            patterns,
            forbidden,
            token_format: self.token_format.clone(),
            paired_tags: self.paired_tags.clone(),
            skipped,
        }
    }
}

/// A pattern with its regex compiled.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub name: String,
    pub kind: PatternKind,
    pub regex: Regex,
}

/// Compiled schema ready for freezing and QA.
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    pub patterns: Vec<CompiledPattern>,
    pub forbidden: Vec<Regex>,
    pub token_format: TokenFormat,
    pub paired_tags: Vec<PairedTag>,
    /// Names of pattern definitions dropped for malformed regexes.
    pub skipped: Vec<String>,
}

impl CompiledSchema {
    /// Render a token name (`PH_3`) into its in-text form (`⟦PH_3⟧`).
    pub fn render_token(&self, kind: PatternKind, n: u64) -> String {
        let template = match kind {
            PatternKind::Placeholder => &self.token_format.placeholder,
            PatternKind::Tag => &self.token_format.tag,
        };
        template.replace("{n}", &n.to_string())
    }
}

/// A schema covering the common runtime placeholder shapes; used when no
/// schema file is given.
pub fn default_schema() -> PlaceholderSchema {
    PlaceholderSchema {
        version: 2,
        patterns: vec![
            PatternDef {
                name: "brace_numeric".to_string(),
                regex: r"\{\d+\}".to_string(),
                kind: PatternKind::Placeholder,
            },
            PatternDef {
                name: "brace_named".to_string(),
                regex: r"\{[A-Za-z_][A-Za-z0-9_]*\}".to_string(),
                kind: PatternKind::Placeholder,
            },
            PatternDef {
                name: "percent".to_string(),
                regex: r"%[sd]".to_string(),
                kind: PatternKind::Placeholder,
            },
            PatternDef {
                name: "angle_tag".to_string(),
                regex: r"</?[A-Za-z][^>]*>".to_string(),
                kind: PatternKind::Tag,
            },
        ],
        token_format: TokenFormat::default(),
        paired_tags: Vec::new(),
        forbidden: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_schema_yaml() {
        let mut f = NamedTempFile::new().unwrap();
        write!(
            f,
            r#"
version: 2
patterns:
  - name: brace
    regex: '\{{\d+\}}'
    type: placeholder
  - name: tag
    regex: '</?[a-z]+>'
    type: tag
token_format:
  placeholder: "⟦PH_{{n}}⟧"
  tag: "⟦TAG_{{n}}⟧"
paired_tags:
  - open: "<b>"
    close: "</b>"
    description: bold
"#
        )
        .unwrap();

        let schema = PlaceholderSchema::load(f.path()).unwrap();
        assert_eq!(schema.version, 2);
        assert_eq!(schema.patterns.len(), 2);
        assert_eq!(schema.patterns[0].kind, PatternKind::Placeholder);
        assert_eq!(schema.patterns[1].kind, PatternKind::Tag);
        assert_eq!(schema.paired_tags.len(), 1);
    }

    #[test]
    fn test_load_missing_file() {
        let result = PlaceholderSchema::load("/nonexistent/schema.yaml");
        assert!(matches!(result, Err(LocPipeError::Schema(_))));
    }

    #[test]
    fn test_compile_skips_malformed_regex() {
        let schema = PlaceholderSchema {
            patterns: vec![
                PatternDef {
                    name: "good".to_string(),
                    regex: r"\{\d+\}".to_string(),
                    kind: PatternKind::Placeholder,
                },
                PatternDef {
                    name: "bad".to_string(),
                    regex: r"([unclosed".to_string(),
                    kind: PatternKind::Placeholder,
                },
            ],
            ..PlaceholderSchema::default()
        };

        let compiled = schema.compile();
        assert_eq!(compiled.patterns.len(), 1);
        assert_eq!(compiled.skipped, vec!["bad".to_string()]);
    }

    #[test]
    fn test_render_token() {
        let compiled = default_schema().compile();
        assert_eq!(compiled.render_token(PatternKind::Placeholder, 1), "⟦PH_1⟧");
        assert_eq!(compiled.render_token(PatternKind::Tag, 7), "⟦TAG_7⟧");
    }

    #[test]
    fn test_default_schema_matches_common_shapes() {
        let compiled = default_schema().compile();
        assert!(compiled.patterns.iter().any(|p| p.regex.is_match("{0}")));
        assert!(compiled.patterns.iter().any(|p| p.regex.is_match("%s")));
        assert!(compiled.patterns.iter().any(|p| p.regex.is_match("<color=red>")));
    }

    #[test]
    fn test_forbidden_compiled() {
        let schema = PlaceholderSchema {
            forbidden: vec!["【.*】".to_string()],
            ..default_schema()
        };
        let compiled = schema.compile();
        assert_eq!(compiled.forbidden.len(), 1);
        assert!(compiled.forbidden[0].is_match("【武器】"));
    }
}
