//! Placeholder map persistence.
//!
//! Writers always emit the v2.0 envelope (metadata + mappings); readers
//! also accept the legacy v1.0 flat `token -> original` object.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LocPipeError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceholderMapMetadata {
    pub version: String,
    pub generated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_file: Option<String>,
    pub total_placeholders: usize,
    pub ph_count: u64,
    pub tag_count: u64,
}

/// One freeze pass's token mappings plus provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceholderMap {
    pub metadata: PlaceholderMapMetadata,
    pub mappings: BTreeMap<String, String>,
}

impl PlaceholderMap {
    /// Build a v2.0 map from a finished freeze pass.
    pub fn from_pass(
        mappings: BTreeMap<String, String>,
        ph_count: u64,
        tag_count: u64,
        input_file: Option<String>,
    ) -> Self {
        Self {
            metadata: PlaceholderMapMetadata {
                version: "2.0".to_string(),
                generated_at: chrono::Utc::now().to_rfc3339(),
                input_file,
                total_placeholders: mappings.len(),
                ph_count,
                tag_count,
            },
            mappings,
        }
    }

    /// Load a map, accepting both the v2.0 envelope and the v1.0 flat form.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            LocPipeError::Storage(format!("cannot read {}: {}", path.display(), e))
        })?;
        let value: Value = serde_json::from_str(&text)?;

        if value.get("mappings").is_some() {
            return Ok(serde_json::from_value(value)?);
        }

        // v1.0: the whole document is the mappings object.
        let flat: BTreeMap<String, String> = serde_json::from_value(value)?;
        let ph_count = flat.keys().filter(|k| k.starts_with("PH_")).count() as u64;
        let tag_count = flat.keys().filter(|k| k.starts_with("TAG_")).count() as u64;
        Ok(Self {
            metadata: PlaceholderMapMetadata {
                version: "1.0".to_string(),
                generated_at: chrono::Utc::now().to_rfc3339(),
                input_file: None,
                total_placeholders: flat.len(),
                ph_count,
                tag_count,
            },
            mappings: flat,
        })
    }

    /// Write the map as pretty-printed v2.0 JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn contains(&self, token_name: &str) -> bool {
        self.mappings.contains_key(token_name)
    }

    pub fn get(&self, token_name: &str) -> Option<&str> {
        self.mappings.get(token_name).map(String::as_str)
    }
}
