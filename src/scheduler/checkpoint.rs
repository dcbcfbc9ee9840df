//! Step checkpoints: the set of completed `string_id`s, persisted so a
//! crashed or cancelled run resumes without repeating LLM calls.
//!
//! Writes are atomic (temp file, fsync, rename) so a crash mid-write
//! leaves the previous checkpoint intact.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LocPipeError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub step: String,
    #[serde(default)]
    pub done_ids: BTreeSet<String>,
    #[serde(default)]
    pub batch_idx: u64,
    #[serde(default)]
    pub stats: BTreeMap<String, u64>,
}

impl Checkpoint {
    pub fn new(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            ..Self::default()
        }
    }

    /// Load a checkpoint; a missing or unreadable file starts fresh.
    pub fn load(path: impl AsRef<Path>, step: &str) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            return Self::new(step);
        }
        match std::fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str::<Checkpoint>(&text).ok())
        {
            Some(cp) if cp.step == step || cp.step.is_empty() => Checkpoint {
                step: step.to_string(),
                ..cp
            },
            Some(cp) => {
                tracing::warn!(
                    found = %cp.step,
                    expected = %step,
                    "checkpoint belongs to a different step, starting fresh"
                );
                Self::new(step)
            }
            None => {
                tracing::warn!(path = %path.display(), "unreadable checkpoint, starting fresh");
                Self::new(step)
            }
        }
    }

    /// Atomically persist the checkpoint.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(self)?.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)
            .map_err(|e| LocPipeError::Storage(format!("checkpoint rename failed: {}", e)))?;
        Ok(())
    }

    pub fn mark_done(&mut self, ids: impl IntoIterator<Item = String>) {
        self.done_ids.extend(ids);
    }

    pub fn is_done(&self, string_id: &str) -> bool {
        self.done_ids.contains(string_id)
    }

    pub fn bump_stat(&mut self, key: &str, delta: u64) {
        *self.stats.entry(key.to_string()).or_default() += delta;
    }
}
