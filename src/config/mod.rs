//! Pipeline runtime configuration.
//!
//! One YAML file covers batching limits, worker-pool behavior, cache
//! tuning, and the repair rounds. Every section has serde defaults so a
//! missing file still yields a runnable config.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::error::{LocPipeError, Result};

/// Whether a batch carries ordinary strings or long-form text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Normal,
    LongText,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Normal => "normal",
            ContentType::LongText => "long_text",
        }
    }
}

/// Per-content-type batching limits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchLimits {
    pub max_batch_size: usize,
    pub timeout_s: u64,
    pub cooldown_ms: u64,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            timeout_s: 60,
            cooldown_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentLimits {
    pub normal: BatchLimits,
    pub long_text: BatchLimits,
}

impl Default for ContentLimits {
    fn default() -> Self {
        Self {
            normal: BatchLimits::default(),
            long_text: BatchLimits {
                max_batch_size: 3,
                timeout_s: 120,
                cooldown_ms: 500,
            },
        }
    }
}

/// Batching limits per model × content type, with global defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchRuntimeConfig {
    pub defaults: ContentLimits,
    pub models: HashMap<String, ContentLimits>,
}

impl BatchRuntimeConfig {
    fn limits(&self, model: &str, content_type: ContentType) -> BatchLimits {
        let limits = self.models.get(model).unwrap_or(&self.defaults);
        match content_type {
            ContentType::Normal => limits.normal,
            ContentType::LongText => limits.long_text,
        }
    }

    pub fn max_batch_size(&self, model: &str, content_type: ContentType) -> usize {
        self.limits(model, content_type).max_batch_size.max(1)
    }

    pub fn timeout_s(&self, model: &str, content_type: ContentType) -> u64 {
        self.limits(model, content_type).timeout_s
    }

    pub fn cooldown_ms(&self, model: &str, content_type: ContentType) -> u64 {
        self.limits(model, content_type).cooldown_ms
    }
}

/// Worker-pool and dynamic-sizing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub dynamic_sizing: bool,
    pub target_batch_time_ms: u64,
    pub max_workers: usize,
    pub token_buffer: u64,
    pub retry: u32,
    pub preserve_order: bool,
    pub fail_fast: bool,
    pub partial_match: bool,
    pub grouping_enabled: bool,
    pub max_length_variance: usize,
    pub model_context_windows: HashMap<String, u64>,
    /// Milliseconds per token, used before latency history accrues.
    pub latency_model: HashMap<String, f64>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            dynamic_sizing: true,
            target_batch_time_ms: 30_000,
            max_workers: 4,
            token_buffer: 500,
            retry: 2,
            preserve_order: true,
            fail_fast: false,
            partial_match: false,
            grouping_enabled: true,
            max_length_variance: 100,
            model_context_windows: HashMap::new(),
            latency_model: HashMap::new(),
        }
    }
}

/// One repair round: the model to use and how verbose the prompt gets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairRound {
    pub model: String,
    #[serde(default)]
    pub prompt_variant: PromptVariant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptVariant {
    #[default]
    Standard,
    Detailed,
    Expert,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    pub max_rounds: usize,
    pub rounds: Vec<RepairRound>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_rounds: 3,
            rounds: Vec::new(),
        }
    }
}

impl RepairConfig {
    /// Round config for a 1-based round number; falls back to the first
    /// configured round when the number is out of range.
    pub fn round(&self, round_num: usize) -> Option<&RepairRound> {
        self.rounds
            .get(round_num.saturating_sub(1))
            .or_else(|| self.rounds.first())
    }
}

/// Top-level pipeline configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub source_lang: String,
    pub batch: BatchRuntimeConfig,
    pub processing: ProcessingConfig,
    pub cache: CacheConfig,
    pub repair: RepairConfig,
}

impl PipelineConfig {
    /// Load from YAML; a missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!(path = %path.display(), "no pipeline config, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| {
            LocPipeError::Config(format!("cannot read pipeline config {}: {}", path.display(), e))
        })?;
        Ok(serde_yaml::from_str(&text)?)
    }
}
