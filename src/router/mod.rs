//! Step-based model router.
//!
//! Loads a YAML routing table and answers, per pipeline step, which models
//! to try and in what order. The router never retries; on failure it only
//! decides whether the caller may advance to the next model in the chain.
//!
//! Selection precedence at call time: metadata override > routing chain >
//! environment default model. An empty result is a fatal config error.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{LlmErrorKind, LocPipeError, Result};

/// Sampling and output shape parameters resolved per step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct StepRoute {
    #[serde(default)]
    default: Option<String>,
    #[serde(default)]
    fallback: Vec<String>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    response_format: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ModelCapabilities {
    #[serde(default)]
    batch: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FallbackTriggers {
    #[serde(default)]
    on_timeout: bool,
    #[serde(default)]
    on_network_error: bool,
    #[serde(default)]
    on_parse_error: bool,
    #[serde(default)]
    http_codes: Vec<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RoutingFile {
    #[serde(default)]
    routing: HashMap<String, StepRoute>,
    #[serde(default)]
    capabilities: HashMap<String, ModelCapabilities>,
    #[serde(default)]
    fallback_triggers: Option<FallbackTriggers>,
}

/// Routing table with capability and fallback rules.
pub struct ModelRouter {
    config: Option<RoutingFile>,
    config_hash: Option<String>,
}

impl ModelRouter {
    /// Load a routing YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            LocPipeError::Config(format!("cannot read routing config {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    /// Parse a routing table from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: RoutingFile = serde_yaml::from_str(text)?;
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let hash = format!("sha256:{}", &hex::encode(hasher.finalize())[..16]);
        Ok(Self {
            config: Some(config),
            config_hash: Some(hash),
        })
    }

    /// A router with no table: every chain is empty and fallback follows
    /// the error's own retry hint.
    pub fn disabled() -> Self {
        Self {
            config: None,
            config_hash: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.is_some()
    }

    /// Stable digest of the loaded table, for trace emission.
    pub fn config_hash(&self) -> Option<&str> {
        self.config_hash.as_deref()
    }

    fn step_route(&self, step: &str) -> Option<&StepRoute> {
        let config = self.config.as_ref()?;
        config
            .routing
            .get(step)
            .or_else(|| config.routing.get("_default"))
    }

    /// `[default, fallback...]` for a step; `_default` covers unlisted
    /// steps; empty without a table.
    pub fn chain(&self, step: &str) -> Vec<String> {
        let Some(route) = self.step_route(step) else {
            return Vec::new();
        };
        let mut chain = Vec::new();
        if let Some(default) = &route.default {
            chain.push(default.clone());
        }
        chain.extend(route.fallback.iter().cloned());
        chain
    }

    /// The step's default model, if any.
    pub fn default_model(&self, step: &str) -> Option<String> {
        self.chain(step).into_iter().next()
    }

    /// Resolve the model chain for a call, honoring the precedence
    /// metadata override > routing chain > environment default.
    pub fn resolve_chain(
        &self,
        step: &str,
        model_override: Option<&str>,
        env_default: Option<&str>,
    ) -> Result<Vec<String>> {
        if let Some(model) = model_override {
            return Ok(vec![model.to_string()]);
        }
        let chain = self.chain(step);
        if !chain.is_empty() {
            return Ok(chain);
        }
        if let Some(model) = env_default {
            if !model.is_empty() {
                return Ok(vec![model.to_string()]);
            }
        }
        Err(LocPipeError::Config(format!(
            "no model configured for step '{}'; set LLM_MODEL or add a routing entry",
            step
        )))
    }

    /// Whether an error should advance the chain to the next model.
    pub fn should_fallback(&self, err: &LocPipeError) -> bool {
        let LocPipeError::Llm {
            kind,
            retryable,
            http_status,
            ..
        } = err
        else {
            return false;
        };

        let Some(triggers) = self
            .config
            .as_ref()
            .and_then(|c| c.fallback_triggers.as_ref())
        else {
            // No configuration: follow the error's own hint.
            return *retryable;
        };

        match kind {
            LlmErrorKind::Timeout if triggers.on_timeout => return true,
            LlmErrorKind::Network if triggers.on_network_error => return true,
            LlmErrorKind::Parse if triggers.on_parse_error => return true,
            _ => {}
        }
        if let Some(status) = http_status {
            if triggers.http_codes.contains(status) {
                return true;
            }
        }
        false
    }

    /// Whether a model may take batched requests. Unknown models default
    /// to capable.
    pub fn batch_capable(&self, model: &str) -> bool {
        self.config
            .as_ref()
            .and_then(|c| c.capabilities.get(model))
            .and_then(|caps| caps.batch.as_deref())
            .map(|b| b != "unfit")
            .unwrap_or(true)
    }

    /// Generation parameters for a step (empty when unconfigured).
    pub fn generation_params(&self, step: &str) -> GenerationParams {
        let Some(route) = self.step_route(step) else {
            return GenerationParams::default();
        };
        GenerationParams {
            temperature: route.temperature,
            max_tokens: route.max_tokens,
            response_format: route.response_format.clone(),
        }
    }
}
