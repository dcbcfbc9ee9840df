//! Model pricing book.
//!
//! Resolves a model name to cost per call under one of two billing modes:
//! straight per-1M-token prices, or the gateway's multiplier scheme where
//! a conversion rate and per-model multipliers are folded over an
//! effective token count. The multiplier formula is kept literal; the
//! ratios are not normalized.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{LocPipeError, Result};

/// How costs are derived from token counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingMode {
    #[serde(rename = "per_1m")]
    Per1m,
    Multiplier,
}

impl Default for BillingMode {
    fn default() -> Self {
        BillingMode::Per1m
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelPricing {
    #[serde(default, rename = "input_per_1M")]
    pub input_per_1m: Option<f64>,
    #[serde(default, rename = "output_per_1M")]
    pub output_per_1m: Option<f64>,
    #[serde(default)]
    pub prompt_mult: Option<f64>,
    #[serde(default)]
    pub completion_mult: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RateRatio {
    new: f64,
    old: f64,
}

impl Default for RateRatio {
    fn default() -> Self {
        Self { new: 1.0, old: 1.0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct BillingSection {
    mode: BillingMode,
    recharge_rate: RateRatio,
    group_rate: RateRatio,
    user_group_multiplier: f64,
    token_divisor: f64,
}

impl Default for BillingSection {
    fn default() -> Self {
        Self {
            mode: BillingMode::Per1m,
            recharge_rate: RateRatio::default(),
            group_rate: RateRatio::default(),
            user_group_multiplier: 1.0,
            token_divisor: 500_000.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SurchargeSection {
    per_request_usd: f64,
    percent_markup: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct PricingFile {
    billing: BillingSection,
    models: HashMap<String, ModelPricing>,
    surcharges: SurchargeSection,
}

/// Loaded pricing table plus billing/surcharge configuration.
pub struct PricingBook {
    file: PricingFile,
    warnings: Vec<String>,
}

impl PricingBook {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            LocPipeError::Config(format!("cannot read pricing config {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let file: PricingFile = serde_yaml::from_str(text)?;
        let mut warnings = Vec::new();
        for (model, pricing) in &file.models {
            let has_per_1m = pricing.input_per_1m.is_some() || pricing.output_per_1m.is_some();
            let has_mult = pricing.prompt_mult.is_some();
            if !has_per_1m && !has_mult {
                warnings.push(format!("[pricing_warning] model={} has no prices", model));
            }
        }
        Ok(Self { file, warnings })
    }

    /// An empty book: every model is unknown and costs zero.
    pub fn empty() -> Self {
        Self {
            file: PricingFile::default(),
            warnings: Vec::new(),
        }
    }

    pub fn mode(&self) -> BillingMode {
        self.file.billing.mode
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn is_known(&self, model: &str) -> bool {
        self.file.models.contains_key(model)
    }

    pub fn model_count(&self) -> usize {
        self.file.models.len()
    }

    /// The conversion rate used by the multiplier mode:
    /// `(new_recharge/old_recharge) × (new_group/old_group)`.
    fn conversion_rate(&self) -> f64 {
        let billing = &self.file.billing;
        (billing.recharge_rate.new / billing.recharge_rate.old.max(0.001))
            * (billing.group_rate.new / billing.group_rate.old.max(0.001))
    }

    /// Cost of one call in USD, surcharges applied. Unknown models cost
    /// only the surcharges; callers detect them via [`Self::is_known`].
    pub fn cost_for(&self, model: &str, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        let pricing = self.file.models.get(model);
        let pt = prompt_tokens as f64;
        let ct = completion_tokens as f64;

        let mut cost = 0.0;
        match self.file.billing.mode {
            BillingMode::Multiplier => {
                if let Some(p) = pricing {
                    let prompt_mult = p.prompt_mult.unwrap_or(0.0);
                    let completion_mult = p.completion_mult.unwrap_or(1.0);
                    let effective_tokens = pt + ct * completion_mult;
                    cost = self.conversion_rate()
                        * self.file.billing.user_group_multiplier
                        * prompt_mult
                        * effective_tokens
                        / self.file.billing.token_divisor;
                }
            }
            BillingMode::Per1m => {
                if let Some(p) = pricing {
                    if let Some(input) = p.input_per_1m {
                        cost += pt / 1_000_000.0 * input;
                    }
                    if let Some(output) = p.output_per_1m {
                        cost += ct / 1_000_000.0 * output;
                    }
                }
            }
        }

        cost += self.file.surcharges.per_request_usd;
        cost * (1.0 + self.file.surcharges.percent_markup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PER_1M_YAML: &str = r#"
billing:
  mode: per_1m
models:
  model-cheap:
    input_per_1M: 0.25
    output_per_1M: 1.25
  model-strong:
    input_per_1M: 3.0
    output_per_1M: 15.0
"#;

    const MULTIPLIER_YAML: &str = r#"
billing:
  mode: multiplier
  recharge_rate: {new: 2.0, old: 1.0}
  group_rate: {new: 1.5, old: 1.0}
  user_group_multiplier: 2.0
  token_divisor: 500000
models:
  model-m:
    prompt_mult: 3.0
    completion_mult: 4.0
"#;

    #[test]
    fn test_per_1m_cost() {
        let book = PricingBook::from_yaml(PER_1M_YAML).unwrap();
        // 1M prompt + 1M completion tokens.
        let cost = book.cost_for("model-cheap", 1_000_000, 1_000_000);
        assert!((cost - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_multiplier_cost_literal_formula() {
        let book = PricingBook::from_yaml(MULTIPLIER_YAML).unwrap();
        // conversion = (2/1)*(1.5/1) = 3; effective = 1000 + 500*4 = 3000
        // cost = 3 * 2 * 3 * 3000 / 500000 = 0.108
        let cost = book.cost_for("model-m", 1000, 500);
        assert!((cost - 0.108).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_costs_zero() {
        let book = PricingBook::from_yaml(PER_1M_YAML).unwrap();
        assert_eq!(book.cost_for("mystery", 1_000_000, 1_000_000), 0.0);
        assert!(!book.is_known("mystery"));
        assert!(book.is_known("model-cheap"));
    }

    #[test]
    fn test_surcharges() {
        let yaml = r#"
billing:
  mode: per_1m
models:
  m:
    input_per_1M: 1.0
    output_per_1M: 1.0
surcharges:
  per_request_usd: 0.01
  percent_markup: 0.10
"#;
        let book = PricingBook::from_yaml(yaml).unwrap();
        // Base: 1.0 + 1.0 = 2.0; +0.01 then ×1.1 = 2.211
        let cost = book.cost_for("m", 1_000_000, 1_000_000);
        assert!((cost - 2.211).abs() < 1e-9);
    }

    #[test]
    fn test_cost_additive_over_disjoint_calls() {
        let book = PricingBook::from_yaml(PER_1M_YAML).unwrap();
        let whole = book.cost_for("model-strong", 2000, 1000);
        let parts = book.cost_for("model-strong", 1200, 400) + book.cost_for("model-strong", 800, 600);
        assert!((whole - parts).abs() < 1e-9);
        assert!(whole >= 0.0);
    }

    #[test]
    fn test_missing_prices_warn() {
        let yaml = r#"
models:
  no-price-model: {}
"#;
        let book = PricingBook::from_yaml(yaml).unwrap();
        assert_eq!(book.warnings().len(), 1);
        assert!(book.warnings()[0].contains("no-price-model"));
    }

    #[test]
    fn test_default_mode_is_per_1m() {
        let book = PricingBook::from_yaml("models: {}").unwrap();
        assert_eq!(book.mode(), BillingMode::Per1m);
    }

    #[test]
    fn test_empty_book() {
        let book = PricingBook::empty();
        assert_eq!(book.model_count(), 0);
        assert_eq!(book.cost_for("anything", 100, 100), 0.0);
    }
}
