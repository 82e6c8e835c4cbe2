use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Money;
use super::money::MICROS_PER_MILLI;

/// Rates are held per 1000 tokens so sub-micro per-token prices stay exact.
const TOKENS_PER_RATE_UNIT: u128 = 1_000;

#[derive(Clone, Debug, Default)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelPricing {
    pub micros_per_1k_tokens: u64,
}

/// Price entry as written in configuration: either field may be used.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelRateConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_per_token: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_per_1k_tokens: Option<f64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("unsupported model: {model}")]
    UnsupportedModel { model: String },
    #[error("invalid pricing entry for model {model}: missing cost_per_token/cost_per_1k_tokens")]
    MissingCost { model: String },
    #[error("invalid pricing entry for model {model}: invalid cost value")]
    InvalidCostValue { model: String },
}

impl PricingTable {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_model(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.models.insert(model.into(), pricing);
        self
    }

    pub fn from_rates(rates: &BTreeMap<String, ModelRateConfig>) -> Result<Self, PricingError> {
        let mut models = HashMap::new();
        for (model, rate) in rates {
            let per_1k = rate
                .cost_per_1k_tokens
                .or_else(|| rate.cost_per_token.map(|per_token| per_token * 1000.0))
                .ok_or_else(|| PricingError::MissingCost {
                    model: model.clone(),
                })?;
            let micros_per_1k_tokens = units_to_micros(per_1k, model)?;
            models.insert(
                model.clone(),
                ModelPricing {
                    micros_per_1k_tokens,
                },
            );
        }
        Ok(Self { models })
    }

    pub fn model_pricing(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model)
    }

    #[cfg(test)]
    pub fn models(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.models.keys().map(String::as_str).collect();
        out.sort_unstable();
        out
    }

    /// Charge for `total_tokens` of `model`, rounded half-up to 1/1000 of a unit.
    pub fn cost(&self, model: &str, total_tokens: u64) -> Result<Money, PricingError> {
        let pricing = self
            .model_pricing(model)
            .ok_or_else(|| PricingError::UnsupportedModel {
                model: model.to_string(),
            })?;
        Ok(pricing.cost(total_tokens))
    }
}

impl ModelPricing {
    #[cfg(test)]
    pub fn per_token(micros_per_token: u64) -> Self {
        Self {
            micros_per_1k_tokens: micros_per_token.saturating_mul(1000),
        }
    }

    pub fn cost(&self, total_tokens: u64) -> Money {
        // micros * 1000, so one milli-unit is 10^6 of these.
        let scaled = u128::from(total_tokens) * u128::from(self.micros_per_1k_tokens);
        let per_milli = TOKENS_PER_RATE_UNIT * MICROS_PER_MILLI as u128;
        let millis = (scaled + per_milli / 2) / per_milli;
        let millis = i64::try_from(millis).unwrap_or(i64::MAX / MICROS_PER_MILLI);
        Money::from_millis(millis)
    }
}

fn units_to_micros(units: f64, model: &str) -> Result<u64, PricingError> {
    if !units.is_finite() || units < 0.0 {
        return Err(PricingError::InvalidCostValue {
            model: model.to_string(),
        });
    }
    let micros = (units * 1_000_000.0).round();
    if !micros.is_finite() || micros < 0.0 {
        return Err(PricingError::InvalidCostValue {
            model: model.to_string(),
        });
    }
    let micros = if micros > u64::MAX as f64 {
        u64::MAX
    } else {
        micros as u64
    };
    Ok(micros)
}
