//! Cost calculation. Three paths, in preference order: authoritative provider
//! usage (exact pricing plus the provider fee), dev/test character estimates,
//! and token-count fallback. Completion tokens are always clamped up to
//! `MINIMUM_OUTPUT_TOKENS` before pricing.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use veil_core::constants::{
    DEFAULT_PROVIDER_FEE_PERCENT, ESTIMATED_CHARS_PER_TOKEN, MINIMUM_OUTPUT_TOKENS,
    RESERVATION_OUTPUT_TOKEN_CEILING,
};
use veil_core::types::{credits_from_dollars, Credits};
use veil_core::VeilError;

/// Provider-reported token counts for one completion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
}

/// Per-model prices in credit units per million tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelPricing {
    pub input_per_million: Credits,
    pub output_per_million: Credits,
    pub cached_per_million: Credits,
}

/// The pricing table, loaded from JSON at startup (`VEIL_PRICING_TABLE`) or
/// built in. Unknown models fall back to the most expensive configured model
/// so mispriced requests err on the side of overcharging a reservation, not
/// undercharging a commit.
#[derive(Clone, Debug)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
    fallback: ModelPricing,
    pub provider_fee_percent: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PricingFileModel {
    input_per_million: String,
    output_per_million: String,
    cached_per_million: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PricingFile {
    models: HashMap<String, PricingFileModel>,
    #[serde(default)]
    provider_fee_percent: Option<u32>,
}

/// Process-wide default table for callers that never configured one.
pub fn default_table() -> &'static PricingTable {
    static TABLE: once_cell::sync::Lazy<PricingTable> =
        once_cell::sync::Lazy::new(PricingTable::builtin);
    &TABLE
}

impl PricingTable {
    /// Built-in defaults used when no table file is configured.
    pub fn builtin() -> Self {
        let mut models = HashMap::new();
        models.insert(
            "swift".to_string(),
            ModelPricing {
                input_per_million: credits_from_dollars("0.25").unwrap(),
                output_per_million: credits_from_dollars("1.25").unwrap(),
                cached_per_million: credits_from_dollars("0.03").unwrap(),
            },
        );
        models.insert(
            "apex".to_string(),
            ModelPricing {
                input_per_million: credits_from_dollars("3").unwrap(),
                output_per_million: credits_from_dollars("15").unwrap(),
                cached_per_million: credits_from_dollars("0.30").unwrap(),
            },
        );
        let fallback = models["apex"];
        Self {
            models,
            fallback,
            provider_fee_percent: DEFAULT_PROVIDER_FEE_PERCENT,
        }
    }

    /// Load from a JSON file of dollar-string prices:
    /// `{"models": {"swift": {"inputPerMillion": "0.25", ...}}, "providerFeePercent": 15}`.
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, VeilError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| VeilError::Internal(format!("pricing table: {e}")))?;
        let file: PricingFile = serde_json::from_str(&raw)
            .map_err(|e| VeilError::Serialization(format!("pricing table: {e}")))?;

        let mut models = HashMap::new();
        for (name, m) in file.models {
            let parse = |s: &str| {
                credits_from_dollars(s).ok_or_else(|| {
                    VeilError::Serialization(format!("pricing table: bad price {s:?}"))
                })
            };
            models.insert(
                name,
                ModelPricing {
                    input_per_million: parse(&m.input_per_million)?,
                    output_per_million: parse(&m.output_per_million)?,
                    cached_per_million: parse(&m.cached_per_million)?,
                },
            );
        }
        let fallback = models
            .values()
            .copied()
            .max_by_key(|p| p.output_per_million)
            .ok_or_else(|| VeilError::Serialization("pricing table: no models".into()))?;
        Ok(Self {
            models,
            fallback,
            provider_fee_percent: file.provider_fee_percent.unwrap_or(DEFAULT_PROVIDER_FEE_PERCENT),
        })
    }

    pub fn pricing_for(&self, model: &str) -> ModelPricing {
        self.models.get(model).copied().unwrap_or(self.fallback)
    }
}

fn price_tokens(pricing: ModelPricing, input: u64, output: u64, cached: u64) -> Credits {
    let output = output.max(MINIMUM_OUTPUT_TOKENS);
    (input as i128 * pricing.input_per_million
        + output as i128 * pricing.output_per_million
        + cached as i128 * pricing.cached_per_million)
        / 1_000_000
}

/// Exact cost from authoritative provider usage, provider fee included.
pub fn cost_from_usage(table: &PricingTable, model: &str, usage: &TokenUsage) -> Credits {
    let raw = price_tokens(
        table.pricing_for(model),
        usage.input_tokens,
        usage.output_tokens,
        usage.cached_tokens,
    );
    raw + raw * table.provider_fee_percent as i128 / 100
}

/// Dev/test estimate from character counts (no provider fee).
pub fn estimate_from_chars(
    table: &PricingTable,
    model: &str,
    prompt_chars: usize,
    completion_chars: usize,
) -> Credits {
    estimate_from_tokens(
        table,
        model,
        prompt_chars as u64 / ESTIMATED_CHARS_PER_TOKEN,
        completion_chars as u64 / ESTIMATED_CHARS_PER_TOKEN,
    )
}

/// Fallback estimate from token counts (no provider fee).
pub fn estimate_from_tokens(
    table: &PricingTable,
    model: &str,
    input_tokens: u64,
    output_tokens: u64,
) -> Credits {
    price_tokens(table.pricing_for(model), input_tokens, output_tokens, 0)
}

/// Worst-case cost reserved before a stream starts: the whole prompt as
/// input plus the output-token ceiling, fee included.
pub fn pessimistic_max_cost(table: &PricingTable, model: &str, prompt_chars: usize) -> Credits {
    let raw = price_tokens(
        table.pricing_for(model),
        prompt_chars as u64 / ESTIMATED_CHARS_PER_TOKEN + 1,
        RESERVATION_OUTPUT_TOKEN_CEILING,
        0,
    );
    raw + raw * table.provider_fee_percent as i128 / 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_cost_includes_provider_fee() {
        let table = PricingTable::builtin();
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 1_000_000,
            cached_tokens: 0,
        };
        let pricing = table.pricing_for("swift");
        let raw = pricing.input_per_million + pricing.output_per_million;
        let expected = raw + raw * 15 / 100;
        assert_eq!(cost_from_usage(&table, "swift", &usage), expected);
    }

    #[test]
    fn output_tokens_clamped_to_minimum() {
        let table = PricingTable::builtin();
        let zero_out = TokenUsage { input_tokens: 10, output_tokens: 0, cached_tokens: 0 };
        let min_out = TokenUsage {
            input_tokens: 10,
            output_tokens: MINIMUM_OUTPUT_TOKENS,
            cached_tokens: 0,
        };
        assert_eq!(
            cost_from_usage(&table, "swift", &zero_out),
            cost_from_usage(&table, "swift", &min_out)
        );
    }

    #[test]
    fn unknown_model_uses_expensive_fallback() {
        let table = PricingTable::builtin();
        let usage = TokenUsage {
            input_tokens: 1000,
            output_tokens: 1000,
            cached_tokens: 0,
        };
        assert_eq!(
            cost_from_usage(&table, "no-such-model", &usage),
            cost_from_usage(&table, "apex", &usage)
        );
    }

    #[test]
    fn estimates_skip_the_fee() {
        let table = PricingTable::builtin();
        let from_chars = estimate_from_chars(&table, "swift", 4000, 4000);
        let from_tokens = estimate_from_tokens(&table, "swift", 1000, 1000);
        assert_eq!(from_chars, from_tokens);

        let usage = TokenUsage { input_tokens: 1000, output_tokens: 1000, cached_tokens: 0 };
        assert!(cost_from_usage(&table, "swift", &usage) > from_tokens);
    }

    #[test]
    fn reservation_bound_dominates_real_cost() {
        let table = PricingTable::builtin();
        let prompt = "x".repeat(2000);
        let reserve = pessimistic_max_cost(&table, "swift", prompt.len());
        let actual = cost_from_usage(
            &table,
            "swift",
            &TokenUsage { input_tokens: 500, output_tokens: 800, cached_tokens: 0 },
        );
        assert!(reserve >= actual);
    }
}
