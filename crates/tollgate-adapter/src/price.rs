use std::collections::HashMap;

use crate::error::{ErrorKind, RelayError};
use crate::info::{RelayInfo, RelayMode};

/// Per-model pricing in quota units per token (and per call).
#[derive(Debug, Clone, Copy)]
pub struct ModelPrice {
    pub input_per_token: f64,
    pub output_per_token: f64,
    pub per_call: i64,
}

impl Default for ModelPrice {
    fn default() -> Self {
        Self {
            input_per_token: 0.05,
            output_per_token: 0.1,
            per_call: 0,
        }
    }
}

/// Cost plan for one request, fixed before the first attempt.
#[derive(Debug, Clone)]
pub struct PriceData {
    pub input_per_token: f64,
    pub output_per_token: f64,
    pub per_call: i64,
    pub group_ratio: f64,
    /// Upper-bound hold debited before dispatch.
    pub should_pre_consumed_quota: i64,
}

impl PriceData {
    /// Actual cost from observed token counts.
    pub fn final_quota(&self, prompt_tokens: i64, completion_tokens: i64) -> i64 {
        let raw = prompt_tokens as f64 * self.input_per_token
            + completion_tokens as f64 * self.output_per_token;
        ((raw * self.group_ratio).ceil() as i64 + self.per_call).max(0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PriceTable {
    models: HashMap<String, ModelPrice>,
    default_price: ModelPrice,
    group_ratios: HashMap<String, f64>,
}

/// Assumed completion budget when the request does not bound its output.
const DEFAULT_COMPLETION_ESTIMATE: i64 = 1000;

impl PriceTable {
    pub fn new(
        models: HashMap<String, ModelPrice>,
        default_price: ModelPrice,
        group_ratios: HashMap<String, f64>,
    ) -> Self {
        Self {
            models,
            default_price,
            group_ratios,
        }
    }

    pub fn set_model_price(&mut self, model: impl Into<String>, price: ModelPrice) {
        self.models.insert(model.into(), price);
    }

    pub fn set_group_ratio(&mut self, group: impl Into<String>, ratio: f64) {
        self.group_ratios.insert(group.into(), ratio);
    }

    /// Build the cost plan. The hold covers the prompt, the per-call
    /// surcharge, and an estimated completion so a streamed response cannot
    /// drive the balance below zero before settlement.
    pub fn price_data(
        &self,
        info: &RelayInfo,
        prompt_tokens: i64,
        max_output_tokens: Option<i64>,
    ) -> Result<PriceData, RelayError> {
        let price = self
            .models
            .get(&info.original_model)
            .copied()
            .unwrap_or(self.default_price);
        let group_ratio = self.group_ratios.get(&info.group).copied().unwrap_or(1.0);
        if price.input_per_token < 0.0 || price.output_per_token < 0.0 || group_ratio < 0.0 {
            return Err(RelayError::new(
                ErrorKind::ModelPriceError,
                format!("negative price configured for model {}", info.original_model),
            ));
        }

        let completion_estimate = match info.mode {
            RelayMode::Embeddings | RelayMode::Rerank => 0,
            _ => max_output_tokens.unwrap_or(DEFAULT_COMPLETION_ESTIMATE),
        };
        let raw = prompt_tokens as f64 * price.input_per_token
            + completion_estimate as f64 * price.output_per_token;
        let hold = ((raw * group_ratio).ceil() as i64 + price.per_call).max(0);

        Ok(PriceData {
            input_per_token: price.input_per_token,
            output_per_token: price.output_per_token,
            per_call: price.per_call,
            group_ratio,
            should_pre_consumed_quota: hold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::RelayFormat;

    fn info(mode: RelayMode, group: &str) -> RelayInfo {
        let mut info = RelayInfo::new("r".into(), RelayFormat::OpenAI, mode, "gpt-x".into());
        info.group = group.to_string();
        info
    }

    #[test]
    fn hold_covers_prompt_and_estimated_completion() {
        let mut table = PriceTable::default();
        table.set_model_price(
            "gpt-x",
            ModelPrice {
                input_per_token: 0.1,
                output_per_token: 0.2,
                per_call: 5,
            },
        );
        let data = table
            .price_data(&info(RelayMode::ChatCompletions, "default"), 100, Some(50))
            .unwrap();
        // 100*0.1 + 50*0.2 = 20, +5 per call
        assert_eq!(data.should_pre_consumed_quota, 25);
    }

    #[test]
    fn embeddings_hold_skips_completion_estimate() {
        let table = PriceTable::default();
        let data = table
            .price_data(&info(RelayMode::Embeddings, "default"), 40, None)
            .unwrap();
        assert_eq!(data.should_pre_consumed_quota, 2); // ceil(40 * 0.05)
    }

    #[test]
    fn group_ratio_scales_cost() {
        let mut table = PriceTable::default();
        table.set_group_ratio("vip", 0.5);
        let full = table
            .price_data(&info(RelayMode::Embeddings, "default"), 100, None)
            .unwrap();
        let discounted = table
            .price_data(&info(RelayMode::Embeddings, "vip"), 100, None)
            .unwrap();
        assert_eq!(full.should_pre_consumed_quota, 5);
        assert_eq!(discounted.should_pre_consumed_quota, 3); // ceil(5 * 0.5)
    }

    #[test]
    fn final_quota_uses_observed_counts() {
        let data = PriceData {
            input_per_token: 0.1,
            output_per_token: 0.2,
            per_call: 0,
            group_ratio: 1.0,
            should_pre_consumed_quota: 100,
        };
        assert_eq!(data.final_quota(10, 5), 2);
    }
}
