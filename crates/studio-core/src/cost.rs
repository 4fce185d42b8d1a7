//! Cost estimation from provider token usage.

use crate::types::{CostDetails, Usage};

/// USD per text input token ($5 / 1M)
const COST_PER_TEXT_INPUT_TOKEN: f64 = 0.000_005;
/// USD per image input token ($10 / 1M)
const COST_PER_IMAGE_INPUT_TOKEN: f64 = 0.000_01;
/// USD per image output token ($40 / 1M)
const COST_PER_IMAGE_OUTPUT_TOKEN: f64 = 0.000_04;

/// Estimate the spend for one batch. Returns `None` without usage data.
pub fn calculate_api_cost(usage: Option<&Usage>) -> Option<CostDetails> {
    let usage = usage?;

    let (text_input_tokens, image_input_tokens) = match &usage.input_tokens_details {
        Some(details) => (details.text_tokens, details.image_tokens),
        // Providers that only report a total are billed as text
        None => (usage.input_tokens, 0),
    };
    let image_output_tokens = usage.output_tokens;

    let raw = text_input_tokens as f64 * COST_PER_TEXT_INPUT_TOKEN
        + image_input_tokens as f64 * COST_PER_IMAGE_INPUT_TOKEN
        + image_output_tokens as f64 * COST_PER_IMAGE_OUTPUT_TOKEN;

    Some(CostDetails {
        estimated_cost_usd: (raw * 10_000.0).round() / 10_000.0,
        text_input_tokens,
        image_input_tokens,
        image_output_tokens,
    })
}
