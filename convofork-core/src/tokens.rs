//! Token weight estimation
//!
//! Recorded usage counters win. Without them, the weight is estimated from
//! the message's plain text at `chars_per_token` characters per token, plus a
//! fixed overhead when the message invokes a tool.

use crate::config::EstimateConfig;
use crate::types::Message;

/// Estimate the token weight of a single message.
pub fn estimate_tokens(message: &Message, options: &EstimateConfig) -> u64 {
    if let Some(usage) = &message.usage {
        let mut total = usage.input_tokens.saturating_add(usage.output_tokens);
        if options.include_cached_tokens {
            total = total
                .saturating_add(usage.cache_write_tokens)
                .saturating_add(usage.cache_read_tokens);
        }
        return total;
    }

    if !options.estimate_if_missing {
        return 0;
    }

    let chars = message.content.plain_text().chars().count() as u64;
    let mut estimate = chars.div_ceil(options.chars_per_token.max(1));
    if message.content.has_tool_use() {
        estimate = estimate.saturating_add(options.tool_overhead_tokens);
    }
    estimate
}

/// Token weight estimator bound to one set of options
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenEstimator {
    options: EstimateConfig,
}

impl TokenEstimator {
    pub fn new(options: EstimateConfig) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &EstimateConfig {
        &self.options
    }

    pub fn estimate(&self, message: &Message) -> u64 {
        estimate_tokens(message, &self.options)
    }

    /// Sum of the estimates for a sequence of messages, saturating at `u64::MAX`
    pub fn estimate_all<'a, I>(&self, messages: I) -> u64
    where
        I: IntoIterator<Item = &'a Message>,
    {
        messages
            .into_iter()
            .fold(0u64, |total, m| total.saturating_add(self.estimate(m)))
    }
}
