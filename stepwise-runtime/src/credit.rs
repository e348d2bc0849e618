//! Token-to-credit pricing.

use crate::types::TokenUsage;
use serde::{Deserialize, Serialize};

/// Converts token usage into a credit amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditPricing {
    pub tokens_per_credit: u64,
    pub minimum_charge: i64,
}

impl Default for CreditPricing {
    fn default() -> Self {
        Self {
            tokens_per_credit: 1000,
            minimum_charge: 1,
        }
    }
}

impl CreditPricing {
    /// `max(minimum_charge, ceil(total / tokens_per_credit))`, or 0 for no usage.
    pub fn credits_for(&self, usage: &TokenUsage) -> i64 {
        if usage.total_tokens == 0 {
            return 0;
        }
        let per_credit = self.tokens_per_credit.max(1);
        let credits = usage.total_tokens.div_ceil(per_credit);
        i64::try_from(credits)
            .unwrap_or(i64::MAX)
            .max(self.minimum_charge)
    }
}
