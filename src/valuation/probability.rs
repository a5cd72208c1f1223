//! Probability that governs a holding's mark-to-market value

use bigdecimal::BigDecimal;

use crate::types::{MarketMechanism, MarketSnapshot};

/// Where the probability for a holding came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GoverningProbability {
    /// The holding's sub-outcome had its own probability
    SubOutcome(BigDecimal),
    /// Fell back to the market-level probability
    Market(BigDecimal),
}

impl GoverningProbability {
    /// Pick the probability for a holding on `answer_id` in `market`.
    ///
    /// Multi-outcome markets use the sub-outcome's probability when one is
    /// recorded and the market's own probability otherwise. The choice is made
    /// per holding, so answers of the same market may resolve differently.
    /// Returns `None` when neither is available.
    pub fn lookup(market: &MarketSnapshot, answer_id: Option<&str>) -> Option<Self> {
        if market.mechanism == MarketMechanism::MultiOutcome {
            let answer_prob = answer_id
                .and_then(|id| market.answer_probabilities.get(id))
                .and_then(|prob| prob.as_ref());
            if let Some(prob) = answer_prob {
                return Some(GoverningProbability::SubOutcome(prob.clone()));
            }
        }
        market
            .probability
            .as_ref()
            .map(|prob| GoverningProbability::Market(prob.clone()))
    }

    pub fn value(&self) -> &BigDecimal {
        match self {
            GoverningProbability::SubOutcome(prob) | GoverningProbability::Market(prob) => prob,
        }
    }

    /// `yes × p + no × (1 − p)`
    pub fn position_value(&self, yes_shares: &BigDecimal, no_shares: &BigDecimal) -> BigDecimal {
        let prob = self.value();
        let complement = BigDecimal::from(1) - prob;
        yes_shares * prob + no_shares * &complement
    }
}
