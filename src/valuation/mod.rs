//! Position valuation: unrealized value of open market positions

pub mod probability;

pub use probability::GoverningProbability;

use bigdecimal::BigDecimal;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::LedgerConfig;
use crate::ledger::transaction::within;
use crate::traits::PositionStorage;
use crate::types::*;

/// Computes each user's mark-to-market exposure from their share holdings
pub struct PositionValuationEngine<P: PositionStorage> {
    storage: P,
    store_timeout: Duration,
}

impl<P: PositionStorage> PositionValuationEngine<P> {
    pub fn new(storage: P) -> Self {
        Self {
            storage,
            store_timeout: LedgerConfig::default().store_timeout(),
        }
    }

    /// Apply the store timeout from `config`
    pub fn configure(mut self, config: &LedgerConfig) -> Self {
        self.store_timeout = config.store_timeout();
        self
    }

    /// [`Self::compute_invested_value_within`] using the configured store timeout
    pub async fn compute_invested_value(
        &self,
        user_ids: &[String],
    ) -> LedgerResult<HashMap<String, BigDecimal>> {
        self.compute_invested_value_within(user_ids, self.store_timeout)
            .await
    }

    /// Sum of unrealized value per user across open positions in unresolved markets.
    ///
    /// Every requested user gets an entry; users without open positions map to
    /// zero. The whole batch is served by two grouped reads (holdings, then
    /// markets) regardless of how many users are asked for. Missing markets and
    /// markets with no usable probability contribute nothing. Both reads share
    /// one deadline of `timeout`, after which `Timeout` is returned.
    pub async fn compute_invested_value_within(
        &self,
        user_ids: &[String],
        timeout: Duration,
    ) -> LedgerResult<HashMap<String, BigDecimal>> {
        let users: BTreeSet<&String> = user_ids.iter().collect();
        let mut values: HashMap<String, BigDecimal> = users
            .iter()
            .map(|id| ((*id).clone(), BigDecimal::from(0)))
            .collect();
        if values.is_empty() {
            return Ok(values);
        }

        let deadline = Instant::now() + timeout;
        let unique_users: Vec<String> = users.into_iter().cloned().collect();
        let holdings = within(deadline, timeout, self.storage.open_holdings(&unique_users)).await?;

        let market_ids: Vec<String> = holdings
            .iter()
            .map(|h| h.market_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let markets: HashMap<String, MarketSnapshot> = if market_ids.is_empty() {
            HashMap::new()
        } else {
            within(deadline, timeout, self.storage.market_snapshots(&market_ids))
                .await?
                .into_iter()
                .map(|m| (m.id.clone(), m))
                .collect()
        };

        for holding in &holdings {
            let Some(total) = values.get_mut(&holding.user_id) else {
                continue;
            };
            if let Some(value) = value_holding(holding, markets.get(&holding.market_id)) {
                *total += value;
            }
        }

        debug!(
            users = values.len(),
            holdings = holdings.len(),
            markets = markets.len(),
            "computed invested values"
        );
        Ok(values)
    }
}

/// Unrealized value of a single holding, or `None` if it does not count.
pub fn value_holding(holding: &Holding, market: Option<&MarketSnapshot>) -> Option<BigDecimal> {
    if !holding.has_shares {
        return None;
    }
    let market = market?;
    if market.resolved {
        return None;
    }

    match GoverningProbability::lookup(market, holding.answer_id.as_deref()) {
        Some(prob) => Some(prob.position_value(&holding.yes_shares, &holding.no_shares)),
        None => {
            warn!(
                market = %market.id,
                answer = ?holding.answer_id,
                user = %holding.user_id,
                "no probability recorded, holding valued at zero"
            );
            None
        }
    }
}
