//! Transfer processing: the atomic ledger transaction engine

use std::future::Future;
use std::time::Duration;

use bigdecimal::BigDecimal;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{LedgerConfig, RetryConfig};
use crate::ledger::account::resolve_account;
use crate::ledger::validator::AuthContext;
use crate::traits::*;
use crate::types::*;
use crate::utils::validation::{validate_positive_amount, validate_representable};

/// Applies validated transfers as single units of work
pub struct TransferEngine<S: LedgerStorage> {
    storage: S,
    validator: Box<dyn TransferValidator>,
    retry: RetryConfig,
    store_timeout: Duration,
}

impl<S: LedgerStorage> TransferEngine<S> {
    /// Create a new engine with the default validator and configuration
    pub fn new(storage: S) -> Self {
        Self::with_validator(storage, Box::new(DefaultTransferValidator))
    }

    /// Create a new engine with a custom validator
    pub fn with_validator(storage: S, validator: Box<dyn TransferValidator>) -> Self {
        let config = LedgerConfig::default();
        Self {
            storage,
            validator,
            retry: config.retry.clone(),
            store_timeout: config.store_timeout(),
        }
    }

    /// Apply retry and timeout settings from `config`
    pub fn configure(mut self, config: &LedgerConfig) -> Self {
        self.retry = config.retry.clone();
        self.store_timeout = config.store_timeout();
        self
    }

    pub(crate) fn validator(&self) -> &dyn TransferValidator {
        self.validator.as_ref()
    }

    /// Apply a transfer using the configured store timeout
    pub async fn apply_transfer(
        &self,
        request: &TransferRequest,
        auth: &AuthContext,
    ) -> LedgerResult<TransactionRecord> {
        self.apply_transfer_within(request, auth, self.store_timeout)
            .await
    }

    /// Apply a transfer, giving up with `Timeout` once `timeout` has elapsed.
    ///
    /// Either the debit, the credit and the record are all persisted, or none of
    /// them is. Conflicts and store outages are retried with backoff up to the
    /// configured attempt limit; every other error is returned immediately. An
    /// attempt that reached its commit always finishes it before this returns.
    pub async fn apply_transfer_within(
        &self,
        request: &TransferRequest,
        auth: &AuthContext,
        timeout: Duration,
    ) -> LedgerResult<TransactionRecord> {
        let category = self
            .validator
            .validate_request(request, auth)
            .inspect_err(|e| {
                warn!(
                    source = %request.source,
                    destination = %request.destination,
                    amount = %request.amount,
                    error = %e,
                    "transfer rejected"
                );
            })?;
        reject_self_transfer(request)?;

        let deadline = Instant::now() + timeout;
        let mut attempt = 1;
        loop {
            match self.attempt(request, category, deadline, timeout).await {
                Ok(record) => {
                    info!(
                        id = %record.id,
                        source = %record.source,
                        destination = %record.destination,
                        amount = %record.amount,
                        token = %record.token,
                        category = %record.category,
                        attempt,
                        "transfer applied"
                    );
                    return Ok(record);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    if Instant::now() + delay >= deadline {
                        warn!(
                            last_error = %e,
                            attempt,
                            "no time left to retry transfer, giving up with timeout"
                        );
                        return Err(LedgerError::Timeout(timeout));
                    }
                    warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, retrying transfer"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(
                        source = %request.source,
                        destination = %request.destination,
                        amount = %request.amount,
                        error = %e,
                        attempt,
                        "transfer failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// One unit of work. Returning early drops the unit of work, discarding its writes.
    async fn attempt(
        &self,
        request: &TransferRequest,
        category: TransactionCategory,
        deadline: Instant,
        timeout: Duration,
    ) -> LedgerResult<TransactionRecord> {
        let mut uow = within(deadline, timeout, self.storage.begin_until(deadline)).await?;

        let mut source = within(
            deadline,
            timeout,
            resolve_account(uow.as_mut(), &request.source),
        )
        .await?;
        let mut destination = within(
            deadline,
            timeout,
            resolve_account(uow.as_mut(), &request.destination),
        )
        .await?;
        self.validator
            .validate_accounts(request, &source, &destination)?;

        source.debit(&request.amount)?;
        destination.credit(&request.amount);

        let record = TransactionRecord {
            id: Uuid::new_v4(),
            source: request.source.clone(),
            destination: request.destination.clone(),
            amount: request.amount.clone(),
            token: request.token,
            category,
            description: request.description.clone(),
            created_at: chrono::Utc::now().naive_utc(),
            status: TransactionStatus::Applied,
        };

        // authority balances never move and are never staged
        for account in [source, destination] {
            if !account.is_authority() {
                uow.stage_account(account);
            }
        }
        uow.stage_transaction(record.clone());

        // not bounded by the deadline: the commit decision must be reached
        uow.commit().await?;
        debug!(id = %record.id, "unit of work committed");

        Ok(record)
    }
}

/// A transfer whose source is also its destination would debit and credit
/// two copies of one account, and the credit would overwrite the debit.
pub(crate) fn reject_self_transfer(request: &TransferRequest) -> LedgerResult<()> {
    if request.source == request.destination {
        return Err(LedgerError::Validation(format!(
            "source and destination are the same account {}",
            request.source
        )));
    }
    Ok(())
}

pub(crate) async fn within<T, F>(deadline: Instant, budget: Duration, fut: F) -> LedgerResult<T>
where
    F: Future<Output = LedgerResult<T>>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(LedgerError::Timeout(budget)),
    }
}

/// Builder for transfer requests
#[derive(Debug)]
pub struct TransferBuilder {
    request: TransferRequest,
}

impl TransferBuilder {
    /// Start a plain transfer of `amount` from `source` to `destination`
    pub fn new(
        source: AccountRef,
        destination: AccountRef,
        amount: BigDecimal,
        token: CurrencyToken,
    ) -> Self {
        Self {
            request: TransferRequest {
                source,
                destination,
                amount,
                token,
                category: TransactionCategory::Transfer.code().to_string(),
                description: String::new(),
            },
        }
    }

    /// Set the category
    pub fn category(mut self, category: TransactionCategory) -> Self {
        self.request.category = category.code().to_string();
        self
    }

    /// Set the description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.request.description = description.into();
        self
    }

    /// Build the request, checking what can be checked without a store
    pub fn build(self) -> LedgerResult<TransferRequest> {
        validate_positive_amount(&self.request.amount)?;
        validate_representable(&self.request.amount, self.request.token)?;
        Ok(self.request)
    }
}

/// Common transfer patterns
pub mod patterns {
    use super::*;

    /// Authority mints `amount` of `token` into a user's account
    pub fn mint_deposit(
        user_id: &str,
        amount: BigDecimal,
        token: CurrencyToken,
        description: impl Into<String>,
    ) -> LedgerResult<TransferRequest> {
        TransferBuilder::new(
            AccountRef::authority(token),
            AccountRef::user(user_id),
            amount,
            token,
        )
        .category(TransactionCategory::MintDeposit)
        .description(description)
        .build()
    }

    /// Deposit offered to users of self-hosted deployments
    pub fn free_deposit(
        user_id: &str,
        amount: BigDecimal,
        token: CurrencyToken,
    ) -> LedgerResult<TransferRequest> {
        mint_deposit(user_id, amount, token, "Free deposit")
    }

    /// Starting balance for a new user
    pub fn signup_bonus(
        user_id: &str,
        amount: BigDecimal,
        token: CurrencyToken,
    ) -> LedgerResult<TransferRequest> {
        TransferBuilder::new(
            AccountRef::authority(token),
            AccountRef::user(user_id),
            amount,
            token,
        )
        .category(TransactionCategory::SignupBonus)
        .description("Signup bonus")
        .build()
    }

    /// Peer-to-peer transfer between users
    pub fn user_transfer(
        from_user: &str,
        to_user: &str,
        amount: BigDecimal,
        token: CurrencyToken,
        description: impl Into<String>,
    ) -> LedgerResult<TransferRequest> {
        TransferBuilder::new(
            AccountRef::user(from_user),
            AccountRef::user(to_user),
            amount,
            token,
        )
        .description(description)
        .build()
    }

    /// User adds liquidity to a market pool
    pub fn add_liquidity(
        user_id: &str,
        market_id: &str,
        amount: BigDecimal,
        token: CurrencyToken,
    ) -> LedgerResult<TransferRequest> {
        TransferBuilder::new(
            AccountRef::user(user_id),
            AccountRef::market_pool(market_id),
            amount,
            token,
        )
        .category(TransactionCategory::MarketLiquidity)
        .description(format!("Liquidity for market {}", market_id))
        .build()
    }

    /// Market pool pays out a winning position
    pub fn market_settlement(
        market_id: &str,
        user_id: &str,
        amount: BigDecimal,
        token: CurrencyToken,
    ) -> LedgerResult<TransferRequest> {
        TransferBuilder::new(
            AccountRef::market_pool(market_id),
            AccountRef::user(user_id),
            amount,
            token,
        )
        .category(TransactionCategory::MarketSettlement)
        .description(format!("Payout for market {}", market_id))
        .build()
    }

    /// Return currency from a user to the authority, removing it from supply
    pub fn burn(user_id: &str, amount: BigDecimal, token: CurrencyToken) -> LedgerResult<TransferRequest> {
        TransferBuilder::new(
            AccountRef::user(user_id),
            AccountRef::authority(token),
            amount,
            token,
        )
        .category(TransactionCategory::Burn)
        .description("Burn")
        .build()
    }
}
