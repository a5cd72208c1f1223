//! Main ledger orchestrator that coordinates accounts, transfers and valuation

use bigdecimal::BigDecimal;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{DeploymentConfig, LedgerConfig};
use crate::ledger::validator::{validate_transfer, AuthContext, Capabilities, ValidatedTransfer};
use crate::ledger::{patterns, AccountManager, TransferEngine};
use crate::traits::*;
use crate::types::*;
use crate::valuation::PositionValuationEngine;

/// Main ledger system that orchestrates all monetary operations
pub struct Ledger<S: LedgerStorage + PositionStorage> {
    account_manager: AccountManager<S>,
    transfer_engine: TransferEngine<S>,
    valuation: PositionValuationEngine<S>,
    deployment: DeploymentConfig,
}

impl<S: LedgerStorage + PositionStorage + Clone> Ledger<S> {
    /// Create a new ledger with the given storage backend and default configuration
    pub fn new(storage: S) -> Self {
        Self::with_config(storage, LedgerConfig::default())
    }

    /// Create a new ledger with explicit configuration
    pub fn with_config(storage: S, config: LedgerConfig) -> Self {
        Self::with_validator(storage, config, Box::new(DefaultTransferValidator))
    }

    /// Create a new ledger with a custom transfer validator
    pub fn with_validator(
        storage: S,
        config: LedgerConfig,
        validator: Box<dyn TransferValidator>,
    ) -> Self {
        Self {
            account_manager: AccountManager::new(storage.clone()),
            transfer_engine: TransferEngine::with_validator(storage.clone(), validator)
                .configure(&config),
            valuation: PositionValuationEngine::new(storage).configure(&config),
            deployment: config.deployment,
        }
    }

    /// Capabilities granted by this deployment
    pub fn capabilities(&self) -> Capabilities {
        self.deployment.capabilities()
    }

    /// Auth context for an authenticated caller on this deployment
    pub fn auth_for(&self, caller_id: impl Into<String>) -> AuthContext {
        AuthContext::for_caller(caller_id, self.capabilities())
    }

    // Account operations
    /// Open the authority account for `token` if it does not exist yet
    pub async fn init_authority(&self, token: CurrencyToken) -> LedgerResult<Account> {
        self.account_manager.ensure_authority(token).await
    }

    /// Open the account for a newly created user, in the deployment's default token
    pub async fn open_user_account(&self, user_id: &str) -> LedgerResult<Account> {
        self.account_manager
            .open_account(AccountRef::user(user_id), self.deployment.default_token)
            .await
    }

    /// Open the liquidity pool account for a newly created market
    pub async fn open_market_pool(&self, market_id: &str) -> LedgerResult<Account> {
        self.account_manager
            .open_account(
                AccountRef::market_pool(market_id),
                self.deployment.default_token,
            )
            .await
    }

    /// Open an account of any kind in a specific token
    pub async fn open_account(
        &self,
        account_ref: AccountRef,
        token: CurrencyToken,
    ) -> LedgerResult<Account> {
        self.account_manager.open_account(account_ref, token).await
    }

    /// Get an account by reference
    pub async fn get_account(&self, account_ref: &AccountRef) -> LedgerResult<Option<Account>> {
        self.account_manager.get_account(account_ref).await
    }

    /// Resolve an account, failing with `AccountNotFound` if it does not exist
    pub async fn resolve_account(&self, account_ref: &AccountRef) -> LedgerResult<Account> {
        self.account_manager.resolve(account_ref).await
    }

    /// List accounts, optionally by kind
    pub async fn list_accounts(&self, kind: Option<AccountKind>) -> LedgerResult<Vec<Account>> {
        self.account_manager.list_accounts(kind).await
    }

    /// Current balance of an account
    pub async fn get_balance(&self, account_ref: &AccountRef) -> LedgerResult<BigDecimal> {
        Ok(self.resolve_account(account_ref).await?.balance)
    }

    // Transfer operations
    /// Run every validation step without applying anything
    pub async fn validate_transfer(
        &self,
        request: &TransferRequest,
        auth: &AuthContext,
    ) -> LedgerResult<ValidatedTransfer> {
        let mut uow = self.account_manager.storage.begin().await?;
        validate_transfer(
            self.transfer_engine.validator(),
            uow.as_mut(),
            request,
            auth,
        )
        .await
    }

    /// Apply a transfer atomically
    pub async fn apply_transfer(
        &self,
        request: &TransferRequest,
        auth: &AuthContext,
    ) -> LedgerResult<TransactionRecord> {
        self.transfer_engine.apply_transfer(request, auth).await
    }

    /// Apply a transfer atomically with a caller-supplied timeout
    pub async fn apply_transfer_within(
        &self,
        request: &TransferRequest,
        auth: &AuthContext,
        timeout: Duration,
    ) -> LedgerResult<TransactionRecord> {
        self.transfer_engine
            .apply_transfer_within(request, auth, timeout)
            .await
    }

    /// Mint a free deposit to the calling user. Only works where minting is enabled.
    pub async fn add_free_deposit(
        &self,
        auth: &AuthContext,
        amount: BigDecimal,
    ) -> LedgerResult<TransactionRecord> {
        let user_id = auth.caller_id.as_deref().ok_or_else(|| {
            LedgerError::PermissionDenied("free deposits need an authenticated caller".to_string())
        })?;
        let request = patterns::free_deposit(user_id, amount, self.deployment.default_token)?;
        self.apply_transfer(&request, auth).await
    }

    /// Get a transaction record by ID
    pub async fn get_transaction(&self, id: Uuid) -> LedgerResult<TransactionRecord> {
        self.account_manager
            .storage
            .get_transaction(id)
            .await?
            .ok_or_else(|| LedgerError::TransactionNotFound(id.to_string()))
    }

    /// Records where the account is source or destination, oldest first
    pub async fn account_transactions(
        &self,
        account_ref: &AccountRef,
    ) -> LedgerResult<Vec<TransactionRecord>> {
        self.account_manager
            .storage
            .list_transactions(Some(account_ref))
            .await
    }

    // Valuation
    /// Unrealized value of open positions for each user in the batch
    pub async fn invested_values(
        &self,
        user_ids: &[String],
    ) -> LedgerResult<HashMap<String, BigDecimal>> {
        self.valuation.compute_invested_value(user_ids).await
    }

    /// Invested values, giving up with `Timeout` once `timeout` has elapsed
    pub async fn invested_values_within(
        &self,
        user_ids: &[String],
        timeout: Duration,
    ) -> LedgerResult<HashMap<String, BigDecimal>> {
        self.valuation
            .compute_invested_value_within(user_ids, timeout)
            .await
    }

    /// Validate the integrity of the ledger
    ///
    /// Replays the transaction log and checks every non-authority balance
    /// against it. Run it while no transfers are in flight, otherwise a transfer
    /// committed between the two reads shows up as a mismatch.
    pub async fn validate_integrity(&self) -> LedgerResult<LedgerIntegrityReport> {
        let storage = &self.account_manager.storage;
        let accounts = storage.list_accounts(None).await?;
        let records = storage.list_transactions(None).await?;

        let zero = BigDecimal::from(0);
        let mut expected: HashMap<AccountRef, BigDecimal> = HashMap::new();
        let mut total_minted: HashMap<CurrencyToken, BigDecimal> = HashMap::new();
        let mut total_burned: HashMap<CurrencyToken, BigDecimal> = HashMap::new();

        for record in &records {
            if record.source.is_authority() {
                *total_minted.entry(record.token).or_default() += &record.amount;
            } else {
                *expected.entry(record.source.clone()).or_default() -= &record.amount;
            }
            if record.destination.is_authority() {
                *total_burned.entry(record.token).or_default() += &record.amount;
            } else {
                *expected.entry(record.destination.clone()).or_default() += &record.amount;
            }
        }

        let mut issues = Vec::new();
        let mut circulating: HashMap<CurrencyToken, BigDecimal> = HashMap::new();

        for account in accounts.iter().filter(|a| !a.is_authority()) {
            let replayed = expected
                .remove(&account.account_ref)
                .unwrap_or_else(|| zero.clone());
            if replayed != account.balance {
                issues.push(format!(
                    "{} has balance {} but its transactions add up to {}",
                    account.account_ref, account.balance, replayed
                ));
            }
            if account.balance < zero {
                issues.push(format!(
                    "{} has negative balance {}",
                    account.account_ref, account.balance
                ));
            }
            *circulating.entry(account.token).or_default() += &account.balance;
        }

        for account_ref in expected.keys() {
            issues.push(format!(
                "transactions reference {} which does not exist",
                account_ref
            ));
        }

        for (token, amount) in &circulating {
            let minted = total_minted.get(token).unwrap_or(&zero);
            let burned = total_burned.get(token).unwrap_or(&zero);
            let supply = minted - burned;
            if *amount != supply {
                issues.push(format!(
                    "{} in circulation is {} but minted minus burned is {}",
                    token, amount, supply
                ));
            }
        }

        let report = LedgerIntegrityReport {
            checked_at: chrono::Utc::now().naive_utc(),
            is_valid: issues.is_empty(),
            issues,
            accounts_checked: accounts.len(),
            transactions_checked: records.len(),
            total_minted,
            total_burned,
            circulating,
        };

        if report.is_valid {
            info!(
                accounts = report.accounts_checked,
                transactions = report.transactions_checked,
                "ledger integrity verified"
            );
        } else {
            warn!(issues = report.issues.len(), "ledger integrity check failed");
        }
        Ok(report)
    }
}

/// Report on ledger integrity and validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerIntegrityReport {
    pub checked_at: NaiveDateTime,
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub accounts_checked: usize,
    pub transactions_checked: usize,
    pub total_minted: HashMap<CurrencyToken, BigDecimal>,
    pub total_burned: HashMap<CurrencyToken, BigDecimal>,
    pub circulating: HashMap<CurrencyToken, BigDecimal>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::memory_storage::MemoryStorage;

    fn minting_config() -> LedgerConfig {
        let mut config = LedgerConfig::default();
        config.deployment.minting_enabled = true;
        config
    }

    #[tokio::test]
    async fn test_ledger_basic_operations() {
        let ledger = Ledger::with_config(MemoryStorage::new(), minting_config());
        ledger.init_authority(CurrencyToken::Mana).await.unwrap();
        ledger.open_user_account("alice").await.unwrap();
        ledger.open_user_account("bob").await.unwrap();

        let alice = ledger.auth_for("alice");
        ledger
            .add_free_deposit(&alice, BigDecimal::from(100))
            .await
            .unwrap();

        let request = patterns::user_transfer(
            "alice",
            "bob",
            BigDecimal::from(30),
            CurrencyToken::Mana,
            "lunch",
        )
        .unwrap();
        ledger.apply_transfer(&request, &alice).await.unwrap();

        assert_eq!(
            ledger.get_balance(&AccountRef::user("alice")).await.unwrap(),
            BigDecimal::from(70)
        );
        assert_eq!(
            ledger.get_balance(&AccountRef::user("bob")).await.unwrap(),
            BigDecimal::from(30)
        );

        let history = ledger
            .account_transactions(&AccountRef::user("alice"))
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].category, TransactionCategory::MintDeposit);
        assert_eq!(history[0].description, "Free deposit");
        assert_eq!(history[1].category, TransactionCategory::Transfer);

        let report = ledger.validate_integrity().await.unwrap();
        assert!(report.is_valid, "{:?}", report.issues);
        assert_eq!(report.total_minted[&CurrencyToken::Mana], BigDecimal::from(100));
        assert_eq!(report.circulating[&CurrencyToken::Mana], BigDecimal::from(100));
    }

    #[tokio::test]
    async fn test_free_deposit_needs_caller() {
        let ledger = Ledger::with_config(MemoryStorage::new(), minting_config());
        assert!(matches!(
            ledger
                .add_free_deposit(&AuthContext::anonymous(), BigDecimal::from(1))
                .await,
            Err(LedgerError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_dry_run_validation_writes_nothing() {
        let storage = MemoryStorage::new();
        let ledger = Ledger::with_config(storage.clone(), minting_config());
        ledger.init_authority(CurrencyToken::Mana).await.unwrap();
        ledger.open_user_account("alice").await.unwrap();

        let request =
            patterns::free_deposit("alice", BigDecimal::from(5), CurrencyToken::Mana).unwrap();
        let validated = ledger
            .validate_transfer(&request, &ledger.auth_for("alice"))
            .await
            .unwrap();
        assert_eq!(validated.category, TransactionCategory::MintDeposit);
        assert_eq!(storage.commit_attempts(), 0);
        assert_eq!(
            ledger.get_balance(&AccountRef::user("alice")).await.unwrap(),
            BigDecimal::from(0)
        );
    }

    #[tokio::test]
    async fn test_integrity_detects_tampering() {
        let storage = MemoryStorage::new();
        let ledger = Ledger::new(storage.clone());
        ledger.open_user_account("alice").await.unwrap();

        // a balance that no transaction explains
        let mut uow = storage.begin().await.unwrap();
        let mut account = uow
            .get_account(&AccountRef::user("alice"))
            .await
            .unwrap()
            .unwrap();
        account.balance = BigDecimal::from(42);
        uow.stage_account(account);
        uow.commit().await.unwrap();

        let report = ledger.validate_integrity().await.unwrap();
        assert!(!report.is_valid);
        assert!(report.issues.iter().any(|i| i.contains("user:alice")));
    }

    #[tokio::test]
    async fn test_missing_transaction() {
        let ledger = Ledger::new(MemoryStorage::new());
        assert!(matches!(
            ledger.get_transaction(Uuid::new_v4()).await,
            Err(LedgerError::TransactionNotFound(_))
        ));
    }
}
