//! Traits for storage abstraction and extensibility

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use crate::ledger::transaction::reject_self_transfer;
use crate::ledger::validator::AuthContext;
use crate::types::*;
use crate::utils::validation::{validate_positive_amount, validate_representable};

/// Storage abstraction for the ledger
///
/// This trait allows the ledger to work with any ACID-capable backend
/// (PostgreSQL, SQLite, in-memory, etc.). Every balance mutation goes through
/// a [`UnitOfWork`] obtained from [`LedgerStorage::begin`].
#[async_trait]
pub trait LedgerStorage: Send + Sync {
    /// Start a new unit of work
    async fn begin(&self) -> LedgerResult<Box<dyn UnitOfWork>>;

    /// Start a unit of work whose lock waits give up at `deadline`.
    ///
    /// Backends whose waits are already cancellable by dropping the future can
    /// keep this default.
    async fn begin_until(&self, deadline: Instant) -> LedgerResult<Box<dyn UnitOfWork>> {
        let _ = deadline;
        self.begin().await
    }

    /// Persist a freshly opened account. Fails with `DuplicateAccount` if it exists.
    async fn insert_account(&self, account: &Account) -> LedgerResult<()>;

    /// Get an account outside of any unit of work
    async fn get_account(&self, account_ref: &AccountRef) -> LedgerResult<Option<Account>>;

    /// List all accounts, optionally filtered by kind
    async fn list_accounts(&self, kind: Option<AccountKind>) -> LedgerResult<Vec<Account>>;

    /// Get a transaction record by ID
    async fn get_transaction(&self, id: Uuid) -> LedgerResult<Option<TransactionRecord>>;

    /// List transaction records, oldest first, optionally only those touching `account_ref`
    async fn list_transactions(
        &self,
        account_ref: Option<&AccountRef>,
    ) -> LedgerResult<Vec<TransactionRecord>>;
}

/// An isolated group of reads and writes that commits or rolls back as a whole
///
/// Reads observe committed state and remember the version they saw. Writes are
/// staged and only become visible on [`UnitOfWork::commit`], which must fail
/// with `LedgerError::Conflict` if any account read through this unit of work
/// was changed by someone else in the meantime. Dropping a unit of work without
/// committing discards everything staged.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Read an account, preferring a value staged in this unit of work
    async fn get_account(&mut self, account_ref: &AccountRef) -> LedgerResult<Option<Account>>;

    /// Stage the new state of an account previously read in this unit of work
    fn stage_account(&mut self, account: Account);

    /// Stage an append to the transaction log
    fn stage_transaction(&mut self, record: TransactionRecord);

    /// Atomically apply everything staged
    async fn commit(&mut self) -> LedgerResult<()>;
}

/// Read-only access to trading state needed for valuation
///
/// Implementations must answer each call with a single grouped read rather than
/// one query per user or market.
#[async_trait]
pub trait PositionStorage: Send + Sync {
    /// Holdings with `has_shares` set for any of the given users
    async fn open_holdings(&self, user_ids: &[String]) -> LedgerResult<Vec<Holding>>;

    /// Snapshots for the given markets. Unknown market IDs are simply absent.
    async fn market_snapshots(&self, market_ids: &[String]) -> LedgerResult<Vec<MarketSnapshot>>;
}

/// Trait for implementing custom transfer validation rules
pub trait TransferValidator: Send + Sync {
    /// Checks that need no account state, in order: amount, category, minting permission.
    /// Returns the parsed category.
    fn validate_request(
        &self,
        request: &TransferRequest,
        auth: &AuthContext,
    ) -> LedgerResult<TransactionCategory>;

    /// Checks against the resolved source and destination accounts
    fn validate_accounts(
        &self,
        request: &TransferRequest,
        source: &Account,
        destination: &Account,
    ) -> LedgerResult<()>;
}

/// Default transfer validator
pub struct DefaultTransferValidator;

impl TransferValidator for DefaultTransferValidator {
    fn validate_request(
        &self,
        request: &TransferRequest,
        auth: &AuthContext,
    ) -> LedgerResult<TransactionCategory> {
        validate_positive_amount(&request.amount)?;
        validate_representable(&request.amount, request.token)?;

        let category = request.category.parse::<TransactionCategory>()?;

        if request.source.is_authority() && !auth.capabilities.minting {
            return Err(LedgerError::PermissionDenied(format!(
                "minting from {} is not enabled on this deployment",
                request.source
            )));
        }

        reject_self_transfer(request)?;

        Ok(category)
    }

    fn validate_accounts(
        &self,
        request: &TransferRequest,
        source: &Account,
        destination: &Account,
    ) -> LedgerResult<()> {
        for account in [source, destination] {
            if account.token != request.token {
                return Err(LedgerError::CurrencyMismatch {
                    account: account.account_ref.to_string(),
                    expected: request.token,
                    found: account.token,
                });
            }
        }
        Ok(())
    }
}
