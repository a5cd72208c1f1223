//! In-memory storage implementation for testing

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::traits::*;
use crate::types::*;

type HoldingKey = (String, String, Option<String>);

#[derive(Debug, Default)]
struct MemoryState {
    accounts: HashMap<AccountRef, Account>,
    transactions: Vec<TransactionRecord>,
    holdings: HashMap<HoldingKey, Holding>,
    markets: HashMap<String, MarketSnapshot>,
}

/// Faults to inject into upcoming store calls
#[derive(Debug, Default)]
struct FaultPlan {
    fail_commits: u32,
    conflict_commits: u32,
    unavailable: bool,
    latency: Option<Duration>,
}

/// In-memory storage implementation for testing and development
///
/// Cloning shares the underlying state, so one instance can back several
/// ledgers or tasks at once.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<RwLock<MemoryState>>,
    faults: Arc<Mutex<FaultPlan>>,
    commit_attempts: Arc<AtomicU64>,
    position_reads: Arc<AtomicU64>,
}

impl MemoryStorage {
    /// Create a new memory storage instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail as if the store went away mid-commit
    pub fn fail_next_commits(&self, n: u32) {
        self.faults.lock().fail_commits = n;
    }

    /// Make the next `n` commits report a serialization conflict
    pub fn conflict_next_commits(&self, n: u32) {
        self.faults.lock().conflict_commits = n;
    }

    /// Make every call fail with `StoreUnavailable` until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().unavailable = unavailable;
    }

    /// Delay every `begin` and position read by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().latency = latency;
    }

    /// Number of commits attempted so far, successful or not
    pub fn commit_attempts(&self) -> u64 {
        self.commit_attempts.load(Ordering::SeqCst)
    }

    /// Number of position queries served so far
    pub fn position_reads(&self) -> u64 {
        self.position_reads.load(Ordering::SeqCst)
    }

    /// Insert or replace a holding, keyed by user, market and answer
    pub fn upsert_holding(&self, holding: Holding) {
        let key = (
            holding.user_id.clone(),
            holding.market_id.clone(),
            holding.answer_id.clone(),
        );
        self.state.write().holdings.insert(key, holding);
    }

    /// Insert or replace a market snapshot
    pub fn upsert_market(&self, market: MarketSnapshot) {
        self.state.write().markets.insert(market.id.clone(), market);
    }

    async fn injected_latency(&self) {
        let latency = self.faults.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn check_available(&self) -> LedgerResult<()> {
        if self.faults.lock().unavailable {
            Err(LedgerError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LedgerStorage for MemoryStorage {
    async fn begin(&self) -> LedgerResult<Box<dyn UnitOfWork>> {
        self.injected_latency().await;
        self.check_available()?;

        Ok(Box::new(MemoryUnitOfWork {
            storage: self.clone(),
            read_versions: HashMap::new(),
            staged_accounts: HashMap::new(),
            staged_records: Vec::new(),
            committed: false,
        }))
    }

    async fn insert_account(&self, account: &Account) -> LedgerResult<()> {
        self.check_available()?;
        let mut state = self.state.write();
        if state.accounts.contains_key(&account.account_ref) {
            return Err(LedgerError::DuplicateAccount(account.account_ref.to_string()));
        }
        state
            .accounts
            .insert(account.account_ref.clone(), account.clone());
        Ok(())
    }

    async fn get_account(&self, account_ref: &AccountRef) -> LedgerResult<Option<Account>> {
        self.check_available()?;
        Ok(self.state.read().accounts.get(account_ref).cloned())
    }

    async fn list_accounts(&self, kind: Option<AccountKind>) -> LedgerResult<Vec<Account>> {
        self.check_available()?;
        let state = self.state.read();
        Ok(state
            .accounts
            .values()
            .filter(|account| kind.is_none_or(|k| account.account_ref.kind == k))
            .cloned()
            .collect())
    }

    async fn get_transaction(&self, id: Uuid) -> LedgerResult<Option<TransactionRecord>> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .transactions
            .iter()
            .find(|record| record.id == id)
            .cloned())
    }

    async fn list_transactions(
        &self,
        account_ref: Option<&AccountRef>,
    ) -> LedgerResult<Vec<TransactionRecord>> {
        self.check_available()?;
        let state = self.state.read();
        Ok(state
            .transactions
            .iter()
            .filter(|record| account_ref.is_none_or(|r| record.involves(r)))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PositionStorage for MemoryStorage {
    async fn open_holdings(&self, user_ids: &[String]) -> LedgerResult<Vec<Holding>> {
        self.injected_latency().await;
        self.check_available()?;
        self.position_reads.fetch_add(1, Ordering::SeqCst);

        let wanted: HashSet<&str> = user_ids.iter().map(String::as_str).collect();
        let state = self.state.read();
        Ok(state
            .holdings
            .values()
            .filter(|h| h.has_shares && wanted.contains(h.user_id.as_str()))
            .cloned()
            .collect())
    }

    async fn market_snapshots(&self, market_ids: &[String]) -> LedgerResult<Vec<MarketSnapshot>> {
        self.injected_latency().await;
        self.check_available()?;
        self.position_reads.fetch_add(1, Ordering::SeqCst);

        let state = self.state.read();
        Ok(market_ids
            .iter()
            .filter_map(|id| state.markets.get(id).cloned())
            .collect())
    }
}

/// Optimistic unit of work over [`MemoryStorage`]
struct MemoryUnitOfWork {
    storage: MemoryStorage,
    read_versions: HashMap<AccountRef, u64>,
    staged_accounts: HashMap<AccountRef, Account>,
    staged_records: Vec<TransactionRecord>,
    committed: bool,
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn get_account(&mut self, account_ref: &AccountRef) -> LedgerResult<Option<Account>> {
        if let Some(staged) = self.staged_accounts.get(account_ref) {
            return Ok(Some(staged.clone()));
        }
        self.storage.check_available()?;

        let account = self.storage.state.read().accounts.get(account_ref).cloned();
        if let Some(ref account) = account {
            self.read_versions
                .entry(account_ref.clone())
                .or_insert(account.version);
        }
        Ok(account)
    }

    fn stage_account(&mut self, account: Account) {
        self.staged_accounts
            .insert(account.account_ref.clone(), account);
    }

    fn stage_transaction(&mut self, record: TransactionRecord) {
        self.staged_records.push(record);
    }

    async fn commit(&mut self) -> LedgerResult<()> {
        if self.committed {
            return Err(LedgerError::Storage(
                "unit of work already committed".to_string(),
            ));
        }
        self.storage.commit_attempts.fetch_add(1, Ordering::SeqCst);

        let mut state = self.storage.state.write();

        for (account_ref, seen) in &self.read_versions {
            let current = state.accounts.get(account_ref).map(|a| a.version);
            if current != Some(*seen) {
                return Err(LedgerError::Conflict(format!(
                    "{} changed since it was read",
                    account_ref
                )));
            }
        }

        let mut updates = Vec::with_capacity(self.staged_accounts.len());
        for (account_ref, account) in &self.staged_accounts {
            let seen = self.read_versions.get(account_ref).ok_or_else(|| {
                LedgerError::Storage(format!("{} staged without being read", account_ref))
            })?;
            let mut account = account.clone();
            account.version = seen + 1;
            updates.push(account);
        }

        {
            let mut faults = self.storage.faults.lock();
            if faults.conflict_commits > 0 {
                faults.conflict_commits -= 1;
                return Err(LedgerError::Conflict("injected conflict".to_string()));
            }
            if faults.fail_commits > 0 {
                faults.fail_commits -= 1;
                return Err(LedgerError::StoreUnavailable(
                    "injected failure during commit".to_string(),
                ));
            }
        }

        for account in updates {
            state.accounts.insert(account.account_ref.clone(), account);
        }
        state.transactions.append(&mut self.staged_records);
        self.committed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;

    async fn storage_with(accounts: &[&str]) -> MemoryStorage {
        let storage = MemoryStorage::new();
        for id in accounts {
            let mut account = Account::new(AccountRef::user(*id), CurrencyToken::Mana);
            account.balance = BigDecimal::from(100);
            storage.insert_account(&account).await.unwrap();
        }
        storage
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() {
        let storage = storage_with(&["alice"]).await;
        let alice = AccountRef::user("alice");

        {
            let mut uow = storage.begin().await.unwrap();
            let mut account = uow.get_account(&alice).await.unwrap().unwrap();
            account.balance = BigDecimal::from(1);
            uow.stage_account(account);

            // visible inside the unit of work
            let staged = uow.get_account(&alice).await.unwrap().unwrap();
            assert_eq!(staged.balance, BigDecimal::from(1));
        }

        let account = storage.get_account(&alice).await.unwrap().unwrap();
        assert_eq!(account.balance, BigDecimal::from(100));
        assert_eq!(account.version, 0);
    }

    #[tokio::test]
    async fn test_concurrent_writer_causes_conflict() {
        let storage = storage_with(&["alice"]).await;
        let alice = AccountRef::user("alice");

        let mut first = storage.begin().await.unwrap();
        let mut second = storage.begin().await.unwrap();

        let mut a = first.get_account(&alice).await.unwrap().unwrap();
        let mut b = second.get_account(&alice).await.unwrap().unwrap();
        a.balance = BigDecimal::from(90);
        b.balance = BigDecimal::from(80);
        first.stage_account(a);
        second.stage_account(b);

        first.commit().await.unwrap();
        assert!(matches!(
            second.commit().await,
            Err(LedgerError::Conflict(_))
        ));

        let account = storage.get_account(&alice).await.unwrap().unwrap();
        assert_eq!(account.balance, BigDecimal::from(90));
        assert_eq!(account.version, 1);
    }

    #[tokio::test]
    async fn test_injected_commit_failure_leaves_nothing() {
        let storage = storage_with(&["alice"]).await;
        storage.fail_next_commits(1);

        let mut uow = storage.begin().await.unwrap();
        let mut account = uow
            .get_account(&AccountRef::user("alice"))
            .await
            .unwrap()
            .unwrap();
        account.balance = BigDecimal::from(0);
        uow.stage_account(account);
        assert!(matches!(
            uow.commit().await,
            Err(LedgerError::StoreUnavailable(_))
        ));

        let account = storage
            .get_account(&AccountRef::user("alice"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account.balance, BigDecimal::from(100));
        assert!(storage.list_transactions(None).await.unwrap().is_empty());
        assert_eq!(storage.commit_attempts(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let storage = storage_with(&[]).await;
        storage.set_unavailable(true);
        assert!(storage.begin().await.is_err());
        assert!(matches!(
            storage.open_holdings(&["u".to_string()]).await,
            Err(LedgerError::StoreUnavailable(_))
        ));
        storage.set_unavailable(false);
        assert!(storage.begin().await.is_ok());
    }

    #[tokio::test]
    async fn test_open_holdings_filters_closed_positions() {
        let storage = MemoryStorage::new();
        storage.upsert_holding(Holding::new(
            "u1",
            "m1",
            None,
            BigDecimal::from(5),
            BigDecimal::from(0),
        ));
        storage.upsert_holding(Holding::new(
            "u1",
            "m2",
            None,
            BigDecimal::from(0),
            BigDecimal::from(0),
        ));
        storage.upsert_holding(Holding::new(
            "u2",
            "m1",
            None,
            BigDecimal::from(1),
            BigDecimal::from(0),
        ));

        let holdings = storage.open_holdings(&["u1".to_string()]).await.unwrap();
        assert_eq!(holdings.len(), 1);
        assert_eq!(holdings[0].market_id, "m1");
        assert_eq!(storage.position_reads(), 1);
    }
}
