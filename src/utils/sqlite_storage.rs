//! SQLite storage implementation

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

use crate::traits::*;
use crate::types::*;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// How long a statement waits on another connection's lock by default
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound parameters per grouped `IN (...)` query, well below SQLite's variable limit
const QUERY_CHUNK: usize = 500;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    kind        TEXT    NOT NULL,
    id          TEXT    NOT NULL,
    token       TEXT    NOT NULL,
    balance     TEXT    NOT NULL,
    version     INTEGER NOT NULL,
    created_at  TEXT    NOT NULL,
    updated_at  TEXT    NOT NULL,
    PRIMARY KEY (kind, id)
);
CREATE TABLE IF NOT EXISTS transactions (
    seq              INTEGER PRIMARY KEY AUTOINCREMENT,
    id               TEXT NOT NULL UNIQUE,
    source_kind      TEXT NOT NULL,
    source_id        TEXT NOT NULL,
    destination_kind TEXT NOT NULL,
    destination_id   TEXT NOT NULL,
    amount           TEXT NOT NULL,
    token            TEXT NOT NULL,
    category         TEXT NOT NULL,
    description      TEXT NOT NULL,
    created_at       TEXT NOT NULL,
    status           TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS transactions_source ON transactions (source_kind, source_id);
CREATE INDEX IF NOT EXISTS transactions_destination ON transactions (destination_kind, destination_id);
CREATE TABLE IF NOT EXISTS markets (
    id          TEXT    PRIMARY KEY,
    mechanism   TEXT    NOT NULL,
    resolved    INTEGER NOT NULL,
    probability TEXT
);
CREATE TABLE IF NOT EXISTS answers (
    market_id   TEXT NOT NULL,
    id          TEXT NOT NULL,
    probability TEXT,
    PRIMARY KEY (market_id, id)
);
CREATE TABLE IF NOT EXISTS holdings (
    user_id     TEXT    NOT NULL,
    market_id   TEXT    NOT NULL,
    answer_id   TEXT    NOT NULL DEFAULT '',
    yes_shares  TEXT    NOT NULL,
    no_shares   TEXT    NOT NULL,
    has_shares  INTEGER NOT NULL,
    PRIMARY KEY (user_id, market_id, answer_id)
);
CREATE INDEX IF NOT EXISTS holdings_open ON holdings (user_id) WHERE has_shares = 1;
";

/// SQLite-backed storage
///
/// All access goes through one connection; units of work read in autocommit
/// mode and apply their writes in a single `BEGIN IMMEDIATE` transaction with
/// compare-and-set version checks.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) a database file and apply the schema
    pub fn open(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let conn = Connection::open(path).map_err(store_error)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(store_error)?;
        Self::init(conn)
    }

    /// Private in-memory database, mostly for tests
    pub fn open_in_memory() -> LedgerResult<Self> {
        Self::init(Connection::open_in_memory().map_err(store_error)?)
    }

    fn init(conn: Connection) -> LedgerResult<Self> {
        conn.execute_batch(SCHEMA).map_err(store_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or replace a holding
    pub fn upsert_holding(&self, holding: &Holding) -> LedgerResult<()> {
        self.conn
            .lock()
            .execute(
                "INSERT OR REPLACE INTO holdings
                 (user_id, market_id, answer_id, yes_shares, no_shares, has_shares)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    holding.user_id,
                    holding.market_id,
                    holding.answer_id.as_deref().unwrap_or(""),
                    holding.yes_shares.to_string(),
                    holding.no_shares.to_string(),
                    holding.has_shares,
                ],
            )
            .map_err(store_error)?;
        Ok(())
    }

    /// Insert or replace a market snapshot and its answers
    pub fn upsert_market(&self, market: &MarketSnapshot) -> LedgerResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(store_error)?;
        tx.execute(
            "INSERT OR REPLACE INTO markets (id, mechanism, resolved, probability)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                market.id,
                mechanism_code(market.mechanism),
                market.resolved,
                market.probability.as_ref().map(|p| p.to_string()),
            ],
        )
        .map_err(store_error)?;
        tx.execute("DELETE FROM answers WHERE market_id = ?1", params![market.id])
            .map_err(store_error)?;
        for (answer_id, prob) in &market.answer_probabilities {
            tx.execute(
                "INSERT INTO answers (market_id, id, probability) VALUES (?1, ?2, ?3)",
                params![market.id, answer_id, prob.as_ref().map(|p| p.to_string())],
            )
            .map_err(store_error)?;
        }
        tx.commit().map_err(store_error)
    }
}

impl SqliteStorage {
    fn unit_of_work(&self, deadline: Option<Instant>) -> Box<dyn UnitOfWork> {
        Box::new(SqliteUnitOfWork {
            conn: Arc::clone(&self.conn),
            deadline,
            read_versions: HashMap::new(),
            staged_accounts: HashMap::new(),
            staged_records: Vec::new(),
            committed: false,
        })
    }
}

#[async_trait]
impl LedgerStorage for SqliteStorage {
    async fn begin(&self) -> LedgerResult<Box<dyn UnitOfWork>> {
        Ok(self.unit_of_work(None))
    }

    // busy waits block the executor thread, so timeout_at cannot cut them short;
    // the unit of work bounds its own lock wait instead
    async fn begin_until(
        &self,
        deadline: tokio::time::Instant,
    ) -> LedgerResult<Box<dyn UnitOfWork>> {
        Ok(self.unit_of_work(Some(deadline.into_std())))
    }

    async fn insert_account(&self, account: &Account) -> LedgerResult<()> {
        let result = self.conn.lock().execute(
            "INSERT INTO accounts (kind, id, token, balance, version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                account.account_ref.kind.as_str(),
                account.account_ref.id,
                account.token.code(),
                account.balance.to_string(),
                account.version as i64,
                format_ts(&account.created_at),
                format_ts(&account.updated_at),
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(e) if error_code(&e) == Some(ErrorCode::ConstraintViolation) => Err(
                LedgerError::DuplicateAccount(account.account_ref.to_string()),
            ),
            Err(e) => Err(store_error(e)),
        }
    }

    async fn get_account(&self, account_ref: &AccountRef) -> LedgerResult<Option<Account>> {
        select_account(&self.conn.lock(), account_ref)
    }

    async fn list_accounts(&self, kind: Option<AccountKind>) -> LedgerResult<Vec<Account>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT kind, id, token, balance, version, created_at, updated_at
                 FROM accounts WHERE ?1 IS NULL OR kind = ?1 ORDER BY kind, id",
            )
            .map_err(store_error)?;
        let rows = stmt
            .query_map(params![kind.map(|k| k.as_str())], AccountRow::from_row)
            .map_err(store_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_error)?;
        rows.into_iter().map(AccountRow::into_account).collect()
    }

    async fn get_transaction(&self, id: Uuid) -> LedgerResult<Option<TransactionRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT {} FROM transactions WHERE id = ?1", RECORD_COLUMNS),
                params![id.to_string()],
                RecordRow::from_row,
            )
            .optional()
            .map_err(store_error)?;
        row.map(RecordRow::into_record).transpose()
    }

    async fn list_transactions(
        &self,
        account_ref: Option<&AccountRef>,
    ) -> LedgerResult<Vec<TransactionRecord>> {
        let conn = self.conn.lock();
        let rows = match account_ref {
            Some(account_ref) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM transactions
                         WHERE (source_kind = ?1 AND source_id = ?2)
                            OR (destination_kind = ?1 AND destination_id = ?2)
                         ORDER BY seq",
                        RECORD_COLUMNS
                    ))
                    .map_err(store_error)?;
                let rows = stmt
                    .query_map(
                        params![account_ref.kind.as_str(), account_ref.id],
                        RecordRow::from_row,
                    )
                    .map_err(store_error)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(store_error)?;
                rows
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM transactions ORDER BY seq",
                        RECORD_COLUMNS
                    ))
                    .map_err(store_error)?;
                let rows = stmt
                    .query_map([], RecordRow::from_row)
                    .map_err(store_error)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(store_error)?;
                rows
            }
        };
        rows.into_iter().map(RecordRow::into_record).collect()
    }
}

#[async_trait]
impl PositionStorage for SqliteStorage {
    async fn open_holdings(&self, user_ids: &[String]) -> LedgerResult<Vec<Holding>> {
        let conn = self.conn.lock();
        let mut rows = Vec::new();
        for chunk in user_ids.chunks(QUERY_CHUNK) {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT user_id, market_id, answer_id, yes_shares, no_shares
                     FROM holdings WHERE has_shares = 1 AND user_id IN ({})",
                    placeholders(chunk.len())
                ))
                .map_err(store_error)?;
            let chunk_rows = stmt
                .query_map(params_from_iter(chunk.iter()), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                })
                .map_err(store_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(store_error)?;
            rows.extend(chunk_rows);
        }

        rows.into_iter()
            .map(|(user_id, market_id, answer_id, yes, no)| -> LedgerResult<Holding> {
                let answer_id = (!answer_id.is_empty()).then_some(answer_id);
                let mut holding =
                    Holding::new(user_id, market_id, answer_id, parse_decimal(&yes)?, parse_decimal(&no)?);
                holding.has_shares = true;
                Ok(holding)
            })
            .collect()
    }

    async fn market_snapshots(&self, market_ids: &[String]) -> LedgerResult<Vec<MarketSnapshot>> {
        // duplicates would split one market's answer rows across chunks
        let unique: Vec<&String> = market_ids.iter().collect::<BTreeSet<_>>().into_iter().collect();
        let conn = self.conn.lock();
        let mut markets: Vec<MarketSnapshot> = Vec::new();
        for chunk in unique.chunks(QUERY_CHUNK) {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT m.id, m.mechanism, m.resolved, m.probability, a.id, a.probability
                     FROM markets m LEFT JOIN answers a ON a.market_id = m.id
                     WHERE m.id IN ({})
                     ORDER BY m.id",
                    placeholders(chunk.len())
                ))
                .map_err(store_error)?;
            let rows = stmt
                .query_map(params_from_iter(chunk.iter()), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                })
                .map_err(store_error)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(store_error)?;

            for (id, mechanism, resolved, probability, answer_id, answer_prob) in rows {
                if markets.last().is_none_or(|m| m.id != id) {
                    markets.push(MarketSnapshot {
                        id,
                        mechanism: parse_mechanism(&mechanism)?,
                        resolved,
                        probability: probability.as_deref().map(parse_decimal).transpose()?,
                        answer_probabilities: HashMap::new(),
                    });
                }
                if let (Some(answer_id), Some(market)) = (answer_id, markets.last_mut()) {
                    let prob = answer_prob.as_deref().map(parse_decimal).transpose()?;
                    market.answer_probabilities.insert(answer_id, prob);
                }
            }
        }
        Ok(markets)
    }
}

struct SqliteUnitOfWork {
    conn: Arc<Mutex<Connection>>,
    /// Latest moment `BEGIN IMMEDIATE` may still be waiting for the write lock
    deadline: Option<Instant>,
    read_versions: HashMap<AccountRef, u64>,
    staged_accounts: HashMap<AccountRef, Account>,
    staged_records: Vec<TransactionRecord>,
    committed: bool,
}

#[async_trait]
impl UnitOfWork for SqliteUnitOfWork {
    async fn get_account(&mut self, account_ref: &AccountRef) -> LedgerResult<Option<Account>> {
        if let Some(staged) = self.staged_accounts.get(account_ref) {
            return Ok(Some(staged.clone()));
        }
        let account = select_account(&self.conn.lock(), account_ref)?;
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

        let mut conn = self.conn.lock();
        if let Some(deadline) = self.deadline {
            conn.busy_timeout(deadline.saturating_duration_since(Instant::now()))
                .map_err(store_error)?;
        }
        let result = self.write_staged(&mut conn);
        if self.deadline.is_some() {
            conn.busy_timeout(BUSY_TIMEOUT).map_err(store_error)?;
        }
        result?;

        self.committed = true;
        debug!(
            accounts = self.staged_accounts.len(),
            records = self.staged_records.len(),
            "sqlite unit of work committed"
        );
        Ok(())
    }
}

impl SqliteUnitOfWork {
    /// Apply the staged writes in one `BEGIN IMMEDIATE` transaction
    fn write_staged(&self, conn: &mut Connection) -> LedgerResult<()> {
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(store_error)?;

        for (account_ref, seen) in &self.read_versions {
            match self.staged_accounts.get(account_ref) {
                Some(account) => {
                    let changed = tx
                        .execute(
                            "UPDATE accounts SET balance = ?1, version = version + 1, updated_at = ?2
                             WHERE kind = ?3 AND id = ?4 AND version = ?5",
                            params![
                                account.balance.to_string(),
                                format_ts(&account.updated_at),
                                account_ref.kind.as_str(),
                                account_ref.id,
                                *seen as i64,
                            ],
                        )
                        .map_err(store_error)?;
                    if changed != 1 {
                        return Err(LedgerError::Conflict(format!(
                            "{} changed since it was read",
                            account_ref
                        )));
                    }
                }
                None => {
                    let current: Option<i64> = tx
                        .query_row(
                            "SELECT version FROM accounts WHERE kind = ?1 AND id = ?2",
                            params![account_ref.kind.as_str(), account_ref.id],
                            |row| row.get(0),
                        )
                        .optional()
                        .map_err(store_error)?;
                    if current != Some(*seen as i64) {
                        return Err(LedgerError::Conflict(format!(
                            "{} changed since it was read",
                            account_ref
                        )));
                    }
                }
            }
        }

        if let Some(account_ref) = self
            .staged_accounts
            .keys()
            .find(|r| !self.read_versions.contains_key(*r))
        {
            return Err(LedgerError::Storage(format!(
                "{} staged without being read",
                account_ref
            )));
        }

        for record in &self.staged_records {
            tx.execute(
                &format!(
                    "INSERT INTO transactions ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    RECORD_COLUMNS
                ),
                params![
                    record.id.to_string(),
                    record.source.kind.as_str(),
                    record.source.id,
                    record.destination.kind.as_str(),
                    record.destination.id,
                    record.amount.to_string(),
                    record.token.code(),
                    record.category.code(),
                    record.description,
                    format_ts(&record.created_at),
                    "applied",
                ],
            )
            .map_err(store_error)?;
        }

        tx.commit().map_err(store_error)
    }
}

const RECORD_COLUMNS: &str = "id, source_kind, source_id, destination_kind, destination_id, \
     amount, token, category, description, created_at, status";

struct AccountRow {
    kind: String,
    id: String,
    token: String,
    balance: String,
    version: i64,
    created_at: String,
    updated_at: String,
}

impl AccountRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            kind: row.get(0)?,
            id: row.get(1)?,
            token: row.get(2)?,
            balance: row.get(3)?,
            version: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_account(self) -> LedgerResult<Account> {
        Ok(Account {
            account_ref: AccountRef::new(self.kind.parse()?, self.id),
            token: self.token.parse()?,
            balance: parse_decimal(&self.balance)?,
            version: self.version as u64,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct RecordRow {
    id: String,
    source_kind: String,
    source_id: String,
    destination_kind: String,
    destination_id: String,
    amount: String,
    token: String,
    category: String,
    description: String,
    created_at: String,
}

impl RecordRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            source_kind: row.get(1)?,
            source_id: row.get(2)?,
            destination_kind: row.get(3)?,
            destination_id: row.get(4)?,
            amount: row.get(5)?,
            token: row.get(6)?,
            category: row.get(7)?,
            description: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn into_record(self) -> LedgerResult<TransactionRecord> {
        Ok(TransactionRecord {
            id: Uuid::parse_str(&self.id)
                .map_err(|e| LedgerError::Storage(format!("bad transaction id: {}", e)))?,
            source: AccountRef::new(self.source_kind.parse()?, self.source_id),
            destination: AccountRef::new(self.destination_kind.parse()?, self.destination_id),
            amount: parse_decimal(&self.amount)?,
            token: self.token.parse()?,
            category: self.category.parse()?,
            description: self.description,
            created_at: parse_ts(&self.created_at)?,
            status: TransactionStatus::Applied,
        })
    }
}

fn select_account(conn: &Connection, account_ref: &AccountRef) -> LedgerResult<Option<Account>> {
    let row = conn
        .query_row(
            "SELECT kind, id, token, balance, version, created_at, updated_at
             FROM accounts WHERE kind = ?1 AND id = ?2",
            params![account_ref.kind.as_str(), account_ref.id],
            AccountRow::from_row,
        )
        .optional()
        .map_err(store_error)?;
    row.map(AccountRow::into_account).transpose()
}

fn error_code(e: &rusqlite::Error) -> Option<ErrorCode> {
    match e {
        rusqlite::Error::SqliteFailure(err, _) => Some(err.code),
        _ => None,
    }
}

fn store_error(e: rusqlite::Error) -> LedgerError {
    match error_code(&e) {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
            LedgerError::Conflict(e.to_string())
        }
        Some(ErrorCode::CannotOpen) | Some(ErrorCode::SystemIoFailure) => {
            LedgerError::StoreUnavailable(e.to_string())
        }
        _ => LedgerError::Storage(e.to_string()),
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn parse_decimal(value: &str) -> LedgerResult<BigDecimal> {
    BigDecimal::from_str(value)
        .map_err(|e| LedgerError::Storage(format!("bad decimal '{}': {}", value, e)))
}

fn format_ts(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_ts(value: &str) -> LedgerResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map_err(|e| LedgerError::Storage(format!("bad timestamp '{}': {}", value, e)))
}

fn mechanism_code(mechanism: MarketMechanism) -> &'static str {
    match mechanism {
        MarketMechanism::SingleOutcome => "single_outcome",
        MarketMechanism::MultiOutcome => "multi_outcome",
    }
}

fn parse_mechanism(code: &str) -> LedgerResult<MarketMechanism> {
    match code {
        "single_outcome" => Ok(MarketMechanism::SingleOutcome),
        "multi_outcome" => Ok(MarketMechanism::MultiOutcome),
        other => Err(LedgerError::Storage(format!(
            "unknown market mechanism '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> BigDecimal {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_account_round_trip() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut account = Account::new(AccountRef::user("alice"), CurrencyToken::Mana);
        account.balance = dec("12.50");
        storage.insert_account(&account).await.unwrap();

        let loaded = storage
            .get_account(&AccountRef::user("alice"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.balance, dec("12.5"));
        assert_eq!(loaded.token, CurrencyToken::Mana);
        assert_eq!(loaded.version, 0);

        assert!(matches!(
            storage.insert_account(&account).await,
            Err(LedgerError::DuplicateAccount(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_unit_of_work_conflicts() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let mut account = Account::new(AccountRef::user("alice"), CurrencyToken::Mana);
        account.balance = dec("100");
        storage.insert_account(&account).await.unwrap();
        let alice = AccountRef::user("alice");

        let mut first = storage.begin().await.unwrap();
        let mut second = storage.begin().await.unwrap();
        let mut a = first.get_account(&alice).await.unwrap().unwrap();
        let mut b = second.get_account(&alice).await.unwrap().unwrap();
        a.balance = dec("90");
        b.balance = dec("80");
        first.stage_account(a);
        second.stage_account(b);

        first.commit().await.unwrap();
        assert!(matches!(
            second.commit().await,
            Err(LedgerError::Conflict(_))
        ));

        let stored = storage.get_account(&alice).await.unwrap().unwrap();
        assert_eq!(stored.balance, dec("90"));
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_market_snapshots_grouped() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .upsert_market(
                &MarketSnapshot::multi_outcome("m1", Some(dec("0.4")))
                    .with_answer("a", Some(dec("0.7")))
                    .with_answer("b", None),
            )
            .unwrap();
        storage
            .upsert_market(&MarketSnapshot::single_outcome("m2", dec("0.1")).resolved())
            .unwrap();

        let mut markets = storage
            .market_snapshots(&["m1".to_string(), "m2".to_string(), "nope".to_string()])
            .await
            .unwrap();
        markets.sort_by(|a, b| a.id.cmp(&b.id));

        assert_eq!(markets.len(), 2);
        assert_eq!(markets[0].answer_probabilities.len(), 2);
        assert_eq!(markets[0].answer_probabilities["a"], Some(dec("0.7")));
        assert_eq!(markets[0].answer_probabilities["b"], None);
        assert!(markets[1].resolved);
        assert!(markets[1].answer_probabilities.is_empty());
    }

    #[tokio::test]
    async fn test_open_holdings_only_for_requested_users() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .upsert_holding(&Holding::new("u1", "m1", Some("a".into()), dec("3"), dec("0")))
            .unwrap();
        storage
            .upsert_holding(&Holding::new("u1", "m2", None, dec("0"), dec("0")))
            .unwrap();
        storage
            .upsert_holding(&Holding::new("u2", "m1", None, dec("1"), dec("1")))
            .unwrap();

        let holdings = storage.open_holdings(&["u1".to_string()]).await.unwrap();
        assert_eq!(holdings.len(), 1);
        assert_eq!(holdings[0].answer_id.as_deref(), Some("a"));
        assert_eq!(holdings[0].yes_shares, dec("3"));
    }

    #[tokio::test]
    async fn test_batches_beyond_variable_limit() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .upsert_market(&MarketSnapshot::single_outcome("m1", dec("0.5")))
            .unwrap();
        storage
            .upsert_holding(&Holding::new("user0", "m1", None, dec("4"), dec("0")))
            .unwrap();
        storage
            .upsert_holding(&Holding::new("user39999", "m1", None, dec("0"), dec("6")))
            .unwrap();

        let users: Vec<String> = (0..40_000).map(|i| format!("user{}", i)).collect();
        let holdings = storage.open_holdings(&users).await.unwrap();
        assert_eq!(holdings.len(), 2);

        let mut market_ids: Vec<String> = (0..1_200).map(|i| format!("missing{}", i)).collect();
        market_ids.push("m1".to_string());
        market_ids.push("m1".to_string());
        let markets = storage.market_snapshots(&market_ids).await.unwrap();
        assert_eq!(markets.len(), 1);

        let ledger = crate::Ledger::new(storage);
        let values = ledger.invested_values(&users).await.unwrap();
        assert_eq!(values.len(), 40_000);
        assert_eq!(values["user0"], dec("2"));
        assert_eq!(values["user39999"], dec("3"));
        assert_eq!(values["user17"], dec("0"));
    }

    #[tokio::test]
    async fn test_lock_wait_respects_deadline() {
        use crate::ledger::validator::AuthContext;
        use crate::ledger::{patterns, TransferEngine};

        let path = std::env::temp_dir().join(format!("market-ledger-{}.db", Uuid::new_v4()));
        let storage = SqliteStorage::open(&path).unwrap();
        let mut alice = Account::new(AccountRef::user("alice"), CurrencyToken::Mana);
        alice.balance = dec("100");
        storage.insert_account(&alice).await.unwrap();
        storage
            .insert_account(&Account::new(AccountRef::user("bob"), CurrencyToken::Mana))
            .await
            .unwrap();

        // a second connection holds the write lock
        let other = SqliteStorage::open(&path).unwrap();
        other.conn.lock().execute_batch("BEGIN IMMEDIATE").unwrap();

        let engine = TransferEngine::new(storage.clone());
        let request =
            patterns::user_transfer("alice", "bob", dec("10"), CurrencyToken::Mana, "blocked").unwrap();
        let started = std::time::Instant::now();
        let err = engine
            .apply_transfer_within(&request, &AuthContext::anonymous(), Duration::from_millis(100))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::Timeout(_) | LedgerError::Conflict(_)));
        assert!(started.elapsed() < Duration::from_secs(2));

        other.conn.lock().execute_batch("ROLLBACK").unwrap();
        engine
            .apply_transfer(&request, &AuthContext::anonymous())
            .await
            .unwrap();
        let stored = storage.get_account(&AccountRef::user("alice")).await.unwrap().unwrap();
        assert_eq!(stored.balance, dec("90"));

        drop(engine);
        drop(storage);
        drop(other);
        let _ = std::fs::remove_file(&path);
    }
}
