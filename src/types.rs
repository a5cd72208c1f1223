//! Core types and data structures for the ledger and valuation system

use bigdecimal::{BigDecimal, Zero};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kinds of accounts that can hold a balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    /// Monetary authority - the only kind allowed to mint or burn currency
    Authority,
    /// A user's wallet
    User,
    /// Liquidity pool owned by a market
    MarketPool,
}

impl AccountKind {
    /// Stable code used in storage keys and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Authority => "authority",
            AccountKind::User => "user",
            AccountKind::MarketPool => "market_pool",
        }
    }
}

impl FromStr for AccountKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authority" => Ok(AccountKind::Authority),
            "user" => Ok(AccountKind::User),
            "market_pool" => Ok(AccountKind::MarketPool),
            other => Err(LedgerError::Validation(format!(
                "Unknown account kind '{}'",
                other
            ))),
        }
    }
}

/// Logical reference to an account: its kind plus an identifier unique within that kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccountRef {
    pub kind: AccountKind,
    pub id: String,
}

impl AccountRef {
    pub fn new(kind: AccountKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    /// The authority account for a currency token. There is exactly one per token.
    pub fn authority(token: CurrencyToken) -> Self {
        Self::new(AccountKind::Authority, token.code())
    }

    pub fn user(id: impl Into<String>) -> Self {
        Self::new(AccountKind::User, id)
    }

    pub fn market_pool(market_id: impl Into<String>) -> Self {
        Self::new(AccountKind::MarketPool, market_id)
    }

    pub fn is_authority(&self) -> bool {
        self.kind == AccountKind::Authority
    }
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Currency denominations. Distinct tokens are never fungible with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CurrencyToken {
    /// Play-money currency
    #[serde(rename = "M$")]
    Mana,
    /// Prize points
    #[serde(rename = "SPICE")]
    Spice,
    /// Redeemable cash balance
    #[serde(rename = "CASH")]
    Cash,
}

/// Largest number of integer digits any token amount may have
pub const MAX_INTEGER_DIGITS: i64 = 30;

impl CurrencyToken {
    pub fn code(&self) -> &'static str {
        match self {
            CurrencyToken::Mana => "M$",
            CurrencyToken::Spice => "SPICE",
            CurrencyToken::Cash => "CASH",
        }
    }

    /// Maximum number of fractional digits an amount of this token may carry
    pub fn scale(&self) -> i64 {
        match self {
            CurrencyToken::Mana | CurrencyToken::Spice | CurrencyToken::Cash => 2,
        }
    }

    /// Whether `amount` is expressible in this token without losing precision.
    ///
    /// Amounts are also capped at [`MAX_INTEGER_DIGITS`] digits before the point.
    pub fn is_representable(&self, amount: &BigDecimal) -> bool {
        // work on digits and exponent only; rescaling 1e200000000 would
        // materialize the full integer
        let (int_val, exponent) = amount.as_bigint_and_exponent();
        if int_val.is_zero() {
            return true;
        }
        let digits = int_val.magnitude().to_string();
        let significant = digits.trim_end_matches('0');
        let fractional_digits = exponent - (digits.len() - significant.len()) as i64;
        let integer_digits = significant.len() as i64 - fractional_digits;
        fractional_digits <= self.scale() && integer_digits <= MAX_INTEGER_DIGITS
    }
}

impl fmt::Display for CurrencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for CurrencyToken {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "M$" => Ok(CurrencyToken::Mana),
            "SPICE" => Ok(CurrencyToken::Spice),
            "CASH" => Ok(CurrencyToken::Cash),
            other => Err(LedgerError::Validation(format!(
                "Unknown currency token '{}'",
                other
            ))),
        }
    }
}

/// Fixed taxonomy of transaction categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransactionCategory {
    /// Authority mints currency into an account
    MintDeposit,
    /// Authority grants a new user their starting balance
    SignupBonus,
    /// Payout from a market pool when a market resolves
    MarketSettlement,
    /// Liquidity moved between a user and a market pool
    MarketLiquidity,
    /// Peer-to-peer transfer
    Transfer,
    /// Currency returned to the authority and removed from supply
    Burn,
}

impl TransactionCategory {
    pub const ALL: [TransactionCategory; 6] = [
        TransactionCategory::MintDeposit,
        TransactionCategory::SignupBonus,
        TransactionCategory::MarketSettlement,
        TransactionCategory::MarketLiquidity,
        TransactionCategory::Transfer,
        TransactionCategory::Burn,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            TransactionCategory::MintDeposit => "mint-deposit",
            TransactionCategory::SignupBonus => "signup-bonus",
            TransactionCategory::MarketSettlement => "market-settlement",
            TransactionCategory::MarketLiquidity => "market-liquidity",
            TransactionCategory::Transfer => "transfer",
            TransactionCategory::Burn => "burn",
        }
    }
}

impl fmt::Display for TransactionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for TransactionCategory {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionCategory::ALL
            .into_iter()
            .find(|category| category.code() == s)
            .ok_or_else(|| LedgerError::UnknownCategory(s.to_string()))
    }
}

/// Core account structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Kind and identifier of the account
    pub account_ref: AccountRef,
    /// Denomination this account holds
    pub token: CurrencyToken,
    /// Current balance. Never negative for non-authority accounts.
    pub balance: BigDecimal,
    /// Incremented on every committed balance change, used for conflict detection
    pub version: u64,
    /// When the account was created
    pub created_at: NaiveDateTime,
    /// When the account was last updated
    pub updated_at: NaiveDateTime,
}

impl Account {
    /// Create a new account with a zero balance
    pub fn new(account_ref: AccountRef, token: CurrencyToken) -> Self {
        let now = chrono::Utc::now().naive_utc();
        Self {
            account_ref,
            token,
            balance: BigDecimal::from(0),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_authority(&self) -> bool {
        self.account_ref.is_authority()
    }

    /// Remove `amount` from the balance.
    ///
    /// Authority accounts are an unbounded source and are left untouched.
    pub fn debit(&mut self, amount: &BigDecimal) -> LedgerResult<()> {
        if self.is_authority() {
            return Ok(());
        }

        let remaining = &self.balance - amount;
        if remaining < BigDecimal::from(0) {
            return Err(LedgerError::InsufficientFunds {
                account: self.account_ref.to_string(),
                balance: self.balance.clone(),
                requested: amount.clone(),
            });
        }

        self.balance = remaining;
        self.updated_at = chrono::Utc::now().naive_utc();
        Ok(())
    }

    /// Add `amount` to the balance. Authority accounts are an unbounded sink.
    pub fn credit(&mut self, amount: &BigDecimal) {
        if self.is_authority() {
            return;
        }
        self.balance += amount;
        self.updated_at = chrono::Utc::now().naive_utc();
    }
}

/// A transfer as submitted by a request handler, before validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub source: AccountRef,
    pub destination: AccountRef,
    pub amount: BigDecimal,
    pub token: CurrencyToken,
    /// Category code, checked against [`TransactionCategory`] during validation
    pub category: String,
    pub description: String,
}

/// Outcome of a persisted transaction. Failed attempts are never written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Applied,
}

/// Immutable, append-only record of an applied transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Server-assigned identifier
    pub id: Uuid,
    pub source: AccountRef,
    pub destination: AccountRef,
    pub amount: BigDecimal,
    pub token: CurrencyToken,
    pub category: TransactionCategory,
    pub description: String,
    /// Server-assigned creation time
    pub created_at: NaiveDateTime,
    pub status: TransactionStatus,
}

impl TransactionRecord {
    /// Whether the record touches `account_ref` as source or destination
    pub fn involves(&self, account_ref: &AccountRef) -> bool {
        &self.source == account_ref || &self.destination == account_ref
    }
}

/// A user's share position in a market, owned by the trading subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub user_id: String,
    pub market_id: String,
    /// Sub-outcome for multi-outcome markets
    pub answer_id: Option<String>,
    pub yes_shares: BigDecimal,
    pub no_shares: BigDecimal,
    /// Set when either share count is non-zero
    pub has_shares: bool,
}

impl Holding {
    pub fn new(
        user_id: impl Into<String>,
        market_id: impl Into<String>,
        answer_id: Option<String>,
        yes_shares: BigDecimal,
        no_shares: BigDecimal,
    ) -> Self {
        let zero = BigDecimal::from(0);
        let has_shares = yes_shares != zero || no_shares != zero;
        Self {
            user_id: user_id.into(),
            market_id: market_id.into(),
            answer_id,
            yes_shares,
            no_shares,
            has_shares,
        }
    }
}

/// Pricing model of a market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketMechanism {
    SingleOutcome,
    MultiOutcome,
}

/// Current state of a market as reported by the trading subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub id: String,
    pub mechanism: MarketMechanism,
    pub resolved: bool,
    /// Market-level probability
    pub probability: Option<BigDecimal>,
    /// Per sub-outcome probability; an answer may be present with no recorded probability
    pub answer_probabilities: HashMap<String, Option<BigDecimal>>,
}

impl MarketSnapshot {
    /// Unresolved single-outcome market at `probability`
    pub fn single_outcome(id: impl Into<String>, probability: BigDecimal) -> Self {
        Self {
            id: id.into(),
            mechanism: MarketMechanism::SingleOutcome,
            resolved: false,
            probability: Some(probability),
            answer_probabilities: HashMap::new(),
        }
    }

    /// Unresolved multi-outcome market with an optional market-level probability
    pub fn multi_outcome(id: impl Into<String>, probability: Option<BigDecimal>) -> Self {
        Self {
            id: id.into(),
            mechanism: MarketMechanism::MultiOutcome,
            resolved: false,
            probability,
            answer_probabilities: HashMap::new(),
        }
    }

    pub fn with_answer(mut self, answer_id: impl Into<String>, prob: Option<BigDecimal>) -> Self {
        self.answer_probabilities.insert(answer_id.into(), prob);
        self
    }

    pub fn resolved(mut self) -> Self {
        self.resolved = true;
        self
    }
}

/// Errors that can occur in the ledger system
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Account not found: {0}")]
    AccountNotFound(String),
    #[error("Insufficient funds in {account}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account: String,
        balance: BigDecimal,
        requested: BigDecimal,
    },
    #[error("Currency mismatch on {account}: expected {expected}, found {found}")]
    CurrencyMismatch {
        account: String,
        expected: CurrencyToken,
        found: CurrencyToken,
    },
    #[error("Unknown transaction category: {0}")]
    UnknownCategory(String),
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Serialization conflict: {0}")]
    Conflict(String),
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Account already exists: {0}")]
    DuplicateAccount(String),
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Conflicts and store outages may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::Conflict(_) | LedgerError::StoreUnavailable(_)
        )
    }
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_codes_parse() {
        for category in TransactionCategory::ALL {
            assert_eq!(
                category.code().parse::<TransactionCategory>().unwrap(),
                category
            );
        }
        assert!(matches!(
            "free-money".parse::<TransactionCategory>(),
            Err(LedgerError::UnknownCategory(code)) if code == "free-money"
        ));
    }

    #[test]
    fn test_token_representable_amounts() {
        let token = CurrencyToken::Mana;
        assert!(token.is_representable(&"10".parse().unwrap()));
        assert!(token.is_representable(&"10.25".parse().unwrap()));
        assert!(!token.is_representable(&"10.255".parse().unwrap()));
        assert!(token.is_representable(&"10.2500".parse().unwrap()));
        assert!(token.is_representable(&"1e3".parse().unwrap()));
    }

    #[test]
    fn test_wire_codes_match_display_codes() {
        for token in [CurrencyToken::Mana, CurrencyToken::Spice, CurrencyToken::Cash] {
            let json = serde_json::to_string(&token).unwrap();
            assert_eq!(json, format!("\"{}\"", token.code()));
            assert_eq!(serde_json::from_str::<CurrencyToken>(&json).unwrap(), token);
        }
        for category in TransactionCategory::ALL {
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", category.code()));
            assert_eq!(serde_json::from_str::<TransactionCategory>(&json).unwrap(), category);
        }
        assert!(serde_json::from_str::<CurrencyToken>("\"MANA\"").is_err());
    }

    #[test]
    fn test_transaction_record_serializes() {
        let record = TransactionRecord {
            id: Uuid::new_v4(),
            source: AccountRef::authority(CurrencyToken::Mana),
            destination: AccountRef::user("alice"),
            amount: "100.50".parse().unwrap(),
            token: CurrencyToken::Mana,
            category: TransactionCategory::MintDeposit,
            description: "Free deposit".to_string(),
            created_at: chrono::Utc::now().naive_utc(),
            status: TransactionStatus::Applied,
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["token"], "M$");
        assert_eq!(value["category"], "mint-deposit");
        assert_eq!(value["status"], "applied");
        assert_eq!(value["source"]["kind"], "authority");
        assert_eq!(value["destination"]["kind"], "user");
        assert_eq!(value["destination"]["id"], "alice");

        let decoded: TransactionRecord = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_huge_exponents_answer_quickly() {
        let token = CurrencyToken::Mana;
        assert!(!token.is_representable(&"1e200000000".parse().unwrap()));
        assert!(!token.is_representable(&"1e-200000000".parse().unwrap()));
        assert!(token.is_representable(&"1e29".parse().unwrap()));
        assert!(!token.is_representable(&"1e30".parse().unwrap()));
    }

    #[test]
    fn test_authority_is_unbounded() {
        let mut bank = Account::new(AccountRef::authority(CurrencyToken::Mana), CurrencyToken::Mana);
        bank.debit(&BigDecimal::from(1_000_000)).unwrap();
        bank.credit(&BigDecimal::from(5));
        assert_eq!(bank.balance, BigDecimal::from(0));
    }

    #[test]
    fn test_user_debit_rejects_overdraft() {
        let mut account = Account::new(AccountRef::user("alice"), CurrencyToken::Mana);
        account.credit(&BigDecimal::from(10));

        let err = account.debit(&BigDecimal::from(11)).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(account.balance, BigDecimal::from(10));

        account.debit(&BigDecimal::from(10)).unwrap();
        assert_eq!(account.balance, BigDecimal::from(0));
    }

    #[test]
    fn test_holding_flags_open_position() {
        let open = Holding::new("u", "m", None, BigDecimal::from(3), BigDecimal::from(0));
        let closed = Holding::new("u", "m", None, BigDecimal::from(0), BigDecimal::from(0));
        assert!(open.has_shares);
        assert!(!closed.has_shares);
    }

    #[test]
    fn test_account_ref_display() {
        assert_eq!(AccountRef::user("u1").to_string(), "user:u1");
        assert_eq!(
            AccountRef::authority(CurrencyToken::Mana).to_string(),
            "authority:M$"
        );
    }
}
