//! # Market Ledger
//!
//! The monetary core of a prediction-market application: a virtual currency
//! ledger with strict conservation guarantees, and a valuation engine that
//! marks users' open market positions to current probabilities.
//!
//! ## Features
//!
//! - **Atomic transfers**: debit, credit and an append-only record commit together or not at all
//! - **Minting authority**: a distinct account kind that can create or destroy currency,
//!   gated by an explicit deployment capability
//! - **Non-negative balances**: overdrafts are rejected inside the unit of work
//! - **Bounded retry**: serialization conflicts and store outages are retried with backoff
//! - **Position valuation**: batched, decimal-exact unrealized value across single- and
//!   multi-outcome markets with per-answer probability fallback
//! - **Storage abstraction**: in-memory and SQLite backends behind async traits
//!
//! ## Quick Start
//!
//! ```rust
//! use market_ledger::utils::MemoryStorage;
//! use market_ledger::{patterns, AccountRef, CurrencyToken, Ledger, LedgerConfig};
//! use bigdecimal::BigDecimal;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let mut config = LedgerConfig::default();
//! config.deployment.minting_enabled = true;
//!
//! let ledger = Ledger::with_config(MemoryStorage::new(), config);
//! ledger.init_authority(CurrencyToken::Mana).await.unwrap();
//! ledger.open_user_account("alice").await.unwrap();
//!
//! let deposit = patterns::free_deposit("alice", BigDecimal::from(100), CurrencyToken::Mana).unwrap();
//! ledger.apply_transfer(&deposit, &ledger.auth_for("alice")).await.unwrap();
//!
//! let balance = ledger.get_balance(&AccountRef::user("alice")).await.unwrap();
//! assert_eq!(balance, BigDecimal::from(100));
//! # });
//! ```

pub mod config;
pub mod ledger;
pub mod traits;
pub mod types;
pub mod utils;
pub mod valuation;

// Re-export commonly used types
pub use config::*;
pub use ledger::*;
pub use traits::*;
pub use types::*;
pub use valuation::{value_holding, GoverningProbability, PositionValuationEngine};

// Re-export transfer patterns for convenience
pub use ledger::transaction::patterns;
