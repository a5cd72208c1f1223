//! Ledger module containing account resolution, validation and transfer processing

pub mod account;
pub mod core;
pub mod transaction;
pub mod validator;

pub use self::core::*;
pub use account::*;
pub use transaction::*;
pub use validator::*;
