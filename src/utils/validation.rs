//! Validation utilities

use bigdecimal::{BigDecimal, Signed};

use crate::ledger::validator::AuthContext;
use crate::traits::*;
use crate::types::*;

/// Validate that an amount is positive
pub fn validate_positive_amount(amount: &BigDecimal) -> LedgerResult<()> {
    if !amount.is_positive() {
        Err(LedgerError::InvalidAmount(format!(
            "amount must be positive, got {}",
            amount
        )))
    } else {
        Ok(())
    }
}

/// Validate that an amount fits the precision of its token
pub fn validate_representable(amount: &BigDecimal, token: CurrencyToken) -> LedgerResult<()> {
    if token.is_representable(amount) {
        Ok(())
    } else {
        Err(LedgerError::InvalidAmount(format!(
            "amount must have at most {} decimal places and {} integer digits for {}",
            token.scale(),
            MAX_INTEGER_DIGITS,
            token
        )))
    }
}

/// Validate that an account ID is valid
pub fn validate_account_id(account_id: &str) -> LedgerResult<()> {
    if account_id.trim().is_empty() {
        return Err(LedgerError::Validation(
            "Account ID cannot be empty".to_string(),
        ));
    }

    if account_id.len() > 128 {
        return Err(LedgerError::Validation(
            "Account ID cannot exceed 128 characters".to_string(),
        ));
    }

    if account_id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(LedgerError::Validation(
            "Account ID cannot contain whitespace or control characters".to_string(),
        ));
    }

    Ok(())
}

/// Validate that a transaction description is valid
pub fn validate_transaction_description(description: &str) -> LedgerResult<()> {
    if description.trim().is_empty() {
        return Err(LedgerError::Validation(
            "Transaction description cannot be empty".to_string(),
        ));
    }

    if description.len() > 500 {
        return Err(LedgerError::Validation(
            "Transaction description cannot exceed 500 characters".to_string(),
        ));
    }

    Ok(())
}

/// Transfer validator that also enforces well-formed IDs and descriptions
pub struct StrictTransferValidator;

impl TransferValidator for StrictTransferValidator {
    fn validate_request(
        &self,
        request: &TransferRequest,
        auth: &AuthContext,
    ) -> LedgerResult<TransactionCategory> {
        let category = DefaultTransferValidator.validate_request(request, auth)?;

        validate_account_id(&request.source.id)?;
        validate_account_id(&request.destination.id)?;
        validate_transaction_description(&request.description)?;

        Ok(category)
    }

    fn validate_accounts(
        &self,
        request: &TransferRequest,
        source: &Account,
        destination: &Account,
    ) -> LedgerResult<()> {
        DefaultTransferValidator.validate_accounts(request, source, destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(description: &str) -> TransferRequest {
        TransferRequest {
            source: AccountRef::user("alice"),
            destination: AccountRef::user("bob"),
            amount: BigDecimal::from(5),
            token: CurrencyToken::Mana,
            category: "transfer".to_string(),
            description: description.to_string(),
        }
    }

    #[test]
    fn test_positive_amount() {
        assert!(validate_positive_amount(&BigDecimal::from(1)).is_ok());
        assert!(matches!(
            validate_positive_amount(&BigDecimal::from(0)),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(validate_positive_amount(&BigDecimal::from(-3)).is_err());
        assert!(validate_positive_amount(&"1e-200000000".parse().unwrap()).is_ok());
    }

    #[test]
    fn test_oversized_amount_rejected() {
        assert!(matches!(
            validate_representable(&"1e200000000".parse().unwrap(), CurrencyToken::Mana),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(validate_representable(&"999999.99".parse().unwrap(), CurrencyToken::Cash).is_ok());
    }

    #[test]
    fn test_account_id_rules() {
        assert!(validate_account_id("user-123_abc").is_ok());
        assert!(validate_account_id("  ").is_err());
        assert!(validate_account_id("has space").is_err());
        assert!(validate_account_id(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_strict_validator_requires_description() {
        let auth = AuthContext::anonymous();
        assert!(StrictTransferValidator
            .validate_request(&request("tip"), &auth)
            .is_ok());
        assert!(matches!(
            StrictTransferValidator.validate_request(&request(""), &auth),
            Err(LedgerError::Validation(_))
        ));
        // the default validator accepts an empty description
        assert!(DefaultTransferValidator
            .validate_request(&request(""), &auth)
            .is_ok());
    }
}
