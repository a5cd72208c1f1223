//! Transfer validation and caller authorization context

use serde::{Deserialize, Serialize};

use crate::ledger::account::resolve_account;
use crate::ledger::transaction::reject_self_transfer;
use crate::traits::*;
use crate::types::*;

/// Deployment-level capabilities granted to a caller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Authority-sourced transfers are permitted
    pub minting: bool,
}

impl Capabilities {
    pub fn with_minting() -> Self {
        Self { minting: true }
    }
}

/// What a request handler knows about the caller after authenticating it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthContext {
    pub caller_id: Option<String>,
    pub capabilities: Capabilities,
}

impl AuthContext {
    /// No caller and no capabilities
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn for_caller(caller_id: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            caller_id: Some(caller_id.into()),
            capabilities,
        }
    }
}

/// A transfer that passed every validation step, with its accounts as read
/// inside the current unit of work
#[derive(Debug, Clone)]
pub struct ValidatedTransfer {
    pub category: TransactionCategory,
    pub source: Account,
    pub destination: Account,
}

/// Run all validation steps for `request`, first failure wins:
///
/// 1. amount is positive and representable in the token
/// 2. category belongs to the taxonomy
/// 3. an authority source requires the minting capability
/// 4. both accounts resolve, and hold the requested token
///
/// Steps 1-3 touch no state, so a rejected mint never reads a balance. Nothing
/// is written.
pub async fn validate_transfer(
    validator: &dyn TransferValidator,
    uow: &mut dyn UnitOfWork,
    request: &TransferRequest,
    auth: &AuthContext,
) -> LedgerResult<ValidatedTransfer> {
    let category = validator.validate_request(request, auth)?;
    reject_self_transfer(request)?;

    let source = resolve_account(uow, &request.source).await?;
    let destination = resolve_account(uow, &request.destination).await?;
    validator.validate_accounts(request, &source, &destination)?;

    Ok(ValidatedTransfer {
        category,
        source,
        destination,
    })
}
