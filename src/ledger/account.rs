//! Account resolution and account opening

use tracing::info;

use crate::traits::*;
use crate::types::*;

/// Resolve an account reference inside a unit of work.
///
/// Reading through the same unit of work that later stages the mutation means a
/// concurrent change to the account is caught at commit time.
pub async fn resolve_account(
    uow: &mut dyn UnitOfWork,
    account_ref: &AccountRef,
) -> LedgerResult<Account> {
    uow.get_account(account_ref)
        .await?
        .ok_or_else(|| LedgerError::AccountNotFound(account_ref.to_string()))
}

/// Account manager for opening and looking up accounts
pub struct AccountManager<S: LedgerStorage> {
    pub(crate) storage: S,
}

impl<S: LedgerStorage> AccountManager<S> {
    /// Create a new account manager
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Open a new zero-balance account
    pub async fn open_account(
        &self,
        account_ref: AccountRef,
        token: CurrencyToken,
    ) -> LedgerResult<Account> {
        crate::utils::validation::validate_account_id(&account_ref.id)?;

        let account = Account::new(account_ref, token);
        self.storage.insert_account(&account).await?;

        info!(account = %account.account_ref, token = %token, "opened account");
        Ok(account)
    }

    /// Open the authority account for `token`, or return it if it already exists
    pub async fn ensure_authority(&self, token: CurrencyToken) -> LedgerResult<Account> {
        let account_ref = AccountRef::authority(token);
        if let Some(existing) = self.storage.get_account(&account_ref).await? {
            return Ok(existing);
        }
        match self.open_account(account_ref.clone(), token).await {
            Ok(account) => Ok(account),
            // lost a race with another initializer
            Err(LedgerError::DuplicateAccount(_)) => self.resolve(&account_ref).await,
            Err(e) => Err(e),
        }
    }

    /// Get an account by reference
    pub async fn get_account(&self, account_ref: &AccountRef) -> LedgerResult<Option<Account>> {
        self.storage.get_account(account_ref).await
    }

    /// Get an account by reference, returning an error if not found
    pub async fn resolve(&self, account_ref: &AccountRef) -> LedgerResult<Account> {
        self.storage
            .get_account(account_ref)
            .await?
            .ok_or_else(|| LedgerError::AccountNotFound(account_ref.to_string()))
    }

    /// List accounts, optionally filtered by kind
    pub async fn list_accounts(&self, kind: Option<AccountKind>) -> LedgerResult<Vec<Account>> {
        self.storage.list_accounts(kind).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::memory_storage::MemoryStorage;
    use bigdecimal::BigDecimal;

    #[tokio::test]
    async fn test_open_and_resolve() {
        let manager = AccountManager::new(MemoryStorage::new());
        let opened = manager
            .open_account(AccountRef::user("alice"), CurrencyToken::Mana)
            .await
            .unwrap();
        assert_eq!(opened.balance, BigDecimal::from(0));

        let resolved = manager.resolve(&AccountRef::user("alice")).await.unwrap();
        assert_eq!(resolved.account_ref, opened.account_ref);

        // same id under a different kind is a different account
        assert!(matches!(
            manager.resolve(&AccountRef::market_pool("alice")).await,
            Err(LedgerError::AccountNotFound(id)) if id == "market_pool:alice"
        ));
    }

    #[tokio::test]
    async fn test_duplicate_open_fails() {
        let manager = AccountManager::new(MemoryStorage::new());
        manager
            .open_account(AccountRef::user("bob"), CurrencyToken::Mana)
            .await
            .unwrap();
        assert!(matches!(
            manager
                .open_account(AccountRef::user("bob"), CurrencyToken::Mana)
                .await,
            Err(LedgerError::DuplicateAccount(_))
        ));
    }

    #[tokio::test]
    async fn test_ensure_authority_is_idempotent() {
        let manager = AccountManager::new(MemoryStorage::new());
        let first = manager.ensure_authority(CurrencyToken::Mana).await.unwrap();
        let second = manager.ensure_authority(CurrencyToken::Mana).await.unwrap();
        assert_eq!(first.account_ref, second.account_ref);
        assert_eq!(
            manager
                .list_accounts(Some(AccountKind::Authority))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_resolve_inside_unit_of_work() {
        let storage = MemoryStorage::new();
        let manager = AccountManager::new(storage.clone());
        manager
            .open_account(AccountRef::user("carol"), CurrencyToken::Spice)
            .await
            .unwrap();

        let mut uow = storage.begin().await.unwrap();
        let account = resolve_account(uow.as_mut(), &AccountRef::user("carol"))
            .await
            .unwrap();
        assert_eq!(account.token, CurrencyToken::Spice);
        assert!(resolve_account(uow.as_mut(), &AccountRef::user("dave"))
            .await
            .is_err());
    }
}
