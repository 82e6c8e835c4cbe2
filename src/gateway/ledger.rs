use async_trait::async_trait;
use thiserror::Error;

use super::{Account, Money, TransactionPage};

pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("maximum number of API keys reached ({max} per account)")]
    KeyLimitReached { max: usize },
    #[error("api key {key} already belongs to another account")]
    KeyOwnedElsewhere { key: String },
    #[error("store error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Money, available: Money },
    #[error("invalid amount: {amount}")]
    InvalidAmount { amount: Money },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Account balances and their append-only transaction history.
///
/// Implementations must serialize `debit` per account: the balance check and
/// the decrement happen as one step, so two concurrent debits can never both
/// spend the same funds.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Returns the account, creating it with a zero balance on first access.
    async fn get_or_create(&self, account_id: &str) -> Result<Account, LedgerError>;

    /// Subtracts `amount` and appends a `-amount` transaction. Returns the new balance.
    async fn debit(
        &self,
        account_id: &str,
        amount: Money,
        description: &str,
    ) -> Result<Money, LedgerError>;

    /// Adds `amount` and appends a `+amount` transaction. Returns the new balance.
    async fn credit(
        &self,
        account_id: &str,
        amount: Money,
        description: &str,
    ) -> Result<Money, LedgerError>;

    /// Most-recent-first page of history; `page` is 1-based.
    async fn list_transactions(
        &self,
        account_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<TransactionPage, LedgerError>;
}

/// Normalizes paging input to a 1-based page and a bounded page size.
pub fn page_bounds(page: u32, page_size: u32) -> (u32, u32) {
    (page.max(1), page_size.clamp(1, MAX_PAGE_SIZE))
}

pub(crate) fn ensure_positive(amount: Money) -> Result<(), LedgerError> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(LedgerError::InvalidAmount { amount })
    }
}
