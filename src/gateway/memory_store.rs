use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::keys::generate_api_key;
use super::ledger::{ensure_positive, page_bounds};
use super::{
    Account, ApiKeyRecord, Clock, KeyDirectory, Ledger, LedgerError, Money, StoreError,
    SystemClock, TransactionPage, TransactionRecord, key_hint,
};

/// Process-local store. Each account sits behind its own mutex, which is the
/// critical section for read-check-write on its balance.
pub struct MemoryStore {
    accounts: Mutex<HashMap<String, Arc<Mutex<AccountEntry>>>>,
    keys: Mutex<HashMap<String, ApiKeyRecord>>,
    next_transaction_id: AtomicI64,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("next_transaction_id", &self.next_transaction_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct AccountEntry {
    account: Account,
    transactions: Vec<TransactionRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timestamps accounts, keys and transactions from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            accounts: Mutex::default(),
            keys: Mutex::default(),
            next_transaction_id: AtomicI64::new(0),
            clock,
        }
    }

    async fn entry(&self, account_id: &str) -> Arc<Mutex<AccountEntry>> {
        let now_ms = self.clock.now_epoch_millis();
        let mut accounts = self.accounts.lock().await;
        accounts
            .entry(account_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(AccountEntry {
                    account: Account {
                        account_id: account_id.to_string(),
                        balance: Money::ZERO,
                        created_at_ms: now_ms,
                    },
                    transactions: Vec::new(),
                }))
            })
            .clone()
    }

    fn transaction(&self, account_id: &str, amount: Money, description: &str) -> TransactionRecord {
        TransactionRecord {
            id: self.next_transaction_id.fetch_add(1, Ordering::Relaxed) + 1,
            account_id: account_id.to_string(),
            amount,
            description: description.to_string(),
            created_at_ms: self.clock.now_epoch_millis(),
        }
    }
}

#[async_trait]
impl Ledger for MemoryStore {
    async fn get_or_create(&self, account_id: &str) -> Result<Account, LedgerError> {
        let entry = self.entry(account_id).await;
        let entry = entry.lock().await;
        Ok(entry.account.clone())
    }

    async fn debit(
        &self,
        account_id: &str,
        amount: Money,
        description: &str,
    ) -> Result<Money, LedgerError> {
        ensure_positive(amount)?;
        let entry = self.entry(account_id).await;
        let mut entry = entry.lock().await;

        let available = entry.account.balance;
        if amount > available {
            return Err(LedgerError::InsufficientFunds {
                required: amount,
                available,
            });
        }
        let balance = available
            .checked_sub(amount)
            .ok_or_else(|| StoreError::Backend("balance underflow".to_string()))?;

        let record = self.transaction(account_id, amount.negate(), description);
        entry.account.balance = balance;
        entry.transactions.push(record);
        Ok(balance)
    }

    async fn credit(
        &self,
        account_id: &str,
        amount: Money,
        description: &str,
    ) -> Result<Money, LedgerError> {
        ensure_positive(amount)?;
        let entry = self.entry(account_id).await;
        let mut entry = entry.lock().await;

        let balance = entry
            .account
            .balance
            .checked_add(amount)
            .ok_or_else(|| StoreError::Backend("balance overflow".to_string()))?;

        let record = self.transaction(account_id, amount, description);
        entry.account.balance = balance;
        entry.transactions.push(record);
        Ok(balance)
    }

    async fn list_transactions(
        &self,
        account_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<TransactionPage, LedgerError> {
        let (page, page_size) = page_bounds(page, page_size);
        let entry = {
            let accounts = self.accounts.lock().await;
            accounts.get(account_id).cloned()
        };
        let Some(entry) = entry else {
            return Ok(TransactionPage::default());
        };
        let entry = entry.lock().await;

        let skip = (page as usize - 1).saturating_mul(page_size as usize);
        let transactions = entry
            .transactions
            .iter()
            .rev()
            .skip(skip)
            .take(page_size as usize)
            .cloned()
            .collect();
        Ok(TransactionPage {
            transactions,
            total_count: entry.transactions.len() as u64,
        })
    }
}

#[async_trait]
impl KeyDirectory for MemoryStore {
    async fn resolve(&self, key: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        let keys = self.keys.lock().await;
        Ok(keys.get(key).cloned())
    }

    async fn create_key(
        &self,
        account_id: &str,
        max_per_account: usize,
    ) -> Result<ApiKeyRecord, StoreError> {
        let mut keys = self.keys.lock().await;
        let owned = keys
            .values()
            .filter(|record| record.account_id == account_id)
            .count();
        if owned >= max_per_account {
            return Err(StoreError::KeyLimitReached {
                max: max_per_account,
            });
        }

        let record = ApiKeyRecord {
            key: generate_api_key()?,
            account_id: account_id.to_string(),
            created_at_ms: self.clock.now_epoch_millis(),
        };
        keys.insert(record.key.clone(), record.clone());
        Ok(record)
    }

    async fn insert_key(&self, record: ApiKeyRecord) -> Result<(), StoreError> {
        let mut keys = self.keys.lock().await;
        match keys.get(&record.key) {
            Some(existing) if existing.account_id == record.account_id => Ok(()),
            Some(_) => Err(StoreError::KeyOwnedElsewhere {
                key: key_hint(&record.key),
            }),
            None => {
                keys.insert(record.key.clone(), record);
                Ok(())
            }
        }
    }

    async fn list_keys(&self, account_id: &str) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let keys = self.keys.lock().await;
        let mut out: Vec<ApiKeyRecord> = keys
            .values()
            .filter(|record| record.account_id == account_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.key.cmp(&b.key))
        });
        Ok(out)
    }

    async fn delete_key(&self, account_id: &str, key: &str) -> Result<bool, StoreError> {
        let mut keys = self.keys.lock().await;
        let owned = keys
            .get(key)
            .is_some_and(|record| record.account_id == account_id);
        if owned {
            keys.remove(key);
        }
        Ok(owned)
    }
}
