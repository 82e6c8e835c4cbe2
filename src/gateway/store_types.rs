use serde::{Deserialize, Serialize};

use super::Money;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub account_id: String,
    pub balance: Money,
    pub created_at_ms: u64,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key: String,
    pub account_id: String,
    pub created_at_ms: u64,
}

impl std::fmt::Debug for ApiKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyRecord")
            .field("key", &super::keys::key_hint(&self.key))
            .field("account_id", &self.account_id)
            .field("created_at_ms", &self.created_at_ms)
            .finish()
    }
}

/// One balance change. Debits carry a negative amount.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: i64,
    pub account_id: String,
    pub amount: Money,
    pub description: String,
    pub created_at_ms: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransactionPage {
    pub transactions: Vec<TransactionRecord>,
    pub total_count: u64,
}
