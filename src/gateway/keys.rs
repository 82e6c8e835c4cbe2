use async_trait::async_trait;

use super::{ApiKeyRecord, StoreError};

/// Bytes of entropy in a generated API key (hex-encoded to 64 chars).
pub const API_KEY_BYTES: usize = 32;

pub const DEFAULT_MAX_KEYS_PER_ACCOUNT: usize = 2;

/// API key -> account lookup, plus the management calls the admin routes need.
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// Exact-match lookup. `None` covers both "never issued" and "deleted".
    async fn resolve(&self, key: &str) -> Result<Option<ApiKeyRecord>, StoreError>;

    /// Issues a fresh random key unless `account_id` already holds `max_per_account`.
    async fn create_key(
        &self,
        account_id: &str,
        max_per_account: usize,
    ) -> Result<ApiKeyRecord, StoreError>;

    /// Registers a known key. Re-registering it for the same account is a no-op;
    /// a key already owned by another account is rejected and left unchanged.
    async fn insert_key(&self, record: ApiKeyRecord) -> Result<(), StoreError>;

    async fn list_keys(&self, account_id: &str) -> Result<Vec<ApiKeyRecord>, StoreError>;

    /// Returns whether a key owned by `account_id` was removed.
    async fn delete_key(&self, account_id: &str, key: &str) -> Result<bool, StoreError>;
}

pub fn generate_api_key() -> Result<String, StoreError> {
    let mut bytes = [0u8; API_KEY_BYTES];
    getrandom::fill(&mut bytes)
        .map_err(|err| StoreError::Backend(format!("random source unavailable: {err}")))?;
    Ok(hex_encode(&bytes))
}

/// Short prefix safe to put in logs and debug output.
pub fn key_hint(key: &str) -> String {
    let prefix: String = key.chars().take(6).collect();
    format!("{prefix}…")
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}
