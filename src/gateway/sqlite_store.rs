use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{OptionalExtension, TransactionBehavior};
use thiserror::Error;

use super::keys::generate_api_key;
use super::ledger::{ensure_positive, page_bounds};
use super::{
    Account, ApiKeyRecord, Clock, KeyDirectory, Ledger, LedgerError, Money, StoreError,
    SystemClock, TransactionPage, TransactionRecord, key_hint,
};

/// Durable store backed by one SQLite file. Every call opens its own
/// connection on the blocking pool; SQLite's write lock serializes debits.
#[derive(Clone)]
pub struct SqliteStore {
    path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Money, available: Money },
    #[error("maximum number of API keys reached ({max} per account)")]
    KeyLimitReached { max: usize },
    #[error("balance overflow for account {account_id}")]
    Overflow { account_id: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<SqliteStoreError> for StoreError {
    fn from(err: SqliteStoreError) -> Self {
        match err {
            SqliteStoreError::KeyLimitReached { max } => StoreError::KeyLimitReached { max },
            SqliteStoreError::Store(err) => err,
            other => StoreError::Backend(other.to_string()),
        }
    }
}

impl From<SqliteStoreError> for LedgerError {
    fn from(err: SqliteStoreError) -> Self {
        match err {
            SqliteStoreError::InsufficientFunds {
                required,
                available,
            } => LedgerError::InsufficientFunds {
                required,
                available,
            },
            other => LedgerError::Store(other.into()),
        }
    }
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Timestamps new rows from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn now_ms(&self) -> i64 {
        u64_to_i64(self.clock.now_epoch_millis())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    async fn get_or_create_account(&self, account_id: &str) -> Result<Account, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let ts_ms = self.now_ms();

        tokio::task::spawn_blocking(move || -> Result<Account, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            ensure_account(&conn, &account_id, ts_ms)?;
            load_account(&conn, &account_id)
        })
        .await?
    }

    async fn apply_delta(
        &self,
        account_id: &str,
        delta: Money,
        description: &str,
    ) -> Result<Money, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let description = description.to_string();
        let ts_ms = self.now_ms();

        tokio::task::spawn_blocking(move || -> Result<Money, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            // IMMEDIATE takes the write lock up front so the check below and the
            // update cannot interleave with another writer.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_account(&tx, &account_id, ts_ms)?;

            let updated = if delta.micros() < 0 {
                let required = delta.negate();
                let updated = tx.execute(
                    "UPDATE accounts
                     SET balance_micros = balance_micros - ?1
                     WHERE account_id = ?2 AND balance_micros >= ?1",
                    rusqlite::params![required.micros(), account_id],
                )?;
                if updated == 0 {
                    let available = load_account(&tx, &account_id)?.balance;
                    return Err(SqliteStoreError::InsufficientFunds {
                        required,
                        available,
                    });
                }
                updated
            } else {
                tx.execute(
                    "UPDATE accounts
                     SET balance_micros = balance_micros + ?1
                     WHERE account_id = ?2 AND balance_micros <= ?3 - ?1",
                    rusqlite::params![delta.micros(), account_id, i64::MAX],
                )?
            };
            if updated == 0 {
                return Err(SqliteStoreError::Overflow { account_id });
            }

            tx.execute(
                "INSERT INTO transactions (account_id, amount_micros, description, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![account_id, delta.micros(), description, ts_ms],
            )?;
            let balance = load_account(&tx, &account_id)?.balance;
            tx.commit()?;
            Ok(balance)
        })
        .await?
    }

    async fn page(
        &self,
        account_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<TransactionPage, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let (page, page_size) = page_bounds(page, page_size);
        let offset = i64::from(page - 1) * i64::from(page_size);

        tokio::task::spawn_blocking(move || -> Result<TransactionPage, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;

            let total_count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM transactions WHERE account_id = ?1",
                rusqlite::params![account_id],
                |row| row.get(0),
            )?;

            let mut stmt = conn.prepare(
                "SELECT id, account_id, amount_micros, description, created_at_ms
                 FROM transactions
                 WHERE account_id = ?1
                 ORDER BY id DESC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![account_id, i64::from(page_size), offset],
                |row| {
                    Ok(TransactionRecord {
                        id: row.get(0)?,
                        account_id: row.get(1)?,
                        amount: Money::from_micros(row.get(2)?),
                        description: row.get(3)?,
                        created_at_ms: i64_to_u64(row.get(4)?),
                    })
                },
            )?;

            let mut transactions = Vec::new();
            for row in rows {
                transactions.push(row?);
            }
            Ok(TransactionPage {
                transactions,
                total_count: i64_to_u64(total_count),
            })
        })
        .await?
    }

    async fn lookup_key(&self, key: &str) -> Result<Option<ApiKeyRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<ApiKeyRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let record = conn
                .query_row(
                    "SELECT key, account_id, created_at_ms FROM api_keys WHERE key = ?1",
                    rusqlite::params![key],
                    key_from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await?
    }

    async fn create_key_capped(
        &self,
        account_id: &str,
        max_per_account: usize,
    ) -> Result<ApiKeyRecord, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let ts_ms = self.now_ms();
        let key = generate_api_key()?;

        tokio::task::spawn_blocking(move || -> Result<ApiKeyRecord, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let owned: i64 = tx.query_row(
                "SELECT COUNT(*) FROM api_keys WHERE account_id = ?1",
                rusqlite::params![account_id],
                |row| row.get(0),
            )?;
            if i64_to_u64(owned) >= max_per_account as u64 {
                return Err(SqliteStoreError::KeyLimitReached {
                    max: max_per_account,
                });
            }

            tx.execute(
                "INSERT INTO api_keys (key, account_id, created_at_ms) VALUES (?1, ?2, ?3)",
                rusqlite::params![key, account_id, ts_ms],
            )?;
            tx.commit()?;
            Ok(ApiKeyRecord {
                key,
                account_id,
                created_at_ms: i64_to_u64(ts_ms),
            })
        })
        .await?
    }

    async fn register_key(&self, record: ApiKeyRecord) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let inserted = conn.execute(
                "INSERT INTO api_keys (key, account_id, created_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO NOTHING",
                rusqlite::params![
                    record.key,
                    record.account_id,
                    u64_to_i64(record.created_at_ms)
                ],
            )?;
            if inserted > 0 {
                return Ok(());
            }

            let owner: String = conn.query_row(
                "SELECT account_id FROM api_keys WHERE key = ?1",
                rusqlite::params![record.key],
                |row| row.get(0),
            )?;
            if owner != record.account_id {
                return Err(StoreError::KeyOwnedElsewhere {
                    key: key_hint(&record.key),
                }
                .into());
            }
            Ok(())
        })
        .await?
    }

    async fn keys_for(&self, account_id: &str) -> Result<Vec<ApiKeyRecord>, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<Vec<ApiKeyRecord>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT key, account_id, created_at_ms
                 FROM api_keys
                 WHERE account_id = ?1
                 ORDER BY created_at_ms, key",
            )?;
            let rows = stmt.query_map(rusqlite::params![account_id], key_from_row)?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }

    async fn remove_key(&self, account_id: &str, key: &str) -> Result<bool, SqliteStoreError> {
        let path = self.path.clone();
        let account_id = account_id.to_string();
        let key = key.to_string();

        tokio::task::spawn_blocking(move || -> Result<bool, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let deleted = conn.execute(
                "DELETE FROM api_keys WHERE key = ?1 AND account_id = ?2",
                rusqlite::params![key, account_id],
            )?;
            Ok(deleted > 0)
        })
        .await?
    }
}

#[async_trait]
impl Ledger for SqliteStore {
    async fn get_or_create(&self, account_id: &str) -> Result<Account, LedgerError> {
        Ok(self.get_or_create_account(account_id).await?)
    }

    async fn debit(
        &self,
        account_id: &str,
        amount: Money,
        description: &str,
    ) -> Result<Money, LedgerError> {
        ensure_positive(amount)?;
        Ok(self
            .apply_delta(account_id, amount.negate(), description)
            .await?)
    }

    async fn credit(
        &self,
        account_id: &str,
        amount: Money,
        description: &str,
    ) -> Result<Money, LedgerError> {
        ensure_positive(amount)?;
        Ok(self.apply_delta(account_id, amount, description).await?)
    }

    async fn list_transactions(
        &self,
        account_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<TransactionPage, LedgerError> {
        Ok(self.page(account_id, page, page_size).await?)
    }
}

#[async_trait]
impl KeyDirectory for SqliteStore {
    async fn resolve(&self, key: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        Ok(self.lookup_key(key).await?)
    }

    async fn create_key(
        &self,
        account_id: &str,
        max_per_account: usize,
    ) -> Result<ApiKeyRecord, StoreError> {
        Ok(self.create_key_capped(account_id, max_per_account).await?)
    }

    async fn insert_key(&self, record: ApiKeyRecord) -> Result<(), StoreError> {
        Ok(self.register_key(record).await?)
    }

    async fn list_keys(&self, account_id: &str) -> Result<Vec<ApiKeyRecord>, StoreError> {
        Ok(self.keys_for(account_id).await?)
    }

    async fn delete_key(&self, account_id: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self.remove_key(account_id, key).await?)
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            account_id TEXT PRIMARY KEY NOT NULL,
            balance_micros INTEGER NOT NULL DEFAULT 0 CHECK (balance_micros >= 0),
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            amount_micros INTEGER NOT NULL,
            description TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_transactions_account_id
            ON transactions(account_id, id);

        CREATE TABLE IF NOT EXISTS api_keys (
            key TEXT PRIMARY KEY NOT NULL,
            account_id TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_api_keys_account_id
            ON api_keys(account_id);",
    )?;
    Ok(())
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn ensure_account(
    conn: &rusqlite::Connection,
    account_id: &str,
    ts_ms: i64,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR IGNORE INTO accounts (account_id, balance_micros, created_at_ms)
         VALUES (?1, 0, ?2)",
        rusqlite::params![account_id, ts_ms],
    )?;
    Ok(())
}

fn load_account(conn: &rusqlite::Connection, account_id: &str) -> Result<Account, SqliteStoreError> {
    let account = conn.query_row(
        "SELECT account_id, balance_micros, created_at_ms FROM accounts WHERE account_id = ?1",
        rusqlite::params![account_id],
        |row| {
            Ok(Account {
                account_id: row.get(0)?,
                balance: Money::from_micros(row.get(1)?),
                created_at_ms: i64_to_u64(row.get(2)?),
            })
        },
    )?;
    Ok(account)
}

fn key_from_row(row: &rusqlite::Row<'_>) -> Result<ApiKeyRecord, rusqlite::Error> {
    Ok(ApiKeyRecord {
        key: row.get(0)?,
        account_id: row.get(1)?,
        created_at_ms: i64_to_u64(row.get(2)?),
    })
}

fn u64_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
