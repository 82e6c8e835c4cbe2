use thiserror::Error;

use crate::gateway::{ConfigError, GatewayError};

#[derive(Debug, Error)]
pub enum TollgateError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[cfg(feature = "sqlite")]
    #[error("sqlite store error: {0}")]
    Sqlite(#[from] crate::gateway::SqliteStoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TollgateError>;
