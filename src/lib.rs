//! Metered chat-completion gateway.
//!
//! Requests carry an API key; the gateway resolves it to an account, applies a
//! per-account rate limit, makes one upstream completion call, prices the
//! reported token usage and debits the account's prepaid balance before
//! answering. See [`gateway::Gateway::handle`] for the pipeline.

mod bootstrap;
mod error;
pub mod gateway;

pub use bootstrap::{StoreBackend, build_state};
pub use error::{Result, TollgateError};
pub use gateway::{
    Account, ApiKeyRecord, ChatCompletion, ChatMessage, ChatRequest, Gateway, GatewayConfig,
    GatewayError, KeyDirectory, Ledger, LedgerError, MemoryStore, Money, TransactionRecord,
    Upstream, Usage,
};
