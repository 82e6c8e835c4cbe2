//! Metered completion gateway: key resolution, rate limiting, one upstream
//! call, pricing, and an atomic ledger debit per request.

pub mod config;
pub mod costing;
pub mod http;
pub mod keys;
pub mod ledger;
pub mod limits;
pub mod memory_store;
pub mod money;
pub mod observability;
#[cfg(feature = "sqlite")]
pub mod sqlite_store;
mod store_types;
pub mod telemetry;
pub mod upstream;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use costing::PricingTable;
use limits::RateLimiter;
use observability::{Observability, ObservabilitySnapshot};

pub use config::{ConfigError, Environment, GatewayConfig, ModelConfig, SeedKeyConfig, UpstreamConfig};
pub use keys::{KeyDirectory, key_hint};
pub use ledger::{Ledger, LedgerError, StoreError};
pub use limits::RateLimitConfig;
pub use memory_store::MemoryStore;
pub use money::Money;
#[cfg(feature = "sqlite")]
pub use sqlite_store::{SqliteStore, SqliteStoreError};
pub use store_types::{Account, ApiKeyRecord, TransactionPage, TransactionRecord};
pub use upstream::{AzureOpenAiUpstream, Upstream, UpstreamCompletion};

pub const DEFAULT_MODEL: &str = "gpt-4o";

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Inbound body; also forwarded upstream as-is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// The unified success response: upstream completion plus what it cost.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<serde_json::Value>,
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
    pub cost: Money,
    pub remaining_balance: Money,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing API key: include your API key in the x-api-key header")]
    MissingKey,
    #[error("invalid API key: the provided API key is not valid")]
    InvalidKey,
    #[error("Unsupported model: {model}. Available models are: {available}")]
    UnsupportedModel { model: String, available: String },
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("rate limit exceeded: {limit}")]
    RateLimited { limit: String },
    #[error("{message}")]
    Upstream { status: Option<u16>, message: String },
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Money, available: Money },
    #[error("failed to update wallet balance: {message}")]
    Ledger { message: String },
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::MissingKey | GatewayError::InvalidKey => 401,
            GatewayError::UnsupportedModel { .. } | GatewayError::InvalidRequest { .. } => 400,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::Upstream { status, .. } => match status {
                Some(status) if (400..=599).contains(status) => *status,
                _ => 500,
            },
            GatewayError::InsufficientFunds { .. } => 402,
            GatewayError::Ledger { .. } | GatewayError::Internal { .. } => 500,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::MissingKey | GatewayError::InvalidKey => "authentication_error",
            GatewayError::UnsupportedModel { .. } => "invalid_model",
            GatewayError::InvalidRequest { .. } => "invalid_request_error",
            GatewayError::RateLimited { .. } => "rate_limit_error",
            GatewayError::Upstream { .. } => "upstream_api_error",
            GatewayError::InsufficientFunds { .. } => "insufficient_funds",
            GatewayError::Ledger { .. } => "wallet_update_error",
            GatewayError::Internal { .. } => "internal_error",
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::MissingKey => "MISSING_API_KEY",
            GatewayError::InvalidKey => "INVALID_API_KEY",
            GatewayError::UnsupportedModel { .. } => "UNSUPPORTED_MODEL",
            GatewayError::InvalidRequest { .. } => "INVALID_REQUEST",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::Upstream { .. } => "UPSTREAM_ERROR",
            GatewayError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            GatewayError::Ledger { .. } => "WALLET_UPDATE_FAILED",
            GatewayError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Caller-facing message. Store and internal error text stays out of it.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Ledger { .. } => "Failed to update wallet balance".to_string(),
            GatewayError::Internal { .. } => "An internal error occurred".to_string(),
            other => other.to_string(),
        }
    }

    /// Internal detail, only surfaced in development mode.
    pub fn details(&self) -> Option<&str> {
        match self {
            GatewayError::Ledger { message } | GatewayError::Internal { message } => {
                Some(message.as_str())
            }
            _ => None,
        }
    }
}

/// Pipeline position. Failure at any stage exits with a `GatewayError`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Start,
    KeyResolved,
    RateLimitPassed,
    UpstreamCalled,
    CostComputed,
    Debited,
    Responded,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::KeyResolved => "key_resolved",
            Stage::RateLimitPassed => "rate_limit_passed",
            Stage::UpstreamCalled => "upstream_called",
            Stage::CostComputed => "cost_computed",
            Stage::Debited => "debited",
            Stage::Responded => "responded",
        }
    }
}

pub trait Clock: Send + Sync {
    fn now_epoch_millis(&self) -> u64;

    fn now_epoch_seconds(&self) -> u64 {
        self.now_epoch_millis() / 1000
    }
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_millis(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        now.as_millis() as u64
    }
}

/// What the failure log needs to reconstruct where a request stopped.
struct PipelineTrace {
    stage: Stage,
    model: String,
    key: Option<String>,
    account_id: Option<String>,
}

pub struct Gateway {
    pricing: PricingTable,
    deployments: BTreeMap<String, String>,
    environment: Environment,
    max_keys_per_account: usize,
    keys: Arc<dyn KeyDirectory>,
    ledger: Arc<dyn Ledger>,
    upstream: Arc<dyn Upstream>,
    limits: Mutex<RateLimiter>,
    observability: Arc<Observability>,
    clock: Box<dyn Clock>,
}

impl Gateway {
    pub fn new(
        config: &GatewayConfig,
        keys: Arc<dyn KeyDirectory>,
        ledger: Arc<dyn Ledger>,
        upstream: Arc<dyn Upstream>,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(config, keys, ledger, upstream, Box::new(SystemClock))
    }

    pub fn with_clock(
        config: &GatewayConfig,
        keys: Arc<dyn KeyDirectory>,
        ledger: Arc<dyn Ledger>,
        upstream: Arc<dyn Upstream>,
        clock: Box<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            pricing: config.pricing()?,
            deployments: config.deployments()?,
            environment: config.environment,
            max_keys_per_account: config.max_keys_per_account,
            keys,
            ledger,
            upstream,
            limits: Mutex::new(RateLimiter::new(config.rate_limit.clone())),
            observability: Arc::new(Observability::default()),
            clock,
        })
    }

    pub fn observability(&self) -> ObservabilitySnapshot {
        self.observability.snapshot()
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn max_keys_per_account(&self) -> usize {
        self.max_keys_per_account
    }

    pub fn keys(&self) -> &Arc<dyn KeyDirectory> {
        &self.keys
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn supported_models(&self) -> Vec<&str> {
        self.deployments.keys().map(String::as_str).collect()
    }

    /// Registers configured keys and opens their accounts.
    pub async fn seed_keys(&self, seeds: &[SeedKeyConfig]) -> Result<(), GatewayError> {
        for seed in seeds {
            let seed_failure = |err: StoreError| GatewayError::Internal {
                message: format!("failed to seed api key: {err}"),
            };
            let owned = self.keys.list_keys(&seed.account_id).await.map_err(seed_failure)?;
            let already_held = owned.iter().any(|record| record.key == seed.key);
            if !already_held && owned.len() >= self.max_keys_per_account {
                return Err(seed_failure(StoreError::KeyLimitReached {
                    max: self.max_keys_per_account,
                }));
            }
            self.keys
                .insert_key(ApiKeyRecord {
                    key: seed.key.clone(),
                    account_id: seed.account_id.clone(),
                    created_at_ms: self.clock.now_epoch_millis(),
                })
                .await
                .map_err(seed_failure)?;
            self.ledger
                .get_or_create(&seed.account_id)
                .await
                .map_err(ledger_failure)?;
        }
        Ok(())
    }

    pub async fn handle(
        &self,
        api_key: Option<&str>,
        request: ChatRequest,
    ) -> Result<ChatCompletion, GatewayError> {
        self.observability.record_request();
        let mut trace = PipelineTrace {
            stage: Stage::Start,
            model: request.model.clone(),
            key: None,
            account_id: None,
        };

        let result = self.run(api_key, request, &mut trace).await;
        match &result {
            Ok(completion) => {
                tracing::info!(
                    account_id = trace.account_id.as_deref().unwrap_or_default(),
                    model = %trace.model,
                    total_tokens = completion.usage.total_tokens,
                    cost = %completion.cost,
                    remaining_balance = %completion.remaining_balance,
                    "chat completion metered"
                );
            }
            Err(err) => self.record_failure(err, &trace),
        }
        result
    }

    async fn run(
        &self,
        api_key: Option<&str>,
        request: ChatRequest,
        trace: &mut PipelineTrace,
    ) -> Result<ChatCompletion, GatewayError> {
        let api_key = api_key
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(GatewayError::MissingKey)?;
        trace.key = Some(key_hint(api_key));

        let record = self
            .keys
            .resolve(api_key)
            .await
            .map_err(|err| GatewayError::Internal {
                message: format!("key lookup failed: {err}"),
            })?
            .ok_or(GatewayError::InvalidKey)?;
        let account_id = record.account_id;
        trace.account_id = Some(account_id.clone());
        self.ledger
            .get_or_create(&account_id)
            .await
            .map_err(ledger_failure)?;
        trace.stage = Stage::KeyResolved;

        let deployment = self.deployments.get(&request.model).ok_or_else(|| {
            GatewayError::UnsupportedModel {
                model: request.model.clone(),
                available: self.supported_models().join(", "),
            }
        })?;
        if request.messages.is_empty() {
            return Err(GatewayError::InvalidRequest {
                reason: "messages must not be empty".to_string(),
            });
        }

        {
            let now = self.clock.now_epoch_seconds();
            let mut limits = self.limits.lock().await;
            limits.check(&account_id, now)?;
        }
        trace.stage = Stage::RateLimitPassed;

        self.observability.record_upstream_call();
        let completion = self.upstream.complete(deployment, &request).await?;
        trace.stage = Stage::UpstreamCalled;

        let usage = completion.usage.ok_or_else(|| GatewayError::Upstream {
            status: None,
            message: "upstream response did not include token usage".to_string(),
        })?;
        let cost = self
            .pricing
            .cost(&request.model, usage.total_tokens)
            .map_err(|err| GatewayError::Internal {
                message: err.to_string(),
            })?;
        trace.stage = Stage::CostComputed;

        // The upstream call is paid for; settle on a detached task so a caller
        // that goes away here cannot abort the debit.
        let description = format!(
            "Chat completion ({}) - {} tokens",
            request.model, usage.total_tokens
        );
        let settlement = tokio::spawn(settle(
            self.ledger.clone(),
            self.observability.clone(),
            account_id,
            cost,
            description,
        ));
        let remaining_balance = settlement.await.map_err(|err| GatewayError::Internal {
            message: format!("settlement task failed: {err}"),
        })??;
        trace.stage = Stage::Debited;

        let now_ms = self.clock.now_epoch_millis();
        let response = ChatCompletion {
            id: format!("chatcmpl-{now_ms}"),
            object: "chat.completion".to_string(),
            created: now_ms / 1000,
            model: completion.model.unwrap_or(request.model),
            choices: completion.choices,
            usage,
            system_fingerprint: completion.system_fingerprint,
            cost,
            remaining_balance,
        };
        trace.stage = Stage::Responded;
        Ok(response)
    }

    fn record_failure(&self, err: &GatewayError, trace: &PipelineTrace) {
        match err {
            GatewayError::InvalidKey => self.observability.record_invalid_key(),
            GatewayError::UnsupportedModel { .. } => self.observability.record_unsupported_model(),
            GatewayError::RateLimited { .. } => self.observability.record_rate_limited(),
            GatewayError::Upstream { .. } => self.observability.record_upstream_error(),
            GatewayError::InsufficientFunds { .. } => {
                self.observability.record_insufficient_funds()
            }
            GatewayError::Ledger { .. } => self.observability.record_ledger_error(),
            _ => {}
        }

        let account_id = trace.account_id.as_deref().unwrap_or_default();
        let key = trace.key.as_deref().unwrap_or_default();
        if err.status_code() >= 500 {
            tracing::error!(
                account_id,
                model = %trace.model,
                stage = trace.stage.as_str(),
                key,
                code = err.code(),
                error = %err,
                "chat completion failed"
            );
        } else {
            tracing::warn!(
                account_id,
                model = %trace.model,
                stage = trace.stage.as_str(),
                key,
                code = err.code(),
                error = %err,
                "chat completion rejected"
            );
        }
    }
}

async fn settle(
    ledger: Arc<dyn Ledger>,
    observability: Arc<Observability>,
    account_id: String,
    cost: Money,
    description: String,
) -> Result<Money, GatewayError> {
    if !cost.is_positive() {
        let account = ledger
            .get_or_create(&account_id)
            .await
            .map_err(ledger_failure)?;
        return Ok(account.balance);
    }

    let balance = ledger
        .debit(&account_id, cost, &description)
        .await
        .map_err(ledger_failure)?;
    observability.record_debit();
    tracing::debug!(account_id = %account_id, cost = %cost, balance = %balance, "debit committed");
    Ok(balance)
}

fn ledger_failure(err: LedgerError) -> GatewayError {
    match err {
        LedgerError::InsufficientFunds {
            required,
            available,
        } => GatewayError::InsufficientFunds {
            required,
            available,
        },
        other => GatewayError::Ledger {
            message: other.to_string(),
        },
    }
}
