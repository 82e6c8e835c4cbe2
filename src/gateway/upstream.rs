use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ChatRequest, GatewayError, Usage};

pub const DEFAULT_API_VERSION: &str = "2023-05-15";
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

const MAX_UPSTREAM_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Success body of an upstream chat completion. `choices` is passed through to
/// the caller untouched; `usage` is what gets billed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpstreamCompletion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
}

/// One paid completion call against a deployment. Implementations must not retry.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn complete(
        &self,
        deployment: &str,
        request: &ChatRequest,
    ) -> Result<UpstreamCompletion, GatewayError>;
}

/// Azure OpenAI deployments API:
/// `POST {endpoint}/openai/deployments/{deployment}/chat/completions?api-version=..`.
#[derive(Clone)]
pub struct AzureOpenAiUpstream {
    endpoint: String,
    api_key: String,
    api_version: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for AzureOpenAiUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureOpenAiUpstream")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("api_version", &self.api_version)
            .finish()
    }
}

impl AzureOpenAiUpstream {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| GatewayError::Internal {
                message: format!("upstream http client error: {err}"),
            })?;
        Ok(Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            api_version: DEFAULT_API_VERSION.to_string(),
            client,
        })
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    fn url(&self, deployment: &str) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint.trim_end_matches('/'),
            deployment,
            self.api_version
        )
    }
}

#[async_trait]
impl Upstream for AzureOpenAiUpstream {
    async fn complete(
        &self,
        deployment: &str,
        request: &ChatRequest,
    ) -> Result<UpstreamCompletion, GatewayError> {
        let response = self
            .client
            .post(self.url(deployment))
            .header("api-key", &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|err| GatewayError::Upstream {
                status: None,
                message: if err.is_timeout() {
                    "upstream request timed out".to_string()
                } else {
                    format!("upstream request failed: {err}")
                },
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(GatewayError::Upstream {
                status: Some(status.as_u16()),
                message: upstream_error_message(&body),
            });
        }

        response
            .json::<UpstreamCompletion>()
            .await
            .map_err(|err| GatewayError::Upstream {
                status: None,
                message: format!("upstream response decode error: {err}"),
            })
    }
}

/// Prefers the provider's `error.message`; falls back to the (truncated) raw body.
fn upstream_error_message(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Some(message) = value
            .get("error")
            .and_then(|error| error.get("message"))
            .and_then(|message| message.as_str())
        {
            return message.to_string();
        }
    }

    if body.is_empty() {
        return "upstream request failed".to_string();
    }
    let truncated = &body[..body.len().min(MAX_UPSTREAM_ERROR_BODY_BYTES)];
    let mut message = String::from_utf8_lossy(truncated).to_string();
    if body.len() > MAX_UPSTREAM_ERROR_BODY_BYTES {
        message.push_str("...(truncated)");
    }
    message
}
