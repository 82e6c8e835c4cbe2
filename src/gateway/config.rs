use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::costing::{ModelRateConfig, PricingError, PricingTable};
use super::keys::DEFAULT_MAX_KEYS_PER_ACCOUNT;
use super::limits::RateLimitConfig;
use super::upstream::{DEFAULT_API_VERSION, DEFAULT_TIMEOUT_SECONDS};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid toml config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Pricing(#[from] PricingError),
    #[error("missing required upstream configuration: {0}")]
    MissingUpstream(&'static str),
    #[error("environment variable {name} is not set")]
    MissingEnv { name: String },
    #[error("model {model} has no deployment")]
    MissingDeployment { model: String },
    #[error("max_keys_per_account must be at least 1")]
    InvalidKeyCap,
    #[error("account {account_id} has {count} seeded api keys, above max_keys_per_account ({max})")]
    TooManySeedKeys {
        account_id: String,
        count: usize,
        max: usize,
    },
    #[error("seeded api key is listed for more than one account")]
    DuplicateSeedKey,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    #[default]
    Production,
}

impl Environment {
    /// Whether internal error details may be returned to callers.
    pub fn exposes_details(self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Everything the gateway needs, built once at startup and passed in.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub api_keys: Vec<SeedKeyConfig>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default = "default_max_keys_per_account")]
    pub max_keys_per_account: usize,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("endpoint", &self.endpoint)
            .field("endpoint_env", &self.endpoint_env)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_key_env", &self.api_key_env)
            .field("api_version", &self.api_version)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Upstream deployment name; defaults to the model name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_env: Option<String>,
    #[serde(flatten)]
    pub pricing: ModelRateConfig,
}

/// A key provisioned from configuration rather than through the admin API.
#[derive(Clone, Serialize, Deserialize)]
pub struct SeedKeyConfig {
    pub key: String,
    pub account_id: String,
}

impl std::fmt::Debug for SeedKeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedKeyConfig")
            .field("key", &"<redacted>")
            .field("account_id", &self.account_id)
            .finish()
    }
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

fn default_max_keys_per_account() -> usize {
    DEFAULT_MAX_KEYS_PER_ACCOUNT
}

/// gpt-4o 0.0005/token, gpt-4 0.0006/token, gpt-3.5-turbo 0.00002/token.
pub fn default_models() -> BTreeMap<String, ModelConfig> {
    [
        ("gpt-4o", 0.0005),
        ("gpt-4", 0.0006),
        ("gpt-3.5-turbo", 0.00002),
    ]
    .into_iter()
    .map(|(model, per_token)| {
        (
            model.to_string(),
            ModelConfig {
                deployment: None,
                deployment_env: None,
                pricing: ModelRateConfig {
                    cost_per_token: Some(per_token),
                    cost_per_1k_tokens: None,
                },
            },
        )
    })
    .collect()
}

impl UpstreamConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            endpoint_env: None,
            api_key: Some(api_key.into()),
            api_key_env: None,
            api_version: default_api_version(),
            timeout_seconds: default_timeout_seconds(),
        }
    }

    pub fn resolve_endpoint(&self) -> Result<String, ConfigError> {
        if !self.endpoint.trim().is_empty() {
            return Ok(self.endpoint.trim().to_string());
        }
        match self.endpoint_env.as_deref() {
            Some(name) => read_env(name),
            None => Err(ConfigError::MissingUpstream("endpoint")),
        }
    }

    pub fn resolve_api_key(&self) -> Result<String, ConfigError> {
        if let Some(key) = self.api_key.as_deref().filter(|key| !key.trim().is_empty()) {
            return Ok(key.to_string());
        }
        match self.api_key_env.as_deref() {
            Some(name) => read_env(name),
            None => Err(ConfigError::MissingUpstream("api_key")),
        }
    }
}

impl GatewayConfig {
    pub fn new(upstream: UpstreamConfig) -> Self {
        Self {
            upstream,
            models: BTreeMap::new(),
            rate_limit: RateLimitConfig::default(),
            api_keys: Vec::new(),
            environment: Environment::default(),
            max_keys_per_account: default_max_keys_per_account(),
        }
    }

    /// Parses JSON, or TOML when the file ends in `.toml`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            Self::from_toml_str(&raw)
        } else {
            Self::from_json_str(&raw)
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Configured models, or the built-in table when none are listed.
    pub fn effective_models(&self) -> BTreeMap<String, ModelConfig> {
        if self.models.is_empty() {
            default_models()
        } else {
            self.models.clone()
        }
    }

    pub fn pricing(&self) -> Result<PricingTable, ConfigError> {
        let rates: BTreeMap<String, ModelRateConfig> = self
            .effective_models()
            .into_iter()
            .map(|(model, config)| (model, config.pricing))
            .collect();
        Ok(PricingTable::from_rates(&rates)?)
    }

    /// Static model -> deployment map.
    pub fn deployments(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        let mut out = BTreeMap::new();
        for (model, config) in self.effective_models() {
            let deployment = match (&config.deployment, &config.deployment_env) {
                (Some(deployment), _) => deployment.clone(),
                (None, Some(name)) => read_env(name)?,
                (None, None) => model.clone(),
            };
            if deployment.trim().is_empty() {
                return Err(ConfigError::MissingDeployment { model });
            }
            out.insert(model, deployment);
        }
        Ok(out)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_keys_per_account == 0 {
            return Err(ConfigError::InvalidKeyCap);
        }
        self.validate_seed_keys()?;
        self.pricing()?;
        self.deployments()?;
        Ok(())
    }

    fn validate_seed_keys(&self) -> Result<(), ConfigError> {
        let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
        let mut per_account: BTreeMap<&str, usize> = BTreeMap::new();
        for seed in &self.api_keys {
            match owners.insert(seed.key.as_str(), seed.account_id.as_str()) {
                Some(owner) if owner != seed.account_id => {
                    return Err(ConfigError::DuplicateSeedKey);
                }
                Some(_) => continue,
                None => *per_account.entry(seed.account_id.as_str()).or_default() += 1,
            }
        }
        match per_account
            .into_iter()
            .find(|(_, count)| *count > self.max_keys_per_account)
        {
            Some((account_id, count)) => Err(ConfigError::TooManySeedKeys {
                account_id: account_id.to_string(),
                count,
                max: self.max_keys_per_account,
            }),
            None => Ok(()),
        }
    }
}

fn read_env(name: &str) -> Result<String, ConfigError> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ConfigError::MissingEnv {
            name: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::Money;

    #[test]
    fn json_config_applies_defaults() {
        let config = GatewayConfig::from_json_str(
            r#"{"upstream": {"endpoint": "https://example.openai.azure.com", "api_key": "k"}}"#,
        )
        .expect("config");

        assert_eq!(config.upstream.api_version, "2023-05-15");
        assert_eq!(config.upstream.timeout_seconds, 30);
        assert_eq!(config.max_keys_per_account, 2);
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.rate_limit.requests, None);

        let pricing = config.pricing().expect("pricing");
        assert_eq!(pricing.models(), vec!["gpt-3.5-turbo", "gpt-4", "gpt-4o"]);
        assert_eq!(
            pricing.cost("gpt-4o", 1000).expect("cost"),
            Money::from_millis(500)
        );

        let deployments = config.deployments().expect("deployments");
        assert_eq!(deployments.get("gpt-4o").map(String::as_str), Some("gpt-4o"));
    }

    #[test]
    fn toml_config_with_custom_models() {
        let config = GatewayConfig::from_toml_str(
            r#"
            environment = "development"

            [upstream]
            endpoint = "https://example.openai.azure.com"
            api_key_env = "TOLLGATE_TEST_UNSET_KEY"
            timeout_seconds = 5

            [rate_limit]
            requests = 10
            window_seconds = 60

            [models."gpt-4o"]
            deployment = "prod-4o"
            cost_per_1k_tokens = 0.5

            [[api_keys]]
            key = "seed"
            account_id = "acct-1"
            "#,
        )
        .expect("config");

        assert!(config.environment.exposes_details());
        assert_eq!(config.rate_limit, RateLimitConfig::new(10, 60));
        assert_eq!(config.api_keys.len(), 1);
        assert_eq!(
            config.deployments().expect("deployments").get("gpt-4o").map(String::as_str),
            Some("prod-4o")
        );
        assert_eq!(config.pricing().expect("pricing").models(), vec!["gpt-4o"]);
        assert!(matches!(
            config.upstream.resolve_api_key(),
            Err(ConfigError::MissingEnv { .. })
        ));
    }

    #[test]
    fn validate_rejects_zero_key_cap_and_bad_prices() {
        let mut config = GatewayConfig::new(UpstreamConfig::new("http://localhost", "k"));
        config.max_keys_per_account = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidKeyCap)));

        config.max_keys_per_account = 2;
        config.models.insert(
            "broken".to_string(),
            ModelConfig {
                deployment: Some("d".to_string()),
                ..ModelConfig::default()
            },
        );
        assert!(matches!(config.validate(), Err(ConfigError::Pricing(_))));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let mut config = GatewayConfig::new(UpstreamConfig::new("http://localhost", "upstream-secret"));
        config.api_keys.push(SeedKeyConfig {
            key: "client-secret".to_string(),
            account_id: "acct".to_string(),
        });
        let debug = format!("{config:?}");
        assert!(!debug.contains("upstream-secret"));
        assert!(!debug.contains("client-secret"));
    }

    fn seed(key: &str, account_id: &str) -> SeedKeyConfig {
        SeedKeyConfig {
            key: key.to_string(),
            account_id: account_id.to_string(),
        }
    }

    #[test]
    fn validate_holds_seed_keys_to_the_account_cap() {
        let mut config = GatewayConfig::new(UpstreamConfig::new("http://localhost", "k"));
        config.api_keys = vec![seed("a1", "acct-a"), seed("a2", "acct-a"), seed("b1", "acct-b")];
        config.validate().expect("within cap");

        // Repeating an entry verbatim does not count twice.
        config.api_keys.push(seed("a1", "acct-a"));
        config.validate().expect("duplicate entry");

        config.api_keys.push(seed("a3", "acct-a"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooManySeedKeys { count: 3, max: 2, .. })
        ));

        config.api_keys = vec![seed("shared", "acct-a"), seed("shared", "acct-b")];
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateSeedKey)));
    }
}
