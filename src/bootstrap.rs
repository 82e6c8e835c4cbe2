use std::sync::Arc;
use std::time::Duration;

use crate::Result;
use crate::gateway::http::GatewayHttpState;
use crate::gateway::{AzureOpenAiUpstream, Gateway, GatewayConfig, KeyDirectory, Ledger, MemoryStore};

/// Where accounts, keys and transactions live.
#[derive(Clone, Debug, Default)]
pub enum StoreBackend {
    #[default]
    Memory,
    #[cfg(feature = "sqlite")]
    Sqlite(std::path::PathBuf),
}

/// Wires config, store and upstream into a ready-to-serve HTTP state, with the
/// configured seed keys registered.
pub async fn build_state(
    config: &GatewayConfig,
    store: StoreBackend,
    admin_token: Option<String>,
) -> Result<GatewayHttpState> {
    let (keys, ledger): (Arc<dyn KeyDirectory>, Arc<dyn Ledger>) = match store {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            (store.clone(), store)
        }
        #[cfg(feature = "sqlite")]
        StoreBackend::Sqlite(path) => {
            let store = crate::gateway::SqliteStore::new(path);
            store.init().await?;
            tracing::info!(path = %store.path().display(), "sqlite store ready");
            let store = Arc::new(store);
            (store.clone(), store)
        }
    };

    let upstream = AzureOpenAiUpstream::new(
        config.upstream.resolve_endpoint()?,
        config.upstream.resolve_api_key()?,
        Duration::from_secs(config.upstream.timeout_seconds.max(1)),
    )?
    .with_api_version(config.upstream.api_version.clone());

    let gateway = Gateway::new(config, keys, ledger, Arc::new(upstream))?;
    gateway.seed_keys(&config.api_keys).await?;
    tracing::info!(
        models = %gateway.supported_models().join(","),
        seeded_keys = config.api_keys.len(),
        environment = ?gateway.environment(),
        "gateway configured"
    );

    let mut state = GatewayHttpState::new(gateway);
    if let Some(token) = admin_token {
        state = state.with_admin_token(token);
    }
    Ok(state)
}
