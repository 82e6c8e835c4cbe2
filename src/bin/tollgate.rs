use std::path::PathBuf;

use clap::Parser;
use tollgate::StoreBackend;
use tollgate::gateway::GatewayConfig;
use tollgate::gateway::telemetry::{TelemetryGuard, init_logging};

#[derive(Parser, Debug)]
#[command(author, version, about = "Metered chat-completion gateway", long_about = None)]
struct Cli {
    /// Gateway config file (JSON, or TOML when it ends in .toml)
    config: PathBuf,

    /// Address to listen on
    #[arg(long, alias = "addr", default_value = "127.0.0.1:8080")]
    listen: String,

    /// Token for the /admin routes; they stay disabled without one
    #[arg(long, env = "TOLLGATE_ADMIN_TOKEN")]
    admin_token: Option<String>,

    /// Persist accounts, keys and transactions in this SQLite file
    #[arg(long)]
    sqlite: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Export traces over OTLP/HTTP
    #[arg(long)]
    otel: bool,

    /// OTLP endpoint (implies --otel)
    #[arg(long)]
    otel_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let _telemetry = init_telemetry(&cli)?;

    let config = GatewayConfig::load(&cli.config)?;
    let store = store_backend(cli.sqlite.clone())?;
    let state = tollgate::build_state(&config, store, cli.admin_token.clone()).await?;
    let app = tollgate::gateway::http::router(state);

    let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
    tracing::info!(listen = %cli.listen, "tollgate listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(feature = "sqlite")]
fn store_backend(path: Option<PathBuf>) -> Result<StoreBackend, Box<dyn std::error::Error>> {
    Ok(path.map(StoreBackend::Sqlite).unwrap_or_default())
}

#[cfg(not(feature = "sqlite"))]
fn store_backend(path: Option<PathBuf>) -> Result<StoreBackend, Box<dyn std::error::Error>> {
    if path.is_some() {
        return Err("--sqlite requires `--features sqlite`".into());
    }
    Ok(StoreBackend::Memory)
}

#[cfg(feature = "otel")]
fn init_telemetry(cli: &Cli) -> Result<TelemetryGuard, Box<dyn std::error::Error>> {
    if cli.otel || cli.otel_endpoint.is_some() {
        return tollgate::gateway::telemetry::init_otel(
            "tollgate",
            cli.otel_endpoint.as_deref(),
            cli.json_logs,
        );
    }
    init_logging(cli.json_logs)
}

#[cfg(not(feature = "otel"))]
fn init_telemetry(cli: &Cli) -> Result<TelemetryGuard, Box<dyn std::error::Error>> {
    if cli.otel || cli.otel_endpoint.is_some() {
        return Err("otel requires `--features otel`".into());
    }
    init_logging(cli.json_logs)
}
