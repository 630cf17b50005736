use credits_gateway_server::{config::GatewayConfig, create_app, AppState};
use credits_ledger::{CreditsLedger, ResetScheduler};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,credits_gateway_server=debug,credits_ledger=debug";

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    info!("Starting credits gateway...");

    let config = GatewayConfig::from_env()?;
    if config.uses_dev_key() {
        warn!("CREDITS_ADMIN_KEY not set, using the development admin key");
    }

    let storage = config.storage.open()?;
    info!(backend = ?config.storage, "Ledger storage ready");

    let ledger = Arc::new(CreditsLedger::new(storage).with_policy(config.policy.clone()));

    if config.reset_scheduler {
        info!("Starting in-process reset scheduler");
        ResetScheduler::new(ledger.clone()).spawn();
    }

    let state = AppState::new(ledger, config.admin_api_key.as_str());
    let app = create_app(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Credits gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
