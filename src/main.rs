mod bridge;
mod config;
mod server;
mod twilio;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::server::AppState;
use crate::twilio::TwilioClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,flex_sms_bridge=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let client = TwilioClient::new(config.twilio.clone());

    info!("Configuration loaded successfully");
    info!("  Flex API: {}", config.twilio.flex_base_url);
    info!("  Proxy service: {}", client.proxy_service_sid());

    let state = AppState {
        client: Arc::new(client),
    };

    server::serve(&config.server, state).await?;

    Ok(())
}
