mod config;
mod handler;
mod otp;
mod platform;
mod usage;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Config, Secrets};
use crate::handler::CommandHandler;
use crate::otp::Totp;
use crate::platform::slack::{self, SlackClient};
use crate::usage::{Accounting, UsageStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,totpbot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Secrets first (process env, then .env): nothing else starts without them
    let secrets = Secrets::from_env()?;

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("totpbot.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Trigger: {}", config.bot.trigger);
    info!(
        "  TOTP: {} digits, {}s period",
        config.totp.digits, config.totp.period_secs
    );

    let totp = Totp::new(
        &secrets.totp_secret,
        config.totp.digits,
        config.totp.period_secs,
    )
    .context("Invalid SECRET_KEY")?;

    let accounting = if config.usage.enabled {
        let store = UsageStore::load(&config.usage.data_file);
        info!("  Usage accounting: {}", store.path().display());
        Accounting::enabled(store)
    } else {
        info!("  Usage accounting: disabled");
        Accounting::disabled()
    };

    let handler = Arc::new(CommandHandler::new(
        config.bot.trigger.clone(),
        Arc::new(totp),
        accounting,
    ));
    let client = Arc::new(SlackClient::new(
        &config.slack.api_base_url,
        &secrets.bot_token,
    ));

    info!("Bot is starting, listening for '{}'...", handler.trigger());
    slack::run(
        handler,
        client,
        secrets.app_token,
        Duration::from_secs(config.slack.reconnect_delay_secs),
    )
    .await?;

    Ok(())
}
