use std::time::Duration;

use dotenvy::dotenv;
use teloxide::prelude::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod bot;
mod config;
mod services;
mod state;
mod xui;

use crate::config::AppConfig;
use crate::services::allocator_service::AllocatorService;
use crate::services::crypto_service::CryptoService;
use crate::state::AppState;
use crate::xui::XuiConnector;

use bodega_db::repositories::allowlist_repo::AllowlistRepository;
use bodega_db::repositories::panel_repo::PanelRepository;
use bodega_db::repositories::profile_repo::ProfileRepository;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting bodega bot...");

    let config = AppConfig::from_env()?;
    let pool = bodega_db::connect(&config.database_url).await?;

    let allowlist = AllowlistRepository::new(pool.clone());
    // The admin is always allowed.
    allowlist.add(config.admin_chat_id, "admin").await?;

    let crypto = CryptoService::new(&config.app_secret);
    let connector =
        XuiConnector::new(config.xui_verify_tls, Duration::from_secs(config.request_timeout));
    let allocator = AllocatorService::new(pool.clone(), crypto.clone(), connector);

    let state = AppState {
        panels: PanelRepository::new(pool.clone()),
        profiles: ProfileRepository::new(pool.clone()),
        allowlist,
        crypto,
        allocator,
        pool,
        admin_chat_id: config.admin_chat_id,
    };

    let bot = Bot::new(&config.bot_token);
    let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    bot::run_bot(bot, shutdown_rx, state).await;

    Ok(())
}
