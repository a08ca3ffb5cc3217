use std::env;

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bot_token: String,
    pub admin_chat_id: i64,
    pub app_secret: String,
    pub database_url: String,
    pub xui_verify_tls: bool,
    pub request_timeout: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let bot_token = required("BOT_TOKEN")?;
        let admin_chat_id = required("ADMIN_CHAT_ID")?
            .parse::<i64>()
            .context("ADMIN_CHAT_ID must be an integer")?;
        let app_secret = required("APP_SECRET")?;

        let database_url = env::var("DATABASE_URL")
            .map(|v| v.trim().to_string())
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "sqlite://bodega.db".to_string());

        let request_timeout = env::var("REQUEST_TIMEOUT")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(30);

        Ok(Self {
            bot_token,
            admin_chat_id,
            app_secret,
            database_url,
            xui_verify_tls: env_bool("XUI_VERIFY_TLS", false),
            request_timeout,
        })
    }
}

fn required(name: &str) -> Result<String> {
    let value = env::var(name).unwrap_or_default().trim().to_string();
    if value.is_empty() {
        anyhow::bail!("{} is required", name);
    }
    Ok(value)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(value) => matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
