pub mod client;
pub mod models;

pub use client::{XuiClient, XuiConnector};

use async_trait::async_trait;
use thiserror::Error;

use bodega_db::models::panel::Panel;

use crate::xui::models::{ClientPayload, Inbound, PanelSettings};

#[derive(Debug, Error)]
pub enum XuiError {
    #[error("panel URL is invalid: {0}")]
    BadUrl(String),
    #[error("panel login failed: {0}")]
    Login(String),
    #[error("panel API {path} failed with status {status}")]
    Status { path: String, status: u16 },
    #[error("panel rejected request: {0}")]
    Api(String),
    #[error("panel returned malformed response: {0}")]
    InvalidResponse(String),
    #[error("subscription fetch failed: {0}")]
    Subscription(String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// The RPC surface the allocator consumes. The panel is a black box behind
/// these four operations; tests script them in memory.
#[async_trait]
pub trait PanelApi: Send + Sync {
    async fn list_inbounds(&self) -> Result<Vec<Inbound>, XuiError>;

    /// One call per inbound, carrying the whole batch for that inbound.
    async fn add_clients(
        &self,
        inbound_id: i64,
        clients: &[ClientPayload],
    ) -> Result<(), XuiError>;

    async fn get_settings(&self) -> Result<PanelSettings, XuiError>;

    async fn fetch_subscription(
        &self,
        settings: &PanelSettings,
        sub_id: &str,
    ) -> Result<String, XuiError>;
}

/// Builds a logged-in [`PanelApi`] from a stored panel and its decrypted
/// password. A fresh session is opened per allocation attempt.
#[async_trait]
pub trait PanelConnector: Send + Sync {
    type Api: PanelApi;

    async fn connect(&self, panel: &Panel, password: &str) -> Result<Self::Api, XuiError>;
}
