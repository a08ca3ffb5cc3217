use sqlx::SqlitePool;

use bodega_db::repositories::allowlist_repo::AllowlistRepository;
use bodega_db::repositories::panel_repo::PanelRepository;
use bodega_db::repositories::profile_repo::ProfileRepository;

use crate::services::allocator_service::AllocatorService;
use crate::services::crypto_service::CryptoService;
use crate::xui::XuiConnector;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub panels: PanelRepository,
    pub profiles: ProfileRepository,
    pub allowlist: AllowlistRepository,
    pub crypto: CryptoService,
    pub allocator: AllocatorService<XuiConnector>,
    pub admin_chat_id: i64,
}
