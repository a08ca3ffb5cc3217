use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A registered 3x-ui panel. The password is stored encrypted; only the
/// allocation path ever decrypts it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Panel {
    pub id: i64,
    pub name: String,
    pub base_url: String,
    pub username: String,
    pub password_enc: String,
    pub active: bool,
    pub created_at: i64,
}
