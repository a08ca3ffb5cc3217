use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AllowedUser {
    pub chat_id: i64,
    pub note: String,
    pub created_at: i64,
}
