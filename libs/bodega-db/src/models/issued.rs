use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Immutable record of one successfully created remote client. `config_name`
/// is unique across all profiles; it is the collision domain the name
/// allocator checks against.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct IssuedConfig {
    pub id: i64,
    pub profile_id: i64,
    pub panel_id: i64,
    pub inbound_id: i64,
    pub chat_id: i64,
    pub config_name: String,
    pub sub_id: String,
    pub created_at: i64,
}
