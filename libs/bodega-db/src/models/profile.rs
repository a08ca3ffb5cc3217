use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A sellable SKU: display-name pattern plus quota/expiry, bound to one panel
/// and one or more of its inbound ports.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Profile {
    pub id: i64,
    pub panel_id: i64,
    pub name: String,
    pub prefix: String,
    pub suffix: String,
    pub traffic_gb: i64,
    /// 0 means the issued clients never expire.
    pub expiry_days: i64,
    pub active: bool,
    pub created_at: i64,
}

/// Binding of a profile to one remote inbound, with a capacity ceiling.
/// `inbound_id` may go stale if the inbound is recreated on the panel; the
/// allocator falls back to matching by `port` in that case.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProfilePort {
    pub id: i64,
    pub profile_id: i64,
    pub inbound_id: i64,
    pub port: i64,
    pub max_active_clients: i64,
    pub sort_order: i64,
}
