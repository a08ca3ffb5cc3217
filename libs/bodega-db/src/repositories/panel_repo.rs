use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::panel::Panel;

#[derive(Debug, Clone)]
pub struct PanelRepository {
    pool: SqlitePool,
}

impl PanelRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Registering an existing name replaces its credentials and re-activates
    /// the panel.
    pub async fn upsert(
        &self,
        name: &str,
        base_url: &str,
        username: &str,
        password_enc: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO panels(name, base_url, username, password_enc, active, created_at)
            VALUES(?, ?, ?, ?, 1, ?)
            ON CONFLICT(name) DO UPDATE SET
              base_url = excluded.base_url,
              username = excluded.username,
              password_enc = excluded.password_enc,
              active = 1
            "#,
        )
        .bind(name)
        .bind(base_url)
        .bind(username)
        .bind(password_enc)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to register panel")?;
        Ok(())
    }

    pub async fn get_by_id(&self, panel_id: i64) -> Result<Option<Panel>> {
        sqlx::query_as::<_, Panel>("SELECT * FROM panels WHERE id = ?")
            .bind(panel_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch panel by id")
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Panel>> {
        sqlx::query_as::<_, Panel>("SELECT * FROM panels WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch panel by name")
    }

    pub async fn list(&self, active_only: bool) -> Result<Vec<Panel>> {
        let sql = if active_only {
            "SELECT * FROM panels WHERE active = 1 ORDER BY id ASC"
        } else {
            "SELECT * FROM panels ORDER BY id ASC"
        };
        sqlx::query_as::<_, Panel>(sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list panels")
    }

    pub async fn set_active(&self, panel_id: i64, active: bool) -> Result<()> {
        sqlx::query("UPDATE panels SET active = ? WHERE id = ?")
            .bind(active)
            .bind(panel_id)
            .execute(&self.pool)
            .await
            .context("Failed to update panel state")?;
        Ok(())
    }
}
