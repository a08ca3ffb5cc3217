use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::user::AllowedUser;

#[derive(Debug, Clone)]
pub struct AllowlistRepository {
    pool: SqlitePool,
}

impl AllowlistRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn add(&self, chat_id: i64, note: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO allowed_users(chat_id, note, created_at)
            VALUES(?, ?, ?)
            ON CONFLICT(chat_id) DO UPDATE SET note = excluded.note
            "#,
        )
        .bind(chat_id)
        .bind(note)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .context("Failed to add allowed user")?;
        Ok(())
    }

    pub async fn remove(&self, chat_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM allowed_users WHERE chat_id = ?")
            .bind(chat_id)
            .execute(&self.pool)
            .await
            .context("Failed to remove allowed user")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn is_allowed(&self, chat_id: i64) -> Result<bool> {
        let row: Option<i64> = sqlx::query_scalar("SELECT 1 FROM allowed_users WHERE chat_id = ?")
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to check allowlist")?;
        Ok(row.is_some())
    }

    pub async fn get(&self, chat_id: i64) -> Result<Option<AllowedUser>> {
        sqlx::query_as::<_, AllowedUser>("SELECT * FROM allowed_users WHERE chat_id = ?")
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch allowed user")
    }

    pub async fn list(&self) -> Result<Vec<AllowedUser>> {
        sqlx::query_as::<_, AllowedUser>("SELECT * FROM allowed_users ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list allowed users")
    }

    /// Replaces the user's profile restrictions. An empty list means access
    /// to every active profile.
    pub async fn set_profile_access(&self, chat_id: i64, profile_ids: &[i64]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM user_profile_access WHERE chat_id = ?")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;

        for profile_id in profile_ids {
            sqlx::query("INSERT INTO user_profile_access(chat_id, profile_id) VALUES(?, ?)")
                .bind(chat_id)
                .bind(profile_id)
                .execute(&mut *tx)
                .await
                .context("Failed to grant profile access")?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Empty result means the user is unrestricted.
    pub async fn allowed_profile_ids(&self, chat_id: i64) -> Result<Vec<i64>> {
        sqlx::query_scalar("SELECT profile_id FROM user_profile_access WHERE chat_id = ?")
            .bind(chat_id)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch profile access")
    }
}
