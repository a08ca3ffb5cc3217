use anyhow::{Context, Result};
use sqlx::{Executor, Sqlite, SqlitePool};

use crate::models::issued::IssuedConfig;

/// Issuance rows are written inside the allocator's transaction, so the write
/// helpers take an executor instead of holding a pool.
pub struct IssuedConfigRepository;

impl IssuedConfigRepository {
    pub async fn exists_config_name<'e, E>(executor: E, config_name: &str) -> Result<bool>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let row: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM issued_configs WHERE config_name = ? LIMIT 1")
                .bind(config_name)
                .fetch_optional(executor)
                .await
                .context("Failed to check config name")?;
        Ok(row.is_some())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn insert<'e, E>(
        executor: E,
        profile_id: i64,
        panel_id: i64,
        inbound_id: i64,
        chat_id: i64,
        config_name: &str,
        sub_id: &str,
        created_at: i64,
    ) -> Result<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO issued_configs(
                profile_id, panel_id, inbound_id, chat_id, config_name, sub_id, created_at
            ) VALUES(?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(profile_id)
        .bind(panel_id)
        .bind(inbound_id)
        .bind(chat_id)
        .bind(config_name)
        .bind(sub_id)
        .bind(created_at)
        .execute(executor)
        .await
        .context("Failed to record issued config")?;
        Ok(())
    }

    pub async fn count_for_profile(pool: &SqlitePool, profile_id: i64) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM issued_configs WHERE profile_id = ?")
            .bind(profile_id)
            .fetch_one(pool)
            .await
            .context("Failed to count issued configs")
    }

    pub async fn list_recent(
        pool: &SqlitePool,
        profile_id: i64,
        limit: i64,
    ) -> Result<Vec<IssuedConfig>> {
        sqlx::query_as::<_, IssuedConfig>(
            "SELECT * FROM issued_configs WHERE profile_id = ? ORDER BY created_at DESC, id DESC LIMIT ?",
        )
        .bind(profile_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("Failed to list issued configs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::panel_repo::PanelRepository;
    use crate::repositories::profile_repo::ProfileRepository;

    async fn seeded_pool() -> (SqlitePool, i64, i64) {
        let pool = crate::connect("sqlite::memory:").await.unwrap();
        let panels = PanelRepository::new(pool.clone());
        panels
            .upsert("main", "https://panel.example.com", "admin", "enc")
            .await
            .unwrap();
        let panel = panels.get_by_name("main").await.unwrap().unwrap();
        let profiles = ProfileRepository::new(pool.clone());
        let profile_id = profiles
            .create(panel.id, "10h", "10h", "", 30, 10, &[(5, 1044, 1000)])
            .await
            .unwrap();
        (pool, panel.id, profile_id)
    }

    #[tokio::test]
    async fn insert_and_lookup() {
        let (pool, panel_id, profile_id) = seeded_pool().await;

        IssuedConfigRepository::insert(&pool, profile_id, panel_id, 5, 42, "10h1", "abcd1234efgh5678", 1_700_000_000)
            .await
            .unwrap();

        assert!(IssuedConfigRepository::exists_config_name(&pool, "10h1").await.unwrap());
        assert!(!IssuedConfigRepository::exists_config_name(&pool, "10h2").await.unwrap());
        assert_eq!(IssuedConfigRepository::count_for_profile(&pool, profile_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn config_name_is_globally_unique() {
        let (pool, panel_id, profile_id) = seeded_pool().await;

        IssuedConfigRepository::insert(&pool, profile_id, panel_id, 5, 42, "10h1", "a", 0)
            .await
            .unwrap();
        let dup = IssuedConfigRepository::insert(&pool, profile_id, panel_id, 5, 43, "10h1", "b", 0).await;
        assert!(dup.is_err());
    }
}
