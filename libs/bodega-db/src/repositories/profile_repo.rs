use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::profile::{Profile, ProfilePort};

#[derive(Debug, Clone)]
pub struct ProfileRepository {
    pool: SqlitePool,
}

impl ProfileRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates the profile, its port bindings (in the given order) and the
    /// name-counter row in one transaction.
    pub async fn create(
        &self,
        panel_id: i64,
        name: &str,
        prefix: &str,
        suffix: &str,
        traffic_gb: i64,
        expiry_days: i64,
        ports: &[(i64, i64, i64)],
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO profiles(panel_id, name, prefix, suffix, traffic_gb, expiry_days, active, created_at)
            VALUES(?, ?, ?, ?, ?, ?, 1, ?)
            "#,
        )
        .bind(panel_id)
        .bind(name)
        .bind(prefix)
        .bind(suffix)
        .bind(traffic_gb)
        .bind(expiry_days)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .context("Failed to create profile")?;
        let profile_id = result.last_insert_rowid();

        for (sort_order, (inbound_id, port, max_active)) in ports.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO profile_ports(profile_id, inbound_id, port, max_active_clients, sort_order)
                VALUES(?, ?, ?, ?, ?)
                "#,
            )
            .bind(profile_id)
            .bind(inbound_id)
            .bind(port)
            .bind(max_active)
            .bind(sort_order as i64)
            .execute(&mut *tx)
            .await
            .context("Failed to add profile port")?;
        }

        sqlx::query("INSERT OR IGNORE INTO profile_counters(profile_id, last_number) VALUES(?, 0)")
            .bind(profile_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(profile_id)
    }

    pub async fn get_by_id(&self, profile_id: i64) -> Result<Option<Profile>> {
        sqlx::query_as::<_, Profile>("SELECT * FROM profiles WHERE id = ?")
            .bind(profile_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch profile by id")
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Profile>> {
        sqlx::query_as::<_, Profile>("SELECT * FROM profiles WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch profile by name")
    }

    pub async fn list(&self, active_only: bool) -> Result<Vec<Profile>> {
        let sql = if active_only {
            "SELECT * FROM profiles WHERE active = 1 ORDER BY id ASC"
        } else {
            "SELECT * FROM profiles ORDER BY id ASC"
        };
        sqlx::query_as::<_, Profile>(sql)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list profiles")
    }

    pub async fn set_active(&self, profile_id: i64, active: bool) -> Result<()> {
        sqlx::query("UPDATE profiles SET active = ? WHERE id = ?")
            .bind(active)
            .bind(profile_id)
            .execute(&self.pool)
            .await
            .context("Failed to update profile state")?;
        Ok(())
    }

    pub async fn list_ports(&self, profile_id: i64) -> Result<Vec<ProfilePort>> {
        sqlx::query_as::<_, ProfilePort>(
            "SELECT * FROM profile_ports WHERE profile_id = ? ORDER BY sort_order ASC, id ASC",
        )
        .bind(profile_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list profile ports")
    }

    pub async fn add_port(
        &self,
        profile_id: i64,
        inbound_id: i64,
        port: i64,
        max_active_clients: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let next_sort: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM profile_ports WHERE profile_id = ?",
        )
        .bind(profile_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO profile_ports(profile_id, inbound_id, port, max_active_clients, sort_order)
            VALUES(?, ?, ?, ?, ?)
            "#,
        )
        .bind(profile_id)
        .bind(inbound_id)
        .bind(port)
        .bind(max_active_clients)
        .bind(next_sort)
        .execute(&mut *tx)
        .await
        .context("Failed to add profile port")?;

        tx.commit().await?;
        Ok(())
    }

    /// Returns false when the profile has no binding for that port.
    pub async fn update_port_capacity(
        &self,
        profile_id: i64,
        port: i64,
        max_active_clients: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE profile_ports SET max_active_clients = ? WHERE profile_id = ? AND port = ?",
        )
        .bind(max_active_clients)
        .bind(profile_id)
        .bind(port)
        .execute(&self.pool)
        .await
        .context("Failed to update port capacity")?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::panel_repo::PanelRepository;

    async fn setup() -> (SqlitePool, ProfileRepository, i64) {
        let pool = crate::connect("sqlite::memory:").await.unwrap();
        let panels = PanelRepository::new(pool.clone());
        panels
            .upsert("main", "https://panel.example.com", "admin", "enc")
            .await
            .unwrap();
        let panel = panels.get_by_name("main").await.unwrap().unwrap();
        (pool.clone(), ProfileRepository::new(pool), panel.id)
    }

    #[tokio::test]
    async fn create_seeds_ports_and_counter() {
        let (pool, repo, panel_id) = setup().await;

        let profile_id = repo
            .create(panel_id, "10h", "10h", "", 30, 10, &[(5, 1044, 1000), (6, 1025, 500)])
            .await
            .unwrap();

        let ports = repo.list_ports(profile_id).await.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].port, 1044);
        assert_eq!(ports[0].sort_order, 0);
        assert_eq!(ports[1].port, 1025);
        assert_eq!(ports[1].max_active_clients, 500);

        let last_number: i64 =
            sqlx::query_scalar("SELECT last_number FROM profile_counters WHERE profile_id = ?")
                .bind(profile_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(last_number, 0);
    }

    #[tokio::test]
    async fn duplicate_port_is_rejected() {
        let (_pool, repo, panel_id) = setup().await;
        let profile_id = repo
            .create(panel_id, "10h", "10h", "", 30, 10, &[(5, 1044, 1000)])
            .await
            .unwrap();

        assert!(repo.add_port(profile_id, 7, 1044, 100).await.is_err());
    }

    #[tokio::test]
    async fn added_port_goes_to_the_end() {
        let (_pool, repo, panel_id) = setup().await;
        let profile_id = repo
            .create(panel_id, "10h", "10h", "", 30, 10, &[(5, 1044, 1000)])
            .await
            .unwrap();

        repo.add_port(profile_id, 9, 51045, 100).await.unwrap();

        let ports = repo.list_ports(profile_id).await.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[1].port, 51045);
        assert_eq!(ports[1].sort_order, 1);
    }

    #[tokio::test]
    async fn update_port_capacity_reports_missing_binding() {
        let (_pool, repo, panel_id) = setup().await;
        let profile_id = repo
            .create(panel_id, "10h", "10h", "", 30, 10, &[(5, 1044, 1000)])
            .await
            .unwrap();

        assert!(repo.update_port_capacity(profile_id, 1044, 2000).await.unwrap());
        assert!(!repo.update_port_capacity(profile_id, 9999, 10).await.unwrap());

        let ports = repo.list_ports(profile_id).await.unwrap();
        assert_eq!(ports[0].max_active_clients, 2000);
    }
}
