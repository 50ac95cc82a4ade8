//! SQLite-backed status store using sqlx.

use {
    async_trait::async_trait,
    sqlx::{Row, SqlitePool, sqlite::SqlitePoolOptions},
};

use crate::{Result, store::StatusStore};

/// SQLite-backed status store. Shared by the listener process and the CLI.
pub struct SqliteStatusStore {
    pool: SqlitePool,
}

impl SqliteStatusStore {
    /// Create a new store with its own connection pool and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        crate::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Create a store using an existing pool (migrations must already be run).
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StatusStore for SqliteStatusStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("value")))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool> {
        let now = chrono::Utc::now().timestamp_millis();
        let result = match expected {
            Some(expected) => {
                sqlx::query(
                    "UPDATE kv SET value = ?, updated_at = ? WHERE key = ? AND value = ?",
                )
                .bind(value)
                .bind(now)
                .bind(key)
                .bind(expected)
                .execute(&self.pool)
                .await?
            },
            None => {
                sqlx::query("INSERT OR IGNORE INTO kv (key, value, updated_at) VALUES (?, ?, ?)")
                    .bind(key)
                    .bind(value)
                    .bind(now)
                    .execute(&self.pool)
                    .await?
            },
        };
        Ok(result.rows_affected() > 0)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let result = sqlx::query("INSERT OR IGNORE INTO kv_sets (key, member) VALUES (?, ?)")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv_sets WHERE key = ? AND member = ?")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT member FROM kv_sets WHERE key = ? ORDER BY member")
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("member")).collect())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqliteStatusStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::run_migrations(&pool).await.unwrap();
        SqliteStatusStore::with_pool(pool)
    }

    #[tokio::test]
    async fn compare_and_set_only_replaces_expected_value() {
        let store = memory_store().await;
        assert!(store.compare_and_set("k", None, "1").await.unwrap());
        assert!(!store.compare_and_set("k", None, "2").await.unwrap());
        assert!(!store.compare_and_set("k", Some("0"), "2").await.unwrap());
        assert!(store.compare_and_set("k", Some("1"), "2").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn two_handles_on_one_file_race_safely() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("status.db").display());
        let a = SqliteStatusStore::new(&url).await.unwrap();
        let b = SqliteStatusStore::new(&url).await.unwrap();

        assert!(a.compare_and_set("k", None, "start").await.unwrap());
        let seen = a.get("k").await.unwrap();
        assert!(b.compare_and_set("k", seen.as_deref(), "b").await.unwrap());
        assert!(!a.compare_and_set("k", seen.as_deref(), "a").await.unwrap());
        assert_eq!(a.get("k").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn set_membership() {
        let store = memory_store().await;
        assert!(store.set_add("listener:channels", "100").await.unwrap());
        assert!(!store.set_add("listener:channels", "100").await.unwrap());
        assert!(store.set_add("listener:channels", "200").await.unwrap());
        assert_eq!(
            store.set_members("listener:channels").await.unwrap(),
            ["100", "200"]
        );
        assert!(store.set_remove("listener:channels", "100").await.unwrap());
        assert!(!store.set_remove("listener:channels", "100").await.unwrap());
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("status.db").display());

        let store = SqliteStatusStore::new(&url).await.unwrap();
        assert!(store.compare_and_set("k", None, "v").await.unwrap());
        store.set_add("s", "1").await.unwrap();
        drop(store);

        let reopened = SqliteStatusStore::new(&url).await.unwrap();
        assert_eq!(reopened.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(reopened.set_members("s").await.unwrap(), ["1"]);
    }
}
