//! Persisted resume offsets for long-form media

use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::{Pool, Sqlite, sqlite::SqlitePoolOptions};

/// Where resume offsets are kept
#[async_trait]
pub trait ResumeStore: Send + Sync {
    async fn load_offset(&self, media_id: &str) -> Result<Option<Duration>>;
    async fn save_offset(&self, media_id: &str, offset: Duration) -> Result<()>;
    async fn clear_offset(&self, media_id: &str) -> Result<()>;
}

fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// SQLite-backed store
#[derive(Debug, Clone)]
pub struct SqliteResumeStore {
    pool: Pool<Sqlite>,
}

impl SqliteResumeStore {
    /// Open (creating if needed) the database at `db_path`
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&db_url)
            .await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;

        run_migrations(&pool).await?;
        tracing::info!("Resume offsets stored in {}", db_path.display());
        Ok(Self { pool })
    }

    /// Private in-memory database
    pub async fn in_memory() -> Result<Self> {
        // one connection, or each would see its own empty database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }
}

async fn run_migrations(pool: &Pool<Sqlite>) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS resume_offsets (
            media_id TEXT PRIMARY KEY NOT NULL,
            offset_ms INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[async_trait]
impl ResumeStore for SqliteResumeStore {
    async fn load_offset(&self, media_id: &str) -> Result<Option<Duration>> {
        let offset =
            sqlx::query_scalar::<_, i64>("SELECT offset_ms FROM resume_offsets WHERE media_id = ?")
                .bind(media_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(offset.map(|ms| Duration::from_millis(ms.max(0) as u64)))
    }

    async fn save_offset(&self, media_id: &str, offset: Duration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO resume_offsets (media_id, offset_ms, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(media_id) DO UPDATE SET
                offset_ms = excluded.offset_ms,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(media_id)
        .bind(offset.as_millis() as i64)
        .bind(current_timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_offset(&self, media_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM resume_offsets WHERE media_id = ?")
            .bind(media_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Process-local store, used when no database is available
#[derive(Debug, Default)]
pub struct MemoryResumeStore {
    offsets: Mutex<HashMap<String, Duration>>,
}

impl MemoryResumeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, media_id: &str) -> Option<Duration> {
        self.offsets.lock().get(media_id).copied()
    }
}

#[async_trait]
impl ResumeStore for MemoryResumeStore {
    async fn load_offset(&self, media_id: &str) -> Result<Option<Duration>> {
        Ok(self.get(media_id))
    }

    async fn save_offset(&self, media_id: &str, offset: Duration) -> Result<()> {
        self.offsets.lock().insert(media_id.to_string(), offset);
        Ok(())
    }

    async fn clear_offset(&self, media_id: &str) -> Result<()> {
        self.offsets.lock().remove(media_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sqlite_round_trip_and_clear() {
        let store = SqliteResumeStore::in_memory().await.unwrap();
        assert_eq!(store.load_offset("book").await.unwrap(), None);

        store
            .save_offset("book", Duration::from_millis(61_500))
            .await
            .unwrap();
        store
            .save_offset("book", Duration::from_millis(90_000))
            .await
            .unwrap();
        assert_eq!(
            store.load_offset("book").await.unwrap(),
            Some(Duration::from_secs(90))
        );

        store.clear_offset("book").await.unwrap();
        assert_eq!(store.load_offset("book").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sqlite_file_is_created() {
        let dir = std::env::temp_dir().join(format!("nocturne-resume-{}", std::process::id()));
        let path = dir.join("resume.db");
        let store = SqliteResumeStore::open(&path).await.unwrap();
        store.save_offset("ep", Duration::from_secs(12)).await.unwrap();
        assert!(path.exists());
        drop(store);
        let _ = std::fs::remove_dir_all(dir);
    }
}
