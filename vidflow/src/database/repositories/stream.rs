//! Stream repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::StreamDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::{Error, Result};

/// Stream repository trait.
#[async_trait]
pub trait StreamRepository: Send + Sync {
    async fn get_stream(&self, id: &str) -> Result<StreamDbModel>;
    async fn list_streams_by_status(&self, status: &str) -> Result<Vec<StreamDbModel>>;
    /// Insert a stream, or refresh every mutable field of an existing one.
    ///
    /// A caller-supplied id may be reused after the previous relay ended, so
    /// the insert doubles as a restart of the history row.
    async fn upsert_stream(&self, stream: &StreamDbModel) -> Result<()>;
    async fn update_stream_status(
        &self,
        id: &str,
        status: &str,
        reconnect_attempt: i64,
        error: Option<&str>,
    ) -> Result<()>;
    /// Mark LIVE/RECONNECTING streams as FAILED. Returns the number of rows touched.
    async fn fail_active_streams(&self, error: &str) -> Result<u64>;
}

/// SQLx implementation of StreamRepository.
pub struct SqlxStreamRepository {
    pool: SqlitePool,
}

impl SqlxStreamRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StreamRepository for SqlxStreamRepository {
    async fn get_stream(&self, id: &str) -> Result<StreamDbModel> {
        sqlx::query_as::<_, StreamDbModel>("SELECT * FROM stream WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Stream", id))
    }

    async fn list_streams_by_status(&self, status: &str) -> Result<Vec<StreamDbModel>> {
        let streams = sqlx::query_as::<_, StreamDbModel>(
            "SELECT * FROM stream WHERE status = ? ORDER BY started_at",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(streams)
    }

    async fn upsert_stream(&self, stream: &StreamDbModel) -> Result<()> {
        retry_on_sqlite_busy("upsert_stream", || async {
            sqlx::query(
                r#"
                INSERT INTO stream (id, source_url, relay_url, preview_url, has_audio, status,
                                    reconnect_attempt, error, started_at, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    source_url = excluded.source_url,
                    relay_url = excluded.relay_url,
                    preview_url = excluded.preview_url,
                    has_audio = excluded.has_audio,
                    status = excluded.status,
                    reconnect_attempt = excluded.reconnect_attempt,
                    error = excluded.error,
                    started_at = excluded.started_at,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&stream.id)
            .bind(&stream.source_url)
            .bind(&stream.relay_url)
            .bind(&stream.preview_url)
            .bind(stream.has_audio)
            .bind(&stream.status)
            .bind(stream.reconnect_attempt)
            .bind(&stream.error)
            .bind(&stream.started_at)
            .bind(&stream.created_at)
            .bind(&stream.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn update_stream_status(
        &self,
        id: &str,
        status: &str,
        reconnect_attempt: i64,
        error: Option<&str>,
    ) -> Result<()> {
        retry_on_sqlite_busy("update_stream_status", || async {
            let now = chrono::Utc::now().to_rfc3339();
            sqlx::query(
                "UPDATE stream SET status = ?, reconnect_attempt = ?, error = ?, updated_at = ? WHERE id = ?",
            )
            .bind(status)
            .bind(reconnect_attempt)
            .bind(error)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn fail_active_streams(&self, error: &str) -> Result<u64> {
        let now = chrono::Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE stream SET status = 'FAILED', error = ?, updated_at = ? WHERE status IN ('LIVE', 'RECONNECTING')",
        )
        .bind(error)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
