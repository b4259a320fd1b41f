//! Asset repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::AssetDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::{Error, Result};

#[async_trait]
pub trait AssetRepository: Send + Sync {
    async fn get_asset_by_key(&self, blob_key: &str) -> Result<AssetDbModel>;
    async fn list_assets_for_job(&self, job_id: &str) -> Result<Vec<AssetDbModel>>;
    /// Record a blob. Registering the same key twice only refreshes `updated_at`.
    async fn register_asset(&self, asset: &AssetDbModel) -> Result<()>;
}

pub struct SqlxAssetRepository {
    pool: SqlitePool,
}

impl SqlxAssetRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AssetRepository for SqlxAssetRepository {
    async fn get_asset_by_key(&self, blob_key: &str) -> Result<AssetDbModel> {
        sqlx::query_as::<_, AssetDbModel>("SELECT * FROM asset WHERE blob_key = ?")
            .bind(blob_key)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Asset", blob_key))
    }

    async fn list_assets_for_job(&self, job_id: &str) -> Result<Vec<AssetDbModel>> {
        let assets = sqlx::query_as::<_, AssetDbModel>(
            "SELECT * FROM asset WHERE source_job_id = ? ORDER BY created_at",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(assets)
    }

    async fn register_asset(&self, asset: &AssetDbModel) -> Result<()> {
        retry_on_sqlite_busy("register_asset", || async {
            sqlx::query(
                r#"
                INSERT INTO asset (id, blob_key, kind, source_job_id, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(blob_key) DO UPDATE SET updated_at = excluded.updated_at
                "#,
            )
            .bind(&asset.id)
            .bind(&asset.blob_key)
            .bind(&asset.kind)
            .bind(&asset.source_job_id)
            .bind(&asset.created_at)
            .bind(&asset.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }
}
