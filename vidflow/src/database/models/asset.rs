//! Asset database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Asset kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssetKind {
    /// Uploaded by a client.
    Raw,
    /// Output of a normalize job.
    Normalized,
    /// Output of a merge job.
    Merged,
}

impl AssetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "RAW",
            Self::Normalized => "NORMALIZED",
            Self::Merged => "MERGED",
        }
    }
}

impl std::fmt::Display for AssetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One blob known to the system.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AssetDbModel {
    pub id: String,
    pub blob_key: String,
    pub kind: String,
    /// Job that produced the blob, if any.
    pub source_job_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl AssetDbModel {
    pub fn new(blob_key: impl Into<String>, kind: AssetKind, source_job_id: Option<String>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            blob_key: blob_key.into(),
            kind: kind.as_str().to_string(),
            source_job_id,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_new() {
        let asset = AssetDbModel::new("normalized/1.mp4", AssetKind::Normalized, Some("1".into()));
        assert_eq!(asset.kind, "NORMALIZED");
        assert_eq!(asset.source_job_id.as_deref(), Some("1"));
    }
}
