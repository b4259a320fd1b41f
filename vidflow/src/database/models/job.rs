//! Job database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::{JobKind, JobRecord, JobState};
use crate::domain::job::parse_time;
use crate::{Error, Result};

/// Job database model.
/// Durable copy of a [`JobRecord`].
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobDbModel {
    pub id: String,
    /// Job type: ANALYZE, NORMALIZE, MERGE, LIVESTREAM
    pub job_type: String,
    /// JSON array of asset references
    pub asset_ids: String,
    /// Status: QUEUED, PROCESSING, COMPLETED, FAILED
    pub status: String,
    pub step: Option<String>,
    pub progress: i64,
    /// JSON object with kind-dependent outputs
    pub outputs: String,
    pub error: Option<String>,
    /// ISO 8601 timestamp when the job was created
    pub created_at: String,
    /// ISO 8601 timestamp when the job was last updated
    pub updated_at: String,
}

impl JobDbModel {
    pub fn from_record(record: &JobRecord) -> Result<Self> {
        Ok(Self {
            id: record.job_id.clone(),
            job_type: record.job_kind.as_str().to_string(),
            asset_ids: serde_json::to_string(&record.asset_refs)?,
            status: record.state.as_str().to_string(),
            step: record.step.clone(),
            progress: i64::from(record.progress),
            outputs: serde_json::to_string(&record.outputs)?,
            error: record.error.clone(),
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
        })
    }

    pub fn into_record(self) -> Result<JobRecord> {
        let job_kind = JobKind::parse(&self.job_type)
            .ok_or_else(|| Error::Database(format!("unknown job type '{}'", self.job_type)))?;
        let state = JobState::parse(&self.status)
            .ok_or_else(|| Error::Database(format!("unknown job status '{}'", self.status)))?;

        Ok(JobRecord {
            job_id: self.id,
            job_kind,
            asset_refs: serde_json::from_str(&self.asset_ids)?,
            state,
            step: self.step,
            progress: self.progress.clamp(0, 100) as u8,
            outputs: serde_json::from_str(&self.outputs)?,
            error: self.error,
            created_at: parse_time(Some(&self.created_at))?,
            updated_at: parse_time(Some(&self.updated_at))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_model_from_record() {
        let record = JobRecord::new(JobKind::Merge, vec!["raw/a.mp4".into(), "raw/b.mp4".into()]);
        let model = JobDbModel::from_record(&record).unwrap();
        assert_eq!(model.status, "QUEUED");
        assert_eq!(model.job_type, "MERGE");
        assert_eq!(model.outputs, "{}");

        let back = model.into_record().unwrap();
        assert_eq!(back.asset_refs.len(), 2);
        assert_eq!(back.state, JobState::Queued);
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let record = JobRecord::new(JobKind::Analyze, vec!["raw/a.mp4".into()]);
        let mut model = JobDbModel::from_record(&record).unwrap();
        model.status = "PAUSED".into();
        assert!(model.into_record().is_err());
    }
}
