//! Job record and its state machine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Kind-dependent result payload of a completed job.
pub type JobOutputs = serde_json::Map<String, serde_json::Value>;

/// Step label written when a merge job is submitted with fewer than two assets.
pub const STEP_NOT_ENOUGH_FILES: &str = "not enough files";

/// Job kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    /// Probe an asset and report its technical metadata.
    Analyze,
    /// Re-encode an asset to the target resolution, frame rate and loudness.
    Normalize,
    /// Crossfade two assets into one.
    Merge,
    /// Start a live relay for a source address.
    Livestream,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Analyze => "ANALYZE",
            Self::Normalize => "NORMALIZE",
            Self::Merge => "MERGE",
            Self::Livestream => "LIVESTREAM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ANALYZE" => Some(Self::Analyze),
            "NORMALIZE" => Some(Self::Normalize),
            "MERGE" => Some(Self::Merge),
            "LIVESTREAM" => Some(Self::Livestream),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Waiting in the queue.
    Queued,
    /// Held by exactly one worker.
    Processing,
    /// Finished with outputs.
    Completed,
    /// Finished with an error.
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "PROCESSING" => Some(Self::Processing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Check if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Validate a state transition.
    ///
    /// Queued may fail directly (a record that cannot even be started);
    /// nothing leaves a terminal state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            (Queued, Processing) | (Queued, Failed) | (Processing, Completed) | (Processing, Failed)
        )
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: JobState) -> Result<JobState> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The unit of work state shared by both stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub job_kind: JobKind,
    pub asset_refs: Vec<String>,
    pub state: JobState,
    pub step: Option<String>,
    pub progress: u8,
    pub outputs: JobOutputs,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a queued job with a fresh id.
    pub fn new(job_kind: JobKind, asset_refs: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            job_kind,
            asset_refs,
            state: JobState::Queued,
            step: None,
            progress: 0,
            outputs: JobOutputs::new(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Queued -> Processing.
    pub fn start_processing(&mut self) -> Result<()> {
        self.state = self.state.transition_to(JobState::Processing)?;
        self.touch();
        Ok(())
    }

    /// Record a milestone while processing.
    ///
    /// Progress never moves backwards: a lower value keeps the current one.
    pub fn advance(&mut self, step: impl Into<String>, progress: u8) -> Result<()> {
        if self.state != JobState::Processing {
            return Err(Error::InvalidStateTransition {
                from: self.state.as_str().to_string(),
                to: JobState::Processing.as_str().to_string(),
            });
        }
        self.step = Some(step.into());
        self.progress = self.progress.max(progress.min(100));
        self.touch();
        Ok(())
    }

    /// Processing -> Completed with the final outputs.
    pub fn complete(&mut self, outputs: JobOutputs) -> Result<()> {
        self.state = self.state.transition_to(JobState::Completed)?;
        self.outputs = outputs;
        self.error = None;
        self.step = None;
        self.progress = 100;
        self.touch();
        Ok(())
    }

    /// Queued/Processing -> Failed.
    ///
    /// `step` overrides the current step label when the failure has a
    /// well-known name (for example [`STEP_NOT_ENOUGH_FILES`]).
    pub fn fail(&mut self, error: impl Into<String>, step: Option<&str>) -> Result<()> {
        self.state = self.state.transition_to(JobState::Failed)?;
        self.error = Some(error.into());
        self.outputs = JobOutputs::new();
        if let Some(step) = step {
            self.step = Some(step.to_string());
        }
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Flatten into the transient-store hash layout.
    pub fn to_hash(&self) -> Result<Vec<(String, String)>> {
        Ok(vec![
            ("job_id".into(), self.job_id.clone()),
            ("job_type".into(), self.job_kind.as_str().into()),
            ("asset_ids".into(), serde_json::to_string(&self.asset_refs)?),
            ("status".into(), self.state.as_str().into()),
            ("step".into(), self.step.clone().unwrap_or_default()),
            ("progress".into(), self.progress.to_string()),
            ("outputs".into(), serde_json::to_string(&self.outputs)?),
            ("error".into(), self.error.clone().unwrap_or_default()),
            ("created_at".into(), self.created_at.to_rfc3339()),
            ("updated_at".into(), self.updated_at.to_rfc3339()),
        ])
    }

    /// Rebuild a record from its transient-store hash.
    pub fn from_hash(fields: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| Error::Other(format!("job hash is missing field '{name}'")))
        };

        let job_type = get("job_type")?;
        let job_kind = JobKind::parse(job_type)
            .ok_or_else(|| Error::Other(format!("unknown job type '{job_type}'")))?;
        let status = get("status")?;
        let state = JobState::parse(status)
            .ok_or_else(|| Error::Other(format!("unknown job status '{status}'")))?;
        let progress = get("progress")?
            .parse::<u8>()
            .map_err(|e| Error::Other(format!("invalid progress: {e}")))?;

        Ok(Self {
            job_id: get("job_id")?.clone(),
            job_kind,
            asset_refs: serde_json::from_str(get("asset_ids")?)?,
            state,
            step: non_empty(fields.get("step")),
            progress,
            outputs: serde_json::from_str(get("outputs")?)?,
            error: non_empty(fields.get("error")),
            created_at: parse_time(fields.get("created_at"))?,
            updated_at: parse_time(fields.get("updated_at"))?,
        })
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}

pub(crate) fn parse_time(value: Option<&String>) -> Result<DateTime<Utc>> {
    match value {
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| Error::Other(format!("invalid timestamp '{raw}': {e}"))),
        None => Ok(Utc::now()),
    }
}
