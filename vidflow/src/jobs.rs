//! Job record access across both stores, plus the producer path.
//!
//! The transient store holds the live view that status-polling clients read;
//! the durable store receives the create, the Processing transition and the
//! terminal transition. The two are written independently.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::database::models::JobDbModel;
use crate::database::repositories::JobRepository;
use crate::domain::{JobKind, JobRecord, JobState};
use crate::queue::JobQueue;
use crate::store::{TransientStore, job_key};
use crate::Result;

const JOB_EVENT_CAPACITY: usize = 1024;

/// Snapshot published after every job write.
#[derive(Debug, Clone, PartialEq)]
pub struct JobEvent {
    pub job_id: String,
    pub state: JobState,
    pub step: Option<String>,
    pub progress: u8,
    pub error: Option<String>,
}

impl JobEvent {
    fn from_record(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id.clone(),
            state: record.state,
            step: record.step.clone(),
            progress: record.progress,
            error: record.error.clone(),
        }
    }
}

pub struct JobStore {
    transient: Arc<dyn TransientStore>,
    repo: Arc<dyn JobRepository>,
    events: broadcast::Sender<JobEvent>,
}

impl JobStore {
    pub fn new(transient: Arc<dyn TransientStore>, repo: Arc<dyn JobRepository>) -> Self {
        let (events, _) = broadcast::channel(JOB_EVENT_CAPACITY);
        Self {
            transient,
            repo,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Write a new record to both stores.
    pub async fn create(&self, record: &JobRecord) -> Result<()> {
        self.transient
            .hset(&job_key(&record.job_id), record.to_hash()?)
            .await?;
        self.repo.create_job(&JobDbModel::from_record(record)?).await?;
        self.emit(record);
        Ok(())
    }

    /// Load a record, preferring the transient view.
    pub async fn load(&self, job_id: &str) -> Result<JobRecord> {
        let fields = self.transient.hgetall(&job_key(job_id)).await?;
        if !fields.is_empty() {
            return JobRecord::from_hash(&fields);
        }
        debug!(job_id, "Job missing from transient store, reading durable copy");
        self.repo.get_job(job_id).await?.into_record()
    }

    /// Whether the transient store still holds the record.
    pub async fn is_tracked(&self, job_id: &str) -> Result<bool> {
        Ok(self.transient.hget(&job_key(job_id), "status").await?.is_some())
    }

    /// Write to the transient store only (progress milestones, re-seeding).
    pub async fn publish(&self, record: &JobRecord) -> Result<()> {
        self.transient
            .hset(&job_key(&record.job_id), record.to_hash()?)
            .await?;
        self.emit(record);
        Ok(())
    }

    /// Write to both stores (state transitions).
    pub async fn persist(&self, record: &JobRecord) -> Result<()> {
        self.transient
            .hset(&job_key(&record.job_id), record.to_hash()?)
            .await?;
        let written = self.repo.save_job(&JobDbModel::from_record(record)?).await?;
        if !written {
            debug!(
                job_id = %record.job_id,
                state = record.state.as_str(),
                "Durable job row already terminal, write skipped"
            );
        }
        self.emit(record);
        Ok(())
    }

    fn emit(&self, record: &JobRecord) {
        let _ = self.events.send(JobEvent::from_record(record));
    }
}

/// Create-job path shared by the binary, tests and any outer API layer.
pub struct JobSubmitter {
    jobs: Arc<JobStore>,
    queue: Arc<JobQueue>,
}

impl JobSubmitter {
    pub fn new(jobs: Arc<JobStore>, queue: Arc<JobQueue>) -> Self {
        Self { jobs, queue }
    }

    /// Create a queued record in both stores, then enqueue its id.
    pub async fn submit(&self, kind: JobKind, asset_refs: Vec<String>) -> Result<JobRecord> {
        let record = JobRecord::new(kind, asset_refs);
        self.jobs.create(&record).await?;
        self.queue.enqueue(&record.job_id).await?;
        info!(job_id = %record.job_id, kind = kind.as_str(), "Job submitted");
        Ok(record)
    }

    pub async fn status(&self, job_id: &str) -> Result<JobRecord> {
        self.jobs.load(job_id).await
    }
}
