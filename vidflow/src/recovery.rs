//! Startup reconciliation of the durable store.
//!
//! Runs before any worker starts. Queued jobs whose transient state was lost
//! are re-seeded and re-enqueued. Jobs caught mid-processing cannot resume,
//! so they fail. Relays died with the previous process, so their streams fail
//! as well.

use tracing::{info, warn};

use crate::database::repositories::{JobRepository, StreamRepository};
use crate::domain::{JobState, StreamStatus};
use crate::jobs::JobStore;
use crate::queue::JobQueue;
use crate::store::{TransientStore, stream_key};
use crate::Result;

pub const INTERRUPTED_JOB_ERROR: &str = "interrupted by restart";
pub const INTERRUPTED_STREAM_ERROR: &str = "supervisor restarted";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued_jobs: usize,
    pub failed_jobs: usize,
    pub failed_streams: usize,
}

pub struct RecoverySweep<'a> {
    pub jobs: &'a JobStore,
    pub queue: &'a JobQueue,
    pub job_repo: &'a dyn JobRepository,
    pub stream_repo: &'a dyn StreamRepository,
    pub transient: &'a dyn TransientStore,
}

impl RecoverySweep<'_> {
    pub async fn run(&self) -> Result<RecoveryReport> {
        let report = RecoveryReport {
            failed_jobs: self.fail_interrupted_jobs().await?,
            requeued_jobs: self.requeue_orphaned_jobs().await?,
            failed_streams: self.fail_orphaned_streams().await?,
        };
        if report != RecoveryReport::default() {
            info!(
                requeued_jobs = report.requeued_jobs,
                failed_jobs = report.failed_jobs,
                failed_streams = report.failed_streams,
                "Recovery sweep finished"
            );
        }
        Ok(report)
    }

    async fn fail_interrupted_jobs(&self) -> Result<usize> {
        let rows = self
            .job_repo
            .list_jobs_by_status(JobState::Processing.as_str())
            .await?;
        let mut failed = 0;
        for row in rows {
            let job_id = row.id.clone();
            let mut record = match row.into_record() {
                Ok(record) => record,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Skipping unreadable job row");
                    continue;
                }
            };
            record.fail(INTERRUPTED_JOB_ERROR, None)?;
            self.jobs.persist(&record).await?;
            failed += 1;
        }
        Ok(failed)
    }

    async fn requeue_orphaned_jobs(&self) -> Result<usize> {
        let rows = self
            .job_repo
            .list_jobs_by_status(JobState::Queued.as_str())
            .await?;
        let mut requeued = 0;
        for row in rows {
            if self.jobs.is_tracked(&row.id).await? {
                continue;
            }
            let job_id = row.id.clone();
            let record = match row.into_record() {
                Ok(record) => record,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Skipping unreadable job row");
                    continue;
                }
            };
            self.jobs.publish(&record).await?;
            self.queue.enqueue(&record.job_id).await?;
            requeued += 1;
        }
        Ok(requeued)
    }

    async fn fail_orphaned_streams(&self) -> Result<usize> {
        let mut orphaned = Vec::new();
        for status in [StreamStatus::Live, StreamStatus::Reconnecting] {
            orphaned.extend(self.stream_repo.list_streams_by_status(status.as_str()).await?);
        }
        if orphaned.is_empty() {
            return Ok(0);
        }

        self.stream_repo
            .fail_active_streams(INTERRUPTED_STREAM_ERROR)
            .await?;
        let count = orphaned.len();
        for row in orphaned {
            let stream_id = row.id.clone();
            let mut info = match row.into_info() {
                Ok(info) => info,
                Err(e) => {
                    warn!(stream_id = %stream_id, error = %e, "Skipping unreadable stream row");
                    continue;
                }
            };
            info.status = StreamStatus::Failed;
            info.error = Some(INTERRUPTED_STREAM_ERROR.to_string());
            self.transient
                .hset(&stream_key(&stream_id), info.to_hash())
                .await?;
        }
        Ok(count)
    }
}
