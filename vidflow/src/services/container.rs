//! Service container for dependency injection.
//!
//! Holds every long-lived component and owns their startup and shutdown
//! order: the recovery sweep runs before any worker dequeues, and workers
//! drain before live relays are stopped.

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::info;

use crate::config::AppConfig;
use crate::database::repositories::{
    AssetRepository, JobRepository, SqlxAssetRepository, SqlxJobRepository,
    SqlxStreamRepository, StreamRepository,
};
use crate::jobs::{JobStore, JobSubmitter};
use crate::media::{BlobStore, FfmpegEngine, FfprobeProber, FsBlobStore, MediaEngine, Prober};
use crate::queue::JobQueue;
use crate::recovery::{RecoveryReport, RecoverySweep};
use crate::store::{MemoryStore, TransientStore};
use crate::stream::StreamSupervisor;
use crate::worker::{JobExecutor, WorkerPool};
use crate::Result;

/// External collaborators that tests replace with scripted fakes.
pub struct Collaborators {
    pub engine: Arc<dyn MediaEngine>,
    pub prober: Arc<dyn Prober>,
    pub blobs: Arc<dyn BlobStore>,
    pub transient: Arc<dyn TransientStore>,
}

impl Collaborators {
    /// ffmpeg/ffprobe subprocesses, a filesystem blob root and an in-process
    /// transient store.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            engine: Arc::new(FfmpegEngine::new(config.media.clone())),
            prober: Arc::new(FfprobeProber::new(config.media.ffprobe_path.clone())),
            blobs: Arc::new(FsBlobStore::new(config.blob_root.clone())),
            transient: Arc::new(MemoryStore::new()),
        }
    }
}

/// Service container holding all application services.
pub struct ServiceContainer {
    pub pool: SqlitePool,
    pub transient: Arc<dyn TransientStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub job_repo: Arc<dyn JobRepository>,
    pub stream_repo: Arc<dyn StreamRepository>,
    pub asset_repo: Arc<dyn AssetRepository>,
    pub jobs: Arc<JobStore>,
    pub queue: Arc<JobQueue>,
    pub supervisor: Arc<StreamSupervisor>,
    pub executor: Arc<JobExecutor>,
    pub workers: WorkerPool,
}

impl ServiceContainer {
    /// Wire the production collaborators.
    pub fn build(config: &AppConfig, pool: SqlitePool) -> Self {
        Self::with_collaborators(config, pool, Collaborators::from_config(config))
    }

    pub fn with_collaborators(
        config: &AppConfig,
        pool: SqlitePool,
        collaborators: Collaborators,
    ) -> Self {
        info!("Initializing service container");
        let Collaborators {
            engine,
            prober,
            blobs,
            transient,
        } = collaborators;

        let job_repo: Arc<dyn JobRepository> = Arc::new(SqlxJobRepository::new(pool.clone()));
        let stream_repo: Arc<dyn StreamRepository> =
            Arc::new(SqlxStreamRepository::new(pool.clone()));
        let asset_repo: Arc<dyn AssetRepository> =
            Arc::new(SqlxAssetRepository::new(pool.clone()));

        let jobs = Arc::new(JobStore::new(transient.clone(), job_repo.clone()));
        let queue = Arc::new(JobQueue::with_config(
            transient.clone(),
            config.queue.clone(),
        ));
        let supervisor = Arc::new(StreamSupervisor::new(
            config.supervisor.clone(),
            engine.clone(),
            prober.clone(),
            transient.clone(),
            stream_repo.clone(),
        ));
        let executor = Arc::new(JobExecutor::new(
            config.executor.clone(),
            jobs.clone(),
            blobs.clone(),
            prober,
            engine,
            asset_repo.clone(),
            supervisor.clone(),
        ));
        let workers = WorkerPool::new(config.workers.clone());

        Self {
            pool,
            transient,
            blobs,
            job_repo,
            stream_repo,
            asset_repo,
            jobs,
            queue,
            supervisor,
            executor,
            workers,
        }
    }

    /// Reconcile the durable store, then start consuming the queue.
    pub async fn start(&self) -> Result<RecoveryReport> {
        let report = RecoverySweep {
            jobs: &self.jobs,
            queue: &self.queue,
            job_repo: self.job_repo.as_ref(),
            stream_repo: self.stream_repo.as_ref(),
            transient: self.transient.as_ref(),
        }
        .run()
        .await?;

        self.workers.start(self.queue.clone(), self.executor.clone());
        info!("Services started");
        Ok(report)
    }

    pub fn submitter(&self) -> JobSubmitter {
        JobSubmitter::new(self.jobs.clone(), self.queue.clone())
    }

    /// Drain the workers, then stop every live relay.
    pub async fn shutdown(&self) {
        info!("Shutting down services");
        self.workers.stop().await;
        self.supervisor.shutdown().await;
        info!("Services shut down");
    }
}
