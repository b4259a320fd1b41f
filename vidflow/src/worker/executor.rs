//! Per-job execution: one dequeued id in, one terminal record out.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::database::models::{AssetDbModel, AssetKind};
use crate::database::repositories::AssetRepository;
use crate::domain::{JobKind, JobOutputs, JobRecord, JobState, STEP_NOT_ENOUGH_FILES};
use crate::jobs::JobStore;
use crate::media::{BlobStore, MediaEngine, MediaOutcome, MediaTask, NormalizationTarget, Prober};
use crate::stream::StreamSupervisor;
use crate::utils::fs;
use crate::{Error, Result};

/// Length of the crossfade between merged clips, in seconds.
pub const MERGE_FADE_SECS: f64 = 2.0;

/// Settings for job execution.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Per-job working directories are created under here.
    pub scratch_dir: PathBuf,
    pub target: NormalizationTarget,
    pub probe_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            scratch_dir: PathBuf::from("data/scratch"),
            target: NormalizationTarget::default(),
            probe_timeout: Duration::from_secs(30),
        }
    }
}

pub fn normalized_key(job_id: &str) -> String {
    format!("normalized/{job_id}.mp4")
}

pub fn merged_key(job_id: &str) -> String {
    format!("merged/{job_id}.mp4")
}

/// A failure with an optional well-known step label.
struct JobFailure {
    error: Error,
    step: Option<&'static str>,
}

impl From<Error> for JobFailure {
    fn from(error: Error) -> Self {
        Self { error, step: None }
    }
}

/// Runs dequeued jobs against the media collaborators.
pub struct JobExecutor {
    config: ExecutorConfig,
    jobs: Arc<JobStore>,
    blobs: Arc<dyn BlobStore>,
    prober: Arc<dyn Prober>,
    engine: Arc<dyn MediaEngine>,
    assets: Arc<dyn AssetRepository>,
    streams: Arc<StreamSupervisor>,
}

impl JobExecutor {
    pub fn new(
        config: ExecutorConfig,
        jobs: Arc<JobStore>,
        blobs: Arc<dyn BlobStore>,
        prober: Arc<dyn Prober>,
        engine: Arc<dyn MediaEngine>,
        assets: Arc<dyn AssetRepository>,
        streams: Arc<StreamSupervisor>,
    ) -> Self {
        Self {
            config,
            jobs,
            blobs,
            prober,
            engine,
            assets,
            streams,
        }
    }

    /// Drive one job from Queued to a terminal state.
    ///
    /// Never returns an error: every failure ends up on the record, or in the
    /// log when even that write fails.
    pub async fn execute(&self, job_id: &str) {
        let mut record = match self.jobs.load(job_id).await {
            Ok(record) => record,
            Err(e) => {
                error!(job_id, error = %e, "Failed to load dequeued job");
                return;
            }
        };
        if record.state != JobState::Queued {
            warn!(
                job_id,
                state = record.state.as_str(),
                "Dequeued job is not queued, skipping"
            );
            return;
        }

        if let Err(e) = record.start_processing() {
            error!(job_id, error = %e, "Cannot start job");
            return;
        }
        if let Err(e) = self.jobs.persist(&record).await {
            error!(job_id, error = %e, "Failed to record job as processing");
            return;
        }
        info!(job_id, kind = record.job_kind.as_str(), "Processing job");

        let result = match Self::precheck(&record) {
            Some(failure) => Err(failure),
            None => self.run(&mut record).await.map_err(JobFailure::from),
        };

        let transition = match result {
            Ok(outputs) => record.complete(outputs),
            Err(failure) => record.fail(failure.error.to_string(), failure.step),
        };
        if let Err(e) = transition {
            error!(job_id, error = %e, "Invalid terminal transition");
            return;
        }

        if let Err(e) = self.jobs.persist(&record).await {
            error!(
                job_id,
                state = record.state.as_str(),
                error = %e,
                "Failed to record job outcome"
            );
            return;
        }
        match record.state {
            JobState::Completed => info!(job_id, "Job completed"),
            _ => warn!(
                job_id,
                step = record.step.as_deref().unwrap_or(""),
                error = record.error.as_deref().unwrap_or(""),
                "Job failed"
            ),
        }
    }

    /// Parameter checks that fail a job without touching any collaborator.
    fn precheck(record: &JobRecord) -> Option<JobFailure> {
        let assets = record.asset_refs.len();
        match record.job_kind {
            JobKind::Merge if assets < 2 => Some(JobFailure {
                error: Error::validation(format!(
                    "merge needs at least two assets, got {assets}"
                )),
                step: Some(STEP_NOT_ENOUGH_FILES),
            }),
            JobKind::Livestream if assets != 1 => Some(
                Error::validation(format!(
                    "livestream takes exactly one source address, got {assets}"
                ))
                .into(),
            ),
            JobKind::Analyze | JobKind::Normalize if assets == 0 => {
                Some(Error::validation("job has no assets").into())
            }
            _ => None,
        }
    }

    async fn run(&self, record: &mut JobRecord) -> Result<JobOutputs> {
        match record.job_kind {
            JobKind::Analyze => self.analyze(record).await,
            JobKind::Normalize => {
                let scratch = self.scratch_for(&record.job_id);
                let result = self.normalize(record, &scratch).await;
                self.cleanup_scratch(&scratch).await;
                result
            }
            JobKind::Merge => {
                let scratch = self.scratch_for(&record.job_id);
                let result = self.merge(record, &scratch).await;
                self.cleanup_scratch(&scratch).await;
                result
            }
            JobKind::Livestream => self.livestream(record).await,
        }
    }

    /// Record a milestone in the transient store.
    async fn milestone(&self, record: &mut JobRecord, step: &str, progress: u8) -> Result<()> {
        record.advance(step, progress)?;
        self.jobs.publish(record).await?;
        debug!(job_id = %record.job_id, step, progress, "Job milestone");
        Ok(())
    }

    async fn analyze(&self, record: &mut JobRecord) -> Result<JobOutputs> {
        self.milestone(record, "probing", 20).await?;
        let path = self.blobs.resolve(&record.asset_refs[0]).await?;
        let description = self
            .prober
            .probe(&path.to_string_lossy(), self.config.probe_timeout)
            .await?;
        let analysis = description.analyze(&self.config.target);

        let mut outputs = JobOutputs::new();
        outputs.insert("metadata".into(), serde_json::to_value(&description)?);
        outputs.insert("analysis".into(), serde_json::to_value(analysis)?);
        Ok(outputs)
    }

    async fn normalize(&self, record: &mut JobRecord, scratch: &Path) -> Result<JobOutputs> {
        self.milestone(record, "preparing", 20).await?;
        let input = self.blobs.resolve(&record.asset_refs[0]).await?;
        let description = self
            .prober
            .probe(&input.to_string_lossy(), self.config.probe_timeout)
            .await?;
        fs::ensure_dir_all("creating scratch directory", scratch).await?;

        self.milestone(record, "normalizing", 20).await?;
        let task = MediaTask::Normalize {
            input,
            output: scratch.join("normalized.mp4"),
            has_audio: description.has_audio(),
        };
        let artifact = self.run_task(&task).await?;

        self.milestone(record, "uploading", 70).await?;
        let key = normalized_key(&record.job_id);
        self.store_artifact(&artifact, &key, AssetKind::Normalized, &record.job_id)
            .await?;

        let mut outputs = JobOutputs::new();
        outputs.insert("normalized_key".into(), json!(key));
        Ok(outputs)
    }

    async fn merge(&self, record: &mut JobRecord, scratch: &Path) -> Result<JobOutputs> {
        self.milestone(record, "downloading", 10).await?;
        fs::ensure_dir_all("creating scratch directory", scratch).await?;
        let first = scratch.join(scratch_input_name(0, &record.asset_refs[0]));
        let second = scratch.join(scratch_input_name(1, &record.asset_refs[1]));
        self.blobs.download(&record.asset_refs[0], &first).await?;
        self.blobs.download(&record.asset_refs[1], &second).await?;

        self.milestone(record, "probing", 30).await?;
        let description = self
            .prober
            .probe(&first.to_string_lossy(), self.config.probe_timeout)
            .await?;
        let duration = description.duration_secs().ok_or_else(|| {
            Error::processing(format!("cannot determine duration of {}", record.asset_refs[0]))
        })?;
        if duration <= MERGE_FADE_SECS {
            return Err(Error::validation(format!(
                "first clip is {duration:.2}s long, it must be longer than the {MERGE_FADE_SECS}s crossfade"
            )));
        }

        self.milestone(record, "merging", 50).await?;
        let task = MediaTask::CrossfadeMerge {
            first,
            second,
            output: scratch.join("merged.mp4"),
            fade_secs: MERGE_FADE_SECS,
            offset_secs: duration - MERGE_FADE_SECS,
            has_audio: description.has_audio(),
        };
        let artifact = self.run_task(&task).await?;

        self.milestone(record, "uploading", 90).await?;
        let key = merged_key(&record.job_id);
        self.store_artifact(&artifact, &key, AssetKind::Merged, &record.job_id)
            .await?;

        let mut outputs = JobOutputs::new();
        outputs.insert("merged_key".into(), json!(key));
        Ok(outputs)
    }

    async fn livestream(&self, record: &mut JobRecord) -> Result<JobOutputs> {
        self.milestone(record, "starting_stream", 20).await?;
        let info = self
            .streams
            .start_stream(&record.asset_refs[0], None)
            .await?;

        let mut outputs = JobOutputs::new();
        outputs.insert("stream_id".into(), json!(info.stream_id));
        outputs.insert("relay_url".into(), json!(info.relay_url));
        outputs.insert("preview_url".into(), json!(info.preview_url));
        Ok(outputs)
    }

    /// Run an engine task, discarding any partial artifact on failure.
    async fn run_task(&self, task: &MediaTask) -> Result<PathBuf> {
        match self.engine.run(task).await {
            Ok(MediaOutcome::Succeeded { artifact }) => Ok(artifact),
            Ok(MediaOutcome::Failed { cause }) => {
                fs::remove_file_if_exists(task.output()).await?;
                Err(Error::processing(cause))
            }
            Err(e) => {
                fs::remove_file_if_exists(task.output()).await?;
                Err(e)
            }
        }
    }

    async fn store_artifact(
        &self,
        artifact: &Path,
        key: &str,
        kind: AssetKind,
        job_id: &str,
    ) -> Result<()> {
        self.blobs.upload(artifact, key).await?;
        self.assets
            .register_asset(&AssetDbModel::new(key, kind, Some(job_id.to_string())))
            .await
    }

    fn scratch_for(&self, job_id: &str) -> PathBuf {
        self.config.scratch_dir.join(job_id)
    }

    async fn cleanup_scratch(&self, scratch: &Path) {
        if let Err(e) = fs::remove_dir_if_exists(scratch).await {
            warn!(path = %scratch.display(), error = %e, "Failed to remove scratch directory");
        }
    }
}

/// `input_<n>.<ext>`, keeping the blob's extension so the engine can sniff it.
fn scratch_input_name(index: usize, key: &str) -> String {
    let ext = Path::new(key)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("mp4");
    format!("input_{index}.{ext}")
}
