//! Process configuration.
//!
//! Everything is read from environment variables once at startup (`main`
//! loads a `.env` file first). Unset variables fall back to the defaults of
//! the component configs; set-but-unparsable values are rejected.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::media::{MediaConfig, NormalizationTarget};
use crate::queue::JobQueueConfig;
use crate::stream::SupervisorConfig;
use crate::worker::{ExecutorConfig, WorkerPoolConfig};
use crate::{Error, Result};

fn default_database_url() -> String {
    "sqlite:vidflow.db?mode=rwc".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_blob_root() -> PathBuf {
    PathBuf::from("data/blobs")
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: PathBuf,
    pub blob_root: PathBuf,
    pub workers: WorkerPoolConfig,
    pub queue: JobQueueConfig,
    pub executor: ExecutorConfig,
    pub media: MediaConfig,
    pub supervisor: SupervisorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let log_dir = default_log_dir();
        Self {
            database_url: default_database_url(),
            media: MediaConfig {
                relay_log_dir: Some(log_dir.join(crate::logging::STREAM_LOG_DIR)),
                ..MediaConfig::default()
            },
            log_dir,
            blob_root: default_blob_root(),
            workers: WorkerPoolConfig::default(),
            queue: JobQueueConfig::default(),
            executor: ExecutorConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl AppConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let defaults = Self::default();

        let log_dir = env.path("VIDFLOW_LOG_DIR").unwrap_or(defaults.log_dir);

        let default_target = NormalizationTarget::default();
        let target = NormalizationTarget {
            width: env.parse("VIDFLOW_TARGET_WIDTH")?.unwrap_or(default_target.width),
            height: env.parse("VIDFLOW_TARGET_HEIGHT")?.unwrap_or(default_target.height),
            fps: env.parse("VIDFLOW_TARGET_FPS")?.unwrap_or(default_target.fps),
            lufs: env.parse("VIDFLOW_TARGET_LUFS")?.unwrap_or(default_target.lufs),
            sample_rate: env
                .parse("VIDFLOW_TARGET_SAMPLE_RATE")?
                .unwrap_or(default_target.sample_rate),
        };
        if target.width == 0 || target.height == 0 || target.fps == 0 || target.sample_rate == 0 {
            return Err(Error::Configuration(
                "normalization target dimensions, fps and sample rate must be non-zero".into(),
            ));
        }

        let workers = WorkerPoolConfig {
            max_workers: env.parse("VIDFLOW_WORKERS")?.unwrap_or(defaults.workers.max_workers),
            dequeue_timeout: env
                .secs("VIDFLOW_DEQUEUE_TIMEOUT_SECS")?
                .unwrap_or(defaults.workers.dequeue_timeout),
        };
        if workers.max_workers == 0 {
            return Err(Error::Configuration("VIDFLOW_WORKERS must be at least 1".into()));
        }

        let base = defaults.supervisor;
        let supervisor = SupervisorConfig {
            relay_base: env.string("VIDFLOW_RELAY_BASE").unwrap_or(base.relay_base),
            preview_base: env.string("VIDFLOW_PREVIEW_BASE").unwrap_or(base.preview_base),
            max_reconnect_attempts: env
                .parse("VIDFLOW_RECONNECT_MAX")?
                .unwrap_or(base.max_reconnect_attempts),
            reconnect_delay: env
                .secs("VIDFLOW_RECONNECT_DELAY_SECS")?
                .unwrap_or(base.reconnect_delay),
            stop_timeout: env
                .secs("VIDFLOW_STOP_TIMEOUT_SECS")?
                .unwrap_or(base.stop_timeout),
            probe_timeout: env
                .secs("VIDFLOW_PROBE_TIMEOUT_SECS")?
                .unwrap_or(base.probe_timeout),
            stable_after: env
                .secs("VIDFLOW_STABLE_AFTER_SECS")?
                .unwrap_or(base.stable_after),
        };

        let media = MediaConfig {
            ffmpeg_path: env.string("VIDFLOW_FFMPEG").unwrap_or(defaults.media.ffmpeg_path),
            ffprobe_path: env
                .string("VIDFLOW_FFPROBE")
                .unwrap_or(defaults.media.ffprobe_path),
            target,
            relay_log_dir: Some(log_dir.join(crate::logging::STREAM_LOG_DIR)),
        };

        let executor = ExecutorConfig {
            scratch_dir: env
                .path("VIDFLOW_SCRATCH_DIR")
                .unwrap_or(defaults.executor.scratch_dir),
            target,
            probe_timeout: supervisor.probe_timeout,
        };

        Ok(Self {
            database_url: env.string("DATABASE_URL").unwrap_or(defaults.database_url),
            log_dir,
            blob_root: env.path("VIDFLOW_BLOB_ROOT").unwrap_or(defaults.blob_root),
            workers,
            queue: defaults.queue,
            executor,
            media,
            supervisor,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Blank values count as unset.
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn path(&self, name: &str) -> Option<PathBuf> {
        self.string(name).map(PathBuf::from)
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.string(name)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| Error::Configuration(format!("{name}={raw:?}: {e}")))
            })
            .transpose()
    }

    fn secs(&self, name: &str) -> Result<Option<Duration>> {
        Ok(self.parse::<u64>(name)?.map(Duration::from_secs))
    }
}
