//! Media engine: ffmpeg batch tasks and long-running relay processes.

use std::collections::VecDeque;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tracing::{debug, info, warn};

use super::MediaConfig;
use crate::utils::fs;
use crate::{Error, Result};

/// Number of trailing stderr lines kept as the failure cause.
const STDERR_TAIL_LINES: usize = 8;

/// A batch operation with a single artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaTask {
    /// Scale/pad to the target frame, resample fps, loudness-normalize audio.
    Normalize {
        input: PathBuf,
        output: PathBuf,
        has_audio: bool,
    },
    /// Join two clips, fading the tail of `first` into the head of `second`.
    CrossfadeMerge {
        first: PathBuf,
        second: PathBuf,
        output: PathBuf,
        fade_secs: f64,
        /// Position in `first` where the fade starts.
        offset_secs: f64,
        has_audio: bool,
    },
}

impl MediaTask {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Normalize { .. } => "normalize",
            Self::CrossfadeMerge { .. } => "merge",
        }
    }

    pub fn output(&self) -> &Path {
        match self {
            Self::Normalize { output, .. } | Self::CrossfadeMerge { output, .. } => output,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MediaOutcome {
    Succeeded { artifact: PathBuf },
    Failed { cause: String },
}

/// Parameters of one relay launch. Reused verbatim on every reconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySpec {
    pub stream_id: String,
    pub source_url: String,
    pub relay_url: String,
    pub has_audio: bool,
}

/// How a relay process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayExit {
    pub success: bool,
    pub description: String,
}

/// A running relay, exclusively owned by its stream monitor.
#[async_trait]
pub trait RelayProcess: Send {
    /// Wait for the process to exit. Cancel-safe.
    async fn wait(&mut self) -> Result<RelayExit>;
    /// Ask the process to shut down gracefully. Returns `false` if it had
    /// already exited.
    fn terminate(&mut self) -> Result<bool>;
    /// Force-kill and reap the process.
    async fn kill(&mut self) -> Result<()>;
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Run a batch task to completion.
    ///
    /// A task the engine ran but could not finish is `Ok(MediaOutcome::Failed)`;
    /// `Err` means the engine itself could not be started.
    async fn run(&self, task: &MediaTask) -> Result<MediaOutcome>;

    /// Launch a relay from the source to the relay address.
    async fn spawn_relay(&self, spec: &RelaySpec) -> Result<Box<dyn RelayProcess>>;
}

pub struct FfmpegEngine {
    config: MediaConfig,
}

impl FfmpegEngine {
    pub fn new(config: MediaConfig) -> Self {
        Self { config }
    }

    pub fn build_task_args(&self, task: &MediaTask) -> Vec<String> {
        let target = &self.config.target;
        let mut args: Vec<String> = ["-y", "-hide_banner", "-nostats", "-loglevel", "error"]
            .map(String::from)
            .to_vec();

        match task {
            MediaTask::Normalize {
                input,
                output,
                has_audio,
            } => {
                args.extend(["-i".into(), input.display().to_string()]);
                args.extend(["-vf".into(), target.video_filter(None)]);
                args.extend(
                    ["-c:v", "libx264", "-preset", "veryfast", "-crf", "23"].map(String::from),
                );
                if *has_audio {
                    args.extend(["-af".into(), target.loudnorm_filter()]);
                    args.extend(["-ar".into(), target.sample_rate.to_string()]);
                    args.extend(["-c:a".into(), "aac".into()]);
                }
                args.extend(["-movflags".into(), "+faststart".into()]);
                args.push(output.display().to_string());
            }
            MediaTask::CrossfadeMerge {
                first,
                second,
                output,
                fade_secs,
                offset_secs,
                has_audio,
            } => {
                args.extend(["-i".into(), first.display().to_string()]);
                args.extend(["-i".into(), second.display().to_string()]);

                let mut graph = format!(
                    "[0:v][1:v]xfade=transition=fade:duration={fade_secs}:offset={offset_secs},format=yuv420p[v]"
                );
                if *has_audio {
                    graph.push_str(&format!(";[0:a][1:a]acrossfade=d={fade_secs}[a]"));
                }
                args.extend(["-filter_complex".into(), graph]);
                args.extend(["-map".into(), "[v]".into()]);
                if *has_audio {
                    args.extend(["-map".into(), "[a]".into(), "-c:a".into(), "aac".into()]);
                }
                args.extend(
                    ["-c:v", "libx264", "-preset", "veryfast", "-crf", "23"].map(String::from),
                );
                args.extend(["-movflags".into(), "+faststart".into()]);
                args.push(output.display().to_string());
            }
        }
        args
    }

    pub fn build_relay_args(&self, spec: &RelaySpec) -> Vec<String> {
        let target = &self.config.target;
        let mut args: Vec<String> = vec!["-y".into(), "-hide_banner".into()];

        if spec.source_url.starts_with("rtsp://") {
            args.extend(["-rtsp_transport".into(), "tcp".into()]);
        }
        args.extend(
            [
                "-fflags",
                "nobuffer+genpts",
                "-flags",
                "low_delay",
                "-analyzeduration",
                "10000000",
                "-probesize",
                "10000000",
            ]
            .map(String::from),
        );
        args.extend(["-i".into(), spec.source_url.clone()]);
        args.extend(["-vf".into(), target.video_filter(Some("lanczos"))]);
        if spec.has_audio {
            args.extend([
                "-af".into(),
                format!("afftdn,{},alimiter", target.loudnorm_filter()),
            ]);
        }
        args.extend(
            [
                "-c:v",
                "libx264",
                "-profile:v",
                "high",
                "-level",
                "4.0",
                "-pix_fmt",
                "yuv420p",
                "-preset",
                "veryfast",
                "-tune",
                "zerolatency",
                "-crf",
                "23",
            ]
            .map(String::from),
        );
        if spec.has_audio {
            args.extend([
                "-c:a".into(),
                "aac".into(),
                "-ar".into(),
                target.sample_rate.to_string(),
            ]);
        } else {
            args.push("-an".into());
        }
        args.extend(["-f".into(), "flv".into(), spec.relay_url.clone()]);
        args
    }

    fn relay_stderr(&self, stream_id: &str) -> Stdio {
        let Some(dir) = &self.config.relay_log_dir else {
            return Stdio::null();
        };
        let path = dir.join(format!("{stream_id}.log"));
        let opened = std::fs::create_dir_all(dir).and_then(|_| {
            File::options().create(true).append(true).open(&path)
        });
        match opened {
            Ok(file) => Stdio::from(file),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot open relay log, discarding stderr");
                Stdio::null()
            }
        }
    }
}

#[async_trait]
impl MediaEngine for FfmpegEngine {
    async fn run(&self, task: &MediaTask) -> Result<MediaOutcome> {
        let output_path = task.output().to_path_buf();
        fs::ensure_parent_dir("creating output directory", &output_path).await?;

        let args = self.build_task_args(task);
        debug!(task = task.name(), ?args, "Running ffmpeg");

        let mut cmd = process_utils::tokio_command(&self.config.ffmpeg_path);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            Error::Other(format!("Failed to spawn {}: {}", self.config.ffmpeg_path, e))
        })?;

        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            while let Some(line) = lines.next_line().await? {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }

        let status = child.wait().await?;
        if status.success() && tokio::fs::try_exists(&output_path).await.unwrap_or(false) {
            info!(task = task.name(), output = %output_path.display(), "ffmpeg task finished");
            return Ok(MediaOutcome::Succeeded {
                artifact: output_path,
            });
        }

        let detail = Vec::from(tail).join("\n");
        let cause = if detail.trim().is_empty() {
            format!("ffmpeg {} failed with {}", task.name(), process_utils::describe_exit(&status))
        } else {
            format!(
                "ffmpeg {} failed with {}: {}",
                task.name(),
                process_utils::describe_exit(&status),
                detail.trim()
            )
        };
        Ok(MediaOutcome::Failed { cause })
    }

    async fn spawn_relay(&self, spec: &RelaySpec) -> Result<Box<dyn RelayProcess>> {
        let mut cmd = process_utils::tokio_command(&self.config.ffmpeg_path);
        cmd.args(self.build_relay_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(self.relay_stderr(&spec.stream_id));

        let child = cmd.spawn().map_err(|e| {
            Error::Other(format!("Failed to spawn relay for {}: {}", spec.stream_id, e))
        })?;
        info!(
            stream_id = %spec.stream_id,
            pid = ?child.id(),
            relay_url = %spec.relay_url,
            "Relay process launched"
        );
        Ok(Box::new(FfmpegRelay { child }))
    }
}

/// An ffmpeg relay child process.
pub struct FfmpegRelay {
    child: Child,
}

#[async_trait]
impl RelayProcess for FfmpegRelay {
    async fn wait(&mut self) -> Result<RelayExit> {
        let status = self.child.wait().await?;
        Ok(RelayExit {
            success: status.success(),
            description: process_utils::describe_exit(&status),
        })
    }

    fn terminate(&mut self) -> Result<bool> {
        Ok(process_utils::request_terminate(&mut self.child)?)
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }
}
