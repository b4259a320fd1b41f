//! Shared fixtures: a migrated SQLite file, a filesystem blob root and
//! scripted media collaborators.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use vidflow::config::AppConfig;
use vidflow::database::{DbPool, init_pool, run_migrations};
use vidflow::jobs::JobEvent;
use vidflow::media::{
    BlobStore, FsBlobStore, MediaEngine, MediaFormat, MediaOutcome, MediaStream, MediaTask,
    Prober, RelayExit, RelayProcess, RelaySpec, StreamDescription,
};
use vidflow::services::{Collaborators, ServiceContainer};
use vidflow::store::MemoryStore;
use vidflow::stream::StreamEvent;
use vidflow::{Error, Result};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn video_stream() -> MediaStream {
    MediaStream {
        index: 0,
        codec_type: "video".into(),
        codec_name: Some("h264".into()),
        width: Some(1280),
        height: Some(720),
        r_frame_rate: Some("25/1".into()),
        avg_frame_rate: Some("25/1".into()),
        ..Default::default()
    }
}

pub fn audio_stream() -> MediaStream {
    MediaStream {
        index: 1,
        codec_type: "audio".into(),
        codec_name: Some("aac".into()),
        sample_rate: Some("44100".into()),
        channels: Some(2),
        ..Default::default()
    }
}

/// A clip with video and audio lasting `duration` seconds.
pub fn clip(duration: f64) -> StreamDescription {
    StreamDescription {
        streams: vec![video_stream(), audio_stream()],
        format: Some(MediaFormat {
            format_name: Some("mov,mp4,m4a,3gp,3g2,mj2".into()),
            duration: Some(duration.to_string()),
            ..Default::default()
        }),
    }
}

pub fn audio_only() -> StreamDescription {
    StreamDescription {
        streams: vec![audio_stream()],
        format: None,
    }
}

#[derive(Clone)]
pub enum ProbeScript {
    Describe(StreamDescription),
    Unreachable,
    /// Never answers.
    Hang,
}

/// Answers every probe with a canned description. Addresses containing an
/// override pattern get the override instead.
pub struct FakeProber {
    default: StreamDescription,
    overrides: Mutex<Vec<(String, ProbeScript)>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakeProber {
    pub fn new() -> Self {
        Self {
            default: clip(10.0),
            overrides: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, pattern: &str, script: ProbeScript) {
        self.overrides.lock().push((pattern.to_string(), script));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(&self, address: &str, _timeout: Duration) -> Result<StreamDescription> {
        self.calls.lock().push(address.to_string());
        let script = self
            .overrides
            .lock()
            .iter()
            .find(|(pattern, _)| address.contains(pattern.as_str()))
            .map(|(_, script)| script.clone());
        match script {
            Some(ProbeScript::Describe(description)) => Ok(description),
            Some(ProbeScript::Unreachable) => {
                Err(Error::SourceUnreachable(format!("{address}: connection refused")))
            }
            Some(ProbeScript::Hang) => std::future::pending().await,
            None => Ok(self.default.clone()),
        }
    }
}

/// Relay that runs for a fixed time, or until terminated when no lifetime
/// is set. A stubborn relay only goes away when killed.
pub struct FakeRelay {
    lifetime: Option<Duration>,
    stubborn: bool,
    stop: CancellationToken,
    terminated: Arc<AtomicUsize>,
    killed: Arc<AtomicUsize>,
}

#[async_trait]
impl RelayProcess for FakeRelay {
    async fn wait(&mut self) -> Result<RelayExit> {
        match self.lifetime {
            Some(lifetime) => {
                tokio::select! {
                    _ = self.stop.cancelled() => {}
                    _ = tokio::time::sleep(lifetime) => {}
                }
            }
            None => self.stop.cancelled().await,
        }
        let success = self.stop.is_cancelled();
        Ok(RelayExit {
            success,
            description: if success { "exit code 0" } else { "exit code 1" }.to_string(),
        })
    }

    fn terminate(&mut self) -> Result<bool> {
        if self.stop.is_cancelled() {
            return Ok(false);
        }
        self.terminated.fetch_add(1, Ordering::SeqCst);
        if !self.stubborn {
            self.stop.cancel();
        }
        Ok(true)
    }

    async fn kill(&mut self) -> Result<()> {
        self.killed.fetch_add(1, Ordering::SeqCst);
        self.stop.cancel();
        Ok(())
    }
}

/// Engine that writes a small artifact for every task and launches
/// [`FakeRelay`]s.
pub struct FakeEngine {
    pub fail_tasks: AtomicBool,
    relay_lifetime: Mutex<Option<Duration>>,
    /// Launches allowed before `spawn_relay` starts failing.
    launch_limit: Mutex<Option<usize>>,
    pub stubborn_relays: AtomicBool,
    pub tasks: Mutex<Vec<MediaTask>>,
    pub relays_spawned: AtomicUsize,
    pub relays_terminated: Arc<AtomicUsize>,
    pub relays_killed: Arc<AtomicUsize>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            fail_tasks: AtomicBool::new(false),
            relay_lifetime: Mutex::new(None),
            launch_limit: Mutex::new(None),
            stubborn_relays: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            relays_spawned: AtomicUsize::new(0),
            relays_terminated: Arc::new(AtomicUsize::new(0)),
            relays_killed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make every relay launched from now on exit after `lifetime`.
    pub fn set_relay_lifetime(&self, lifetime: Option<Duration>) {
        *self.relay_lifetime.lock() = lifetime;
    }

    /// Fail every launch after the first `limit`.
    pub fn limit_launches(&self, limit: usize) {
        *self.launch_limit.lock() = Some(limit);
    }

    /// Launch attempts, failed ones included.
    pub fn spawned(&self) -> usize {
        self.relays_spawned.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> usize {
        self.relays_terminated.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> usize {
        self.relays_killed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn run(&self, task: &MediaTask) -> Result<MediaOutcome> {
        self.tasks.lock().push(task.clone());
        if self.fail_tasks.load(Ordering::SeqCst) {
            tokio::fs::write(task.output(), b"partial").await?;
            return Ok(MediaOutcome::Failed {
                cause: "Conversion failed! encoder exploded".into(),
            });
        }
        tokio::fs::write(task.output(), format!("{} output", task.name())).await?;
        Ok(MediaOutcome::Succeeded {
            artifact: task.output().to_path_buf(),
        })
    }

    async fn spawn_relay(&self, spec: &RelaySpec) -> Result<Box<dyn RelayProcess>> {
        let launched = self.relays_spawned.fetch_add(1, Ordering::SeqCst);
        if self.launch_limit.lock().is_some_and(|limit| launched >= limit) {
            return Err(Error::Processing(format!(
                "relay for {} exited during startup",
                spec.stream_id
            )));
        }
        Ok(Box::new(FakeRelay {
            lifetime: *self.relay_lifetime.lock(),
            stubborn: self.stubborn_relays.load(Ordering::SeqCst),
            stop: CancellationToken::new(),
            terminated: self.relays_terminated.clone(),
            killed: self.relays_killed.clone(),
        }))
    }
}

pub fn test_config(root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.database_url = format!("sqlite://{}?mode=rwc", root.join("vidflow.db").display());
    config.log_dir = root.join("logs");
    config.blob_root = root.join("blobs");
    config.executor.scratch_dir = root.join("scratch");
    config.media.relay_log_dir = None;
    config.workers.max_workers = 2;
    config.workers.dequeue_timeout = Duration::from_millis(50);
    config.supervisor.reconnect_delay = Duration::from_millis(10);
    config.supervisor.stop_timeout = Duration::from_millis(500);
    config.supervisor.probe_timeout = Duration::from_secs(1);
    config
}

pub struct Harness {
    pub dir: TempDir,
    pub config: AppConfig,
    pub pool: DbPool,
    pub engine: Arc<FakeEngine>,
    pub prober: Arc<FakeProber>,
    pub blobs: Arc<FsBlobStore>,
    pub container: ServiceContainer,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut AppConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        adjust(&mut config);

        let pool = init_pool(&config.database_url).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let engine = Arc::new(FakeEngine::new());
        let prober = Arc::new(FakeProber::new());
        let blobs = Arc::new(FsBlobStore::new(config.blob_root.clone()));
        let container = Self::container(&config, &pool, &engine, &prober, &blobs);

        Self {
            dir,
            config,
            pool,
            engine,
            prober,
            blobs,
            container,
        }
    }

    fn container(
        config: &AppConfig,
        pool: &DbPool,
        engine: &Arc<FakeEngine>,
        prober: &Arc<FakeProber>,
        blobs: &Arc<FsBlobStore>,
    ) -> ServiceContainer {
        ServiceContainer::with_collaborators(
            config,
            pool.clone(),
            Collaborators {
                engine: engine.clone(),
                prober: prober.clone(),
                blobs: blobs.clone(),
                transient: Arc::new(MemoryStore::new()),
            },
        )
    }

    /// A second container on the same durable store with an empty transient
    /// store, as after a process restart.
    pub fn restarted(&self) -> ServiceContainer {
        Self::container(&self.config, &self.pool, &self.engine, &self.prober, &self.blobs)
    }

    pub async fn put_asset(&self, key: &str) {
        self.blobs
            .put(key, Bytes::from_static(b"not really a video"))
            .await
            .unwrap();
    }
}

/// Collect one job's events until it reaches a terminal state.
pub async fn job_events(rx: &mut broadcast::Receiver<JobEvent>, job_id: &str) -> Vec<JobEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for job event")
            .expect("job event channel closed");
        if event.job_id != job_id {
            continue;
        }
        let terminal = event.state.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

/// Wait for the stream event matching `pred`, returning every event of that
/// stream seen up to and including it.
pub async fn stream_events_until(
    rx: &mut broadcast::Receiver<StreamEvent>,
    stream_id: &str,
    pred: impl Fn(&StreamEvent) -> bool,
) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for stream event")
            .expect("stream event channel closed");
        if event.stream_id != stream_id {
            continue;
        }
        let done = pred(&event);
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Poll `cond` until it holds, panicking after [`EVENT_TIMEOUT`].
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
