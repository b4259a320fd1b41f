//! Stream supervisor: start/stop requests and the per-stream monitor loop.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::{StreamRegistry, StreamSlot};
use super::{StreamEvent, SupervisorConfig};
use crate::database::models::StreamDbModel;
use crate::database::repositories::StreamRepository;
use crate::domain::{StreamInfo, StreamStatus};
use crate::media::{MediaEngine, Prober, RelayProcess, RelaySpec};
use crate::store::{TransientStore, stream_key};
use crate::{Error, Result};

const STREAM_EVENT_CAPACITY: usize = 256;

pub struct StreamSupervisor {
    config: SupervisorConfig,
    engine: Arc<dyn MediaEngine>,
    prober: Arc<dyn Prober>,
    transient: Arc<dyn TransientStore>,
    repo: Arc<dyn StreamRepository>,
    registry: StreamRegistry,
    event_tx: broadcast::Sender<StreamEvent>,
    /// Parent of every per-stream stop token.
    cancel_token: CancellationToken,
}

impl StreamSupervisor {
    pub fn new(
        config: SupervisorConfig,
        engine: Arc<dyn MediaEngine>,
        prober: Arc<dyn Prober>,
        transient: Arc<dyn TransientStore>,
        repo: Arc<dyn StreamRepository>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(STREAM_EVENT_CAPACITY);
        Self {
            config,
            engine,
            prober,
            transient,
            repo,
            registry: StreamRegistry::default(),
            event_tx,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.event_tx.subscribe()
    }

    /// Probe the source, launch its relay and start supervising it.
    ///
    /// Returns once the relay process has been launched and recorded as live.
    pub async fn start_stream(
        self: &Arc<Self>,
        source_url: &str,
        stream_id: Option<String>,
    ) -> Result<StreamInfo> {
        let stream_id = stream_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.registry.contains(&stream_id) {
            return Err(Error::StreamExists(stream_id));
        }

        let timeout = self.config.probe_timeout;
        let description =
            match tokio::time::timeout(timeout, self.prober.probe(source_url, timeout)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(Error::SourceUnreachable(format!(
                        "{source_url}: no answer within {:.1}s",
                        timeout.as_secs_f64()
                    )));
                }
            };
        if description.streams.is_empty() {
            return Err(Error::SourceUnreachable(format!("{source_url}: no streams")));
        }
        if !description.has_video() {
            return Err(Error::NoVideoTrack(source_url.to_string()));
        }

        let spec = RelaySpec {
            relay_url: self.config.relay_url(&stream_id),
            stream_id: stream_id.clone(),
            source_url: source_url.to_string(),
            has_audio: description.has_audio(),
        };
        let mut relay = self.engine.spawn_relay(&spec).await?;

        let slot = Arc::new(StreamSlot::new(
            spec,
            self.config.preview_url(&stream_id),
            self.cancel_token.child_token(),
        ));
        if !self.registry.try_insert(Arc::clone(&slot)) {
            self.shutdown_relay(&stream_id, relay.as_mut()).await;
            return Err(Error::StreamExists(stream_id));
        }

        // Hold the slot lock until the monitor handle is stored, so a stop
        // request arriving now waits for a fully registered stream.
        let state = slot.state.lock().await;
        let info = slot.info(&state);
        if let Err(e) = self.persist_new(&info).await {
            drop(state);
            self.registry.remove(&slot);
            self.shutdown_relay(&stream_id, relay.as_mut()).await;
            return Err(e);
        }
        let monitor = tokio::spawn(Arc::clone(self).monitor(Arc::clone(&slot), relay));
        *slot.monitor.lock() = Some(monitor);
        self.emit(&info);
        drop(state);

        info!(
            stream_id = %info.stream_id,
            source_url = %info.source_url,
            relay_url = %info.relay_url,
            has_audio = info.has_audio,
            "Stream started"
        );
        Ok(info)
    }

    /// Stop a stream: mark it stopped, terminate its relay and forget it.
    pub async fn stop_stream(&self, stream_id: &str) -> Result<StreamInfo> {
        let slot = self
            .registry
            .get(stream_id)
            .ok_or_else(|| Error::not_found("Stream", stream_id))?;

        // The Stopped status must be visible before the relay is signalled,
        // otherwise the monitor would treat the exit as a crash.
        let info = {
            let mut state = slot.state.lock().await;
            if !state.status.is_terminal() {
                state.status = StreamStatus::Stopped;
                state.error = None;
                let info = slot.info(&state);
                if let Err(e) = self
                    .transient
                    .hset(&stream_key(stream_id), info.to_hash())
                    .await
                {
                    warn!(stream_id, error = %e, "Failed to record stop in transient store");
                }
                self.emit(&info);
                info
            } else {
                slot.info(&state)
            }
        };

        slot.stop.cancel();
        let monitor = slot.monitor.lock().take();
        if let Some(monitor) = monitor
            && let Err(e) = monitor.await
        {
            error!(stream_id, error = %e, "Stream monitor task panicked");
        }
        self.registry.remove(&slot);

        if info.status == StreamStatus::Stopped {
            self.repo
                .update_stream_status(
                    stream_id,
                    StreamStatus::Stopped.as_str(),
                    i64::from(info.reconnect_attempt),
                    None,
                )
                .await?;
        }
        info!(stream_id, status = info.status.as_str(), "Stream stopped");
        Ok(info)
    }

    /// Current view of a stream. Streams that already ended are answered
    /// from the transient store.
    pub async fn get_status(&self, stream_id: &str) -> Result<Option<StreamInfo>> {
        if let Some(slot) = self.registry.get(stream_id) {
            return Ok(Some(slot.snapshot().await));
        }
        let fields = self.transient.hgetall(&stream_key(stream_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        StreamInfo::from_hash(&fields).map(Some)
    }

    /// Every registered stream, ordered by id.
    pub async fn list_active(&self) -> Vec<StreamInfo> {
        let mut streams = Vec::new();
        for slot in self.registry.slots() {
            streams.push(slot.snapshot().await);
        }
        streams
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    /// Stop every registered stream.
    pub async fn shutdown(&self) {
        let slots = self.registry.slots();
        if !slots.is_empty() {
            info!(count = slots.len(), "Stopping active streams");
        }
        for slot in slots {
            if let Err(e) = self.stop_stream(slot.id()).await {
                warn!(stream_id = %slot.id(), error = %e, "Failed to stop stream");
            }
        }
        self.cancel_token.cancel();
    }

    async fn persist_new(&self, info: &StreamInfo) -> Result<()> {
        self.transient
            .hset(&stream_key(&info.stream_id), info.to_hash())
            .await?;
        self.repo.upsert_stream(&StreamDbModel::from_info(info)).await
    }

    fn emit(&self, info: &StreamInfo) {
        let _ = self.event_tx.send(StreamEvent {
            stream_id: info.stream_id.clone(),
            status: info.status,
            reconnect_attempt: info.reconnect_attempt,
            error: info.error.clone(),
        });
    }

    /// Apply a monitor-driven status change to the slot and both stores.
    ///
    /// Returns `false` without changing anything once the stream has reached
    /// a terminal status (in particular after a stop request).
    async fn set_status(
        &self,
        slot: &StreamSlot,
        status: StreamStatus,
        reconnect_attempt: u32,
        error: Option<String>,
    ) -> bool {
        let mut state = slot.state.lock().await;
        if let Err(e) = state.status.transition_to(status) {
            debug!(stream_id = %slot.id(), error = %e, "Status change skipped");
            return false;
        }
        state.status = status;
        state.reconnect_attempt = reconnect_attempt;
        state.error = error;
        let info = slot.info(&state);
        if let Err(e) = self
            .transient
            .hset(&stream_key(slot.id()), info.to_hash())
            .await
        {
            warn!(stream_id = %slot.id(), error = %e, "Failed to update transient stream state");
        }
        self.emit(&info);
        drop(state);

        if let Err(e) = self
            .repo
            .update_stream_status(
                slot.id(),
                status.as_str(),
                i64::from(reconnect_attempt),
                info.error.as_deref(),
            )
            .await
        {
            warn!(stream_id = %slot.id(), error = %e, "Failed to update durable stream state");
        }
        true
    }

    /// Whether the last exit was requested rather than a crash.
    async fn stop_requested(&self, slot: &Arc<StreamSlot>) -> bool {
        if slot.stop.is_cancelled() || !self.registry.holds(slot) {
            return true;
        }
        match self.transient.hget(&stream_key(slot.id()), "status").await {
            Ok(status) => status.as_deref() == Some(StreamStatus::Stopped.as_str()),
            Err(e) => {
                warn!(stream_id = %slot.id(), error = %e, "Failed to read stream status");
                false
            }
        }
    }

    async fn fail_stream(&self, slot: &Arc<StreamSlot>, reconnect_attempt: u32, cause: String) {
        error!(stream_id = %slot.id(), reconnect_attempt, %cause, "Stream failed");
        if self
            .set_status(slot, StreamStatus::Failed, reconnect_attempt, Some(cause))
            .await
        {
            self.registry.remove(slot);
        }
    }

    /// Graceful terminate, bounded wait, then force kill.
    async fn shutdown_relay(&self, stream_id: &str, relay: &mut dyn RelayProcess) {
        match relay.terminate() {
            Ok(true) => debug!(stream_id, "Sent terminate to relay"),
            Ok(false) => debug!(stream_id, "Relay already exited"),
            Err(e) => warn!(stream_id, error = %e, "Failed to signal relay"),
        }
        match tokio::time::timeout(self.config.stop_timeout, relay.wait()).await {
            Ok(Ok(exit)) => debug!(stream_id, exit = %exit.description, "Relay terminated"),
            Ok(Err(e)) => warn!(stream_id, error = %e, "Failed to reap relay"),
            Err(_) => {
                warn!(
                    stream_id,
                    timeout_secs = self.config.stop_timeout.as_secs(),
                    "Relay ignored terminate, killing"
                );
                if let Err(e) = relay.kill().await {
                    warn!(stream_id, error = %e, "Failed to kill relay");
                }
            }
        }
    }

    /// Watch one relay until it is stopped or gives up.
    async fn monitor(self: Arc<Self>, slot: Arc<StreamSlot>, mut relay: Box<dyn RelayProcess>) {
        let stream_id = slot.id();
        let max_attempts = self.config.max_reconnect_attempts;
        let mut attempt = 0u32;
        let mut launched_at = Instant::now();

        loop {
            let exit = tokio::select! {
                biased;
                _ = slot.stop.cancelled() => None,
                exit = relay.wait() => Some(exit),
            };
            let Some(exit) = exit else {
                self.shutdown_relay(stream_id, relay.as_mut()).await;
                return;
            };

            if self.stop_requested(&slot).await {
                debug!(stream_id, "Relay exit was requested, monitor exiting");
                return;
            }
            match exit {
                Ok(exit) => warn!(stream_id, exit = %exit.description, "Relay exited unexpectedly"),
                Err(e) => warn!(stream_id, error = %e, "Lost track of relay process"),
            }

            if launched_at.elapsed() >= self.config.stable_after {
                attempt = 0;
            }
            attempt += 1;
            if attempt > max_attempts {
                self.fail_stream(
                    &slot,
                    max_attempts,
                    format!("relay kept exiting after {max_attempts} reconnect attempts"),
                )
                .await;
                return;
            }

            if !self
                .set_status(&slot, StreamStatus::Reconnecting, attempt, None)
                .await
            {
                return;
            }
            info!(
                stream_id,
                attempt,
                max_attempts,
                delay_secs = self.config.reconnect_delay.as_secs_f64(),
                "Reconnecting relay"
            );

            let stopped = tokio::select! {
                biased;
                _ = slot.stop.cancelled() => true,
                _ = tokio::time::sleep(self.config.reconnect_delay) => false,
            };
            if stopped {
                return;
            }

            match self.engine.spawn_relay(&slot.spec).await {
                Ok(new_relay) => {
                    relay = new_relay;
                    launched_at = Instant::now();
                    if !self
                        .set_status(&slot, StreamStatus::Live, attempt, None)
                        .await
                    {
                        self.shutdown_relay(stream_id, relay.as_mut()).await;
                        return;
                    }
                }
                Err(e) => {
                    self.fail_stream(&slot, attempt, format!("relaunch failed: {e}"))
                        .await;
                    return;
                }
            }
        }
    }
}
