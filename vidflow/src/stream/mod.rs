//! Live relay supervision.
//!
//! A stream is one long-running relay process converting a live source to the
//! target format. The [`StreamSupervisor`] launches it, restarts it when it
//! drops (up to a budget) and stops it on request.

mod registry;
mod supervisor;

use std::time::Duration;

pub use supervisor::StreamSupervisor;

use crate::domain::StreamStatus;

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Relay addresses are `<relay_base>/<stream_id>`.
    pub relay_base: String,
    /// Preview playlists are `<preview_base>/<stream_id>/index.m3u8`.
    pub preview_base: String,
    /// Unplanned restarts allowed before a stream is marked failed.
    pub max_reconnect_attempts: u32,
    /// Fixed wait before each relaunch.
    pub reconnect_delay: Duration,
    /// Grace period between a stop request and a force kill.
    pub stop_timeout: Duration,
    /// Upper bound on probing a source before launch.
    pub probe_timeout: Duration,
    /// Uptime after which a relaunched relay counts as healthy again and the
    /// reconnect counter starts over.
    pub stable_after: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            relay_base: "rtmp://localhost:1935/live".to_string(),
            preview_base: "http://localhost:8888".to_string(),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(30),
            stable_after: Duration::from_secs(60),
        }
    }
}

impl SupervisorConfig {
    pub fn relay_url(&self, stream_id: &str) -> String {
        format!("{}/{}", self.relay_base.trim_end_matches('/'), stream_id)
    }

    pub fn preview_url(&self, stream_id: &str) -> String {
        format!(
            "{}/{}/index.m3u8",
            self.preview_base.trim_end_matches('/'),
            stream_id
        )
    }
}

/// Published on every stream status change.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub stream_id: String,
    pub status: StreamStatus,
    pub reconnect_attempt: u32,
    pub error: Option<String>,
}
