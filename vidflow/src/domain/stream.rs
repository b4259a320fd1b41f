//! Live relay state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::job::parse_time;
use crate::{Error, Result};

/// Relay lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamStatus {
    /// The relay process is running.
    Live,
    /// The relay exited unexpectedly and is waiting to be relaunched.
    Reconnecting,
    /// The relay was stopped on request.
    Stopped,
    /// The relay could not be kept alive.
    Failed,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "LIVE",
            Self::Reconnecting => "RECONNECTING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LIVE" => Some(Self::Live),
            "RECONNECTING" => Some(Self::Reconnecting),
            "STOPPED" => Some(Self::Stopped),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    pub fn can_transition_to(&self, target: StreamStatus) -> bool {
        use StreamStatus::*;

        match (self, target) {
            (Live, Reconnecting | Stopped | Failed) => true,
            (Reconnecting, Live | Stopped | Failed) => true,
            _ => false,
        }
    }

    pub fn transition_to(&self, target: StreamStatus) -> Result<StreamStatus> {
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

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time view of a supervised stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub stream_id: String,
    pub source_url: String,
    pub relay_url: String,
    pub preview_url: String,
    pub has_audio: bool,
    pub status: StreamStatus,
    pub reconnect_attempt: u32,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl StreamInfo {
    /// Flatten into the transient-store hash layout.
    pub fn to_hash(&self) -> Vec<(String, String)> {
        vec![
            ("stream_id".into(), self.stream_id.clone()),
            ("status".into(), self.status.as_str().into()),
            ("source_url".into(), self.source_url.clone()),
            ("relay_url".into(), self.relay_url.clone()),
            ("preview_url".into(), self.preview_url.clone()),
            ("has_audio".into(), u8::from(self.has_audio).to_string()),
            ("started_at".into(), self.started_at.to_rfc3339()),
            ("reconnect_attempt".into(), self.reconnect_attempt.to_string()),
            ("error".into(), self.error.clone().unwrap_or_default()),
        ]
    }

    /// Rebuild from a transient-store hash.
    pub fn from_hash(fields: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &str| {
            fields
                .get(name)
                .cloned()
                .ok_or_else(|| Error::Other(format!("stream hash is missing field '{name}'")))
        };

        let status = get("status")?;
        Ok(Self {
            stream_id: get("stream_id")?,
            source_url: get("source_url")?,
            relay_url: get("relay_url")?,
            preview_url: get("preview_url").unwrap_or_default(),
            has_audio: get("has_audio")? == "1",
            status: StreamStatus::parse(&status)
                .ok_or_else(|| Error::Other(format!("unknown stream status '{status}'")))?,
            reconnect_attempt: get("reconnect_attempt")?
                .parse()
                .map_err(|e| Error::Other(format!("invalid reconnect_attempt: {e}")))?,
            error: fields.get("error").filter(|e| !e.is_empty()).cloned(),
            started_at: parse_time(fields.get("started_at"))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_str() {
        assert_eq!(StreamStatus::parse("LIVE"), Some(StreamStatus::Live));
        assert_eq!(StreamStatus::parse("live"), None);
    }

    #[test]
    fn test_valid_transitions() {
        assert!(StreamStatus::Live.can_transition_to(StreamStatus::Reconnecting));
        assert!(StreamStatus::Reconnecting.can_transition_to(StreamStatus::Live));
        assert!(StreamStatus::Reconnecting.can_transition_to(StreamStatus::Stopped));
    }

    #[test]
    fn test_terminal_states_are_final() {
        assert!(!StreamStatus::Stopped.can_transition_to(StreamStatus::Live));
        assert!(!StreamStatus::Failed.can_transition_to(StreamStatus::Reconnecting));
        assert!(StreamStatus::Stopped.transition_to(StreamStatus::Failed).is_err());
    }

    #[test]
    fn test_hash_layout() {
        let info = StreamInfo {
            stream_id: "cam-1".into(),
            source_url: "rtsp://10.0.0.2/live".into(),
            relay_url: "rtmp://localhost:1935/live/cam-1".into(),
            preview_url: "http://localhost:8888/cam-1/index.m3u8".into(),
            has_audio: true,
            status: StreamStatus::Reconnecting,
            reconnect_attempt: 2,
            error: None,
            started_at: Utc::now(),
        };

        let fields: HashMap<String, String> = info.to_hash().into_iter().collect();
        assert_eq!(fields["has_audio"], "1");
        assert_eq!(fields["reconnect_attempt"], "2");

        let parsed = StreamInfo::from_hash(&fields).unwrap();
        assert_eq!(parsed.status, StreamStatus::Reconnecting);
        assert_eq!(parsed.relay_url, info.relay_url);
    }
}
