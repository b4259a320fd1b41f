//! Stream database models.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::job::parse_time;
use crate::domain::{StreamInfo, StreamStatus};
use crate::{Error, Result};

/// Durable copy of a supervised relay.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StreamDbModel {
    pub id: String,
    pub source_url: String,
    pub relay_url: String,
    pub preview_url: String,
    pub has_audio: bool,
    /// Status: LIVE, RECONNECTING, STOPPED, FAILED
    pub status: String,
    pub reconnect_attempt: i64,
    pub error: Option<String>,
    pub started_at: String,
    pub created_at: String,
    pub updated_at: String,
}

impl StreamDbModel {
    pub fn from_info(info: &StreamInfo) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: info.stream_id.clone(),
            source_url: info.source_url.clone(),
            relay_url: info.relay_url.clone(),
            preview_url: info.preview_url.clone(),
            has_audio: info.has_audio,
            status: info.status.as_str().to_string(),
            reconnect_attempt: i64::from(info.reconnect_attempt),
            error: info.error.clone(),
            started_at: info.started_at.to_rfc3339(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn into_info(self) -> Result<StreamInfo> {
        let status = StreamStatus::parse(&self.status)
            .ok_or_else(|| Error::Database(format!("unknown stream status '{}'", self.status)))?;
        Ok(StreamInfo {
            stream_id: self.id,
            source_url: self.source_url,
            relay_url: self.relay_url,
            preview_url: self.preview_url,
            has_audio: self.has_audio,
            status,
            reconnect_attempt: u32::try_from(self.reconnect_attempt).unwrap_or_default(),
            error: self.error,
            started_at: parse_time(Some(&self.started_at))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_info_rejects_unknown_status() {
        let info = StreamInfo {
            stream_id: "cam-1".into(),
            source_url: "rtsp://camera/1".into(),
            relay_url: "rtmp://localhost:1935/live/cam-1".into(),
            preview_url: "http://localhost:8888/cam-1/index.m3u8".into(),
            has_audio: false,
            status: StreamStatus::Reconnecting,
            reconnect_attempt: 3,
            error: None,
            started_at: Utc::now(),
        };
        let model = StreamDbModel::from_info(&info);
        assert_eq!(model.status, "RECONNECTING");

        let back = model.clone().into_info().unwrap();
        assert_eq!(back.reconnect_attempt, 3);
        assert_eq!(back.status, StreamStatus::Reconnecting);

        let broken = StreamDbModel {
            status: "PAUSED".into(),
            ..model
        };
        assert!(broken.into_info().is_err());
    }
}
