//! Media probing through `ffprobe`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::NormalizationTarget;
use crate::{Error, Result};

/// Bytes/microseconds ffprobe may read before deciding on a live source.
const LIVE_PROBE_BUDGET: &str = "10000000";

/// One elementary stream as reported by ffprobe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaStream {
    #[serde(default)]
    pub index: u32,
    /// `video`, `audio`, `data`, `subtitle`...
    #[serde(default)]
    pub codec_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r_frame_rate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_frame_rate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
}

impl MediaStream {
    pub fn is_video(&self) -> bool {
        self.codec_type == "video"
    }

    pub fn is_audio(&self) -> bool {
        self.codec_type == "audio"
    }
}

/// Container-level information.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaFormat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_rate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

/// What a probe learned about a file or live source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamDescription {
    #[serde(default)]
    pub streams: Vec<MediaStream>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<MediaFormat>,
}

impl StreamDescription {
    /// Parse ffprobe `-print_format json` output.
    pub fn from_ffprobe_json(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn video(&self) -> Option<&MediaStream> {
        self.streams.iter().find(|s| s.is_video())
    }

    pub fn audio(&self) -> Option<&MediaStream> {
        self.streams.iter().find(|s| s.is_audio())
    }

    pub fn has_video(&self) -> bool {
        self.video().is_some()
    }

    pub fn has_audio(&self) -> bool {
        self.audio().is_some()
    }

    /// Container duration, falling back to the longest stream.
    pub fn duration_secs(&self) -> Option<f64> {
        let parse = |d: &Option<String>| d.as_deref().and_then(|s| s.parse::<f64>().ok());
        self.format.as_ref().and_then(|f| parse(&f.duration)).or_else(|| {
            self.streams
                .iter()
                .filter_map(|s| parse(&s.duration))
                .reduce(f64::max)
        })
    }

    /// Which normalizations this media needs to reach `target`.
    pub fn analyze(&self, target: &NormalizationTarget) -> Analysis {
        let video = self.video();
        let resolution = video.is_some_and(|v| {
            v.width != Some(target.width) || v.height != Some(target.height)
        });
        let expected_rate = format!("{}/1", target.fps);
        let fps = video.is_some_and(|v| v.r_frame_rate.as_deref() != Some(expected_rate.as_str()));

        Analysis {
            resolution,
            fps,
            audio: self.has_audio(),
        }
    }
}

/// Normalization flags for one asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub resolution: bool,
    pub fps: bool,
    /// Audio present, so loudness normalization applies.
    pub audio: bool,
}

#[async_trait]
pub trait Prober: Send + Sync {
    /// Describe the media at `address` (a local path or a live URL).
    ///
    /// An address that yields nothing within `timeout` is
    /// [`Error::SourceUnreachable`].
    async fn probe(&self, address: &str, timeout: Duration) -> Result<StreamDescription>;
}

pub struct FfprobeProber {
    ffprobe_path: String,
}

impl FfprobeProber {
    pub fn new(ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
        }
    }

    fn is_live(address: &str) -> bool {
        address.contains("://") && !address.starts_with("file://")
    }

    pub fn build_args(address: &str) -> Vec<String> {
        let mut args: Vec<String> = vec!["-v".into(), "error".into()];
        if address.starts_with("rtsp://") {
            args.extend(["-rtsp_transport".into(), "tcp".into()]);
        }
        if Self::is_live(address) {
            args.extend([
                "-analyzeduration".into(),
                LIVE_PROBE_BUDGET.into(),
                "-probesize".into(),
                LIVE_PROBE_BUDGET.into(),
            ]);
        }
        args.extend([
            "-print_format".into(),
            "json".into(),
            "-show_streams".into(),
            "-show_format".into(),
            address.into(),
        ]);
        args
    }
}

#[async_trait]
impl Prober for FfprobeProber {
    async fn probe(&self, address: &str, timeout: Duration) -> Result<StreamDescription> {
        let mut cmd = process_utils::tokio_command(&self.ffprobe_path);
        cmd.args(Self::build_args(address))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(output) => output.map_err(|e| {
                Error::SourceUnreachable(format!(
                    "{address}: failed to run {}: {e}",
                    self.ffprobe_path
                ))
            })?,
            Err(_) => {
                return Err(Error::SourceUnreachable(format!(
                    "{address}: no answer within {:.1}s",
                    timeout.as_secs_f64()
                )));
            }
        };

        if output.stdout.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::SourceUnreachable(format!(
                "{address}: {}",
                stderr.trim()
            )));
        }

        let description = StreamDescription::from_ffprobe_json(&output.stdout).map_err(|e| {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Error::SourceUnreachable(format!(
                "{address}: unreadable ffprobe output ({e}) {}",
                stderr.trim()
            ))
        })?;
        if description.streams.is_empty() {
            return Err(Error::SourceUnreachable(format!("{address}: no streams")));
        }
        debug!(
            address,
            streams = description.streams.len(),
            "Probed media source"
        );
        Ok(description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "h264",
             "width": 1280, "height": 720, "r_frame_rate": "25/1", "avg_frame_rate": "25/1",
             "duration": "12.040000"},
            {"index": 1, "codec_type": "audio", "codec_name": "aac",
             "sample_rate": "44100", "channels": 2, "duration": "12.100000"}
        ],
        "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "12.100000",
                   "bit_rate": "1200000", "size": "1815000", "tags": {"encoder": "Lavf"}}
    }"#;

    #[test]
    fn test_parse_ffprobe_output() {
        let desc = StreamDescription::from_ffprobe_json(SAMPLE.as_bytes()).unwrap();
        assert_eq!(desc.streams.len(), 2);
        assert!(desc.has_video());
        assert!(desc.has_audio());
        assert_eq!(desc.video().unwrap().width, Some(1280));
        assert_eq!(desc.duration_secs(), Some(12.1));
    }

    #[test]
    fn test_duration_falls_back_to_streams() {
        let desc = StreamDescription {
            streams: vec![
                MediaStream {
                    codec_type: "video".into(),
                    duration: Some("4.5".into()),
                    ..Default::default()
                },
                MediaStream {
                    codec_type: "audio".into(),
                    duration: Some("5.0".into()),
                    ..Default::default()
                },
            ],
            format: None,
        };
        assert_eq!(desc.duration_secs(), Some(5.0));
    }

    #[test]
    fn test_analyze_against_target() {
        let desc = StreamDescription::from_ffprobe_json(SAMPLE.as_bytes()).unwrap();

        let analysis = desc.analyze(&NormalizationTarget::default());
        assert_eq!(
            analysis,
            Analysis {
                resolution: true,
                fps: true,
                audio: true
            }
        );

        let matching = NormalizationTarget {
            width: 1280,
            height: 720,
            fps: 25,
            ..Default::default()
        };
        let analysis = desc.analyze(&matching);
        assert!(!analysis.resolution);
        assert!(!analysis.fps);
    }

    #[test]
    fn test_build_args_for_rtsp() {
        let args = FfprobeProber::build_args("rtsp://cam.local/stream");
        assert_eq!(&args[2..4], ["-rtsp_transport", "tcp"]);
        assert!(args.contains(&"-analyzeduration".to_string()));
        assert_eq!(args.last().unwrap(), "rtsp://cam.local/stream");
    }

    #[tokio::test]
    async fn test_missing_ffprobe_is_unreachable() {
        let prober = FfprobeProber::new("/nonexistent/ffprobe");
        let err = prober
            .probe("rtsp://cam.local/stream", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SourceUnreachable(_)), "{err}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_garbled_output_is_unreachable() {
        // `echo` prints its arguments back, which is not ffprobe JSON.
        let prober = FfprobeProber::new("echo");
        let err = prober
            .probe("rtsp://cam.local/stream", Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            Error::SourceUnreachable(msg) => assert!(msg.starts_with("rtsp://cam.local/stream:")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_build_args_for_file() {
        let args = FfprobeProber::build_args("/data/clip.mp4");
        assert!(!args.contains(&"-rtsp_transport".to_string()));
        assert!(!args.contains(&"-probesize".to_string()));
    }
}
