//! Media collaborators: the blob store holding assets, the prober describing
//! media sources and the engine running ffmpeg work.

pub mod blob;
pub mod engine;
pub mod probe;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use blob::{BlobStore, FsBlobStore};
pub use engine::{
    FfmpegEngine, MediaEngine, MediaOutcome, MediaTask, RelayExit, RelayProcess, RelaySpec,
};
pub use probe::{Analysis, FfprobeProber, MediaFormat, MediaStream, Prober, StreamDescription};

/// Output format every normalize job and every relay converges to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizationTarget {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Integrated loudness target in LUFS.
    pub lufs: f64,
    pub sample_rate: u32,
}

impl Default for NormalizationTarget {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            lufs: -16.0,
            sample_rate: 48_000,
        }
    }
}

impl NormalizationTarget {
    /// `scale,pad,fps,format` chain shared by normalize and relay.
    pub fn video_filter(&self, scale_flags: Option<&str>) -> String {
        let (w, h) = (self.width, self.height);
        let flags = scale_flags.map(|f| format!(":flags={f}")).unwrap_or_default();
        format!(
            "scale={w}:{h}{flags}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,fps={},format=yuv420p",
            self.fps
        )
    }

    pub fn loudnorm_filter(&self) -> String {
        format!("loudnorm=I={}:LRA=11:TP=-1.5", self.lufs)
    }
}

/// Engine and prober settings.
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub target: NormalizationTarget,
    /// Relay stderr captures land here, one file per stream.
    pub relay_log_dir: Option<PathBuf>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            target: NormalizationTarget::default(),
            relay_log_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_filter() {
        let target = NormalizationTarget {
            width: 1280,
            height: 720,
            fps: 25,
            ..Default::default()
        };
        assert_eq!(
            target.video_filter(Some("lanczos")),
            "scale=1280:720:flags=lanczos:force_original_aspect_ratio=decrease,pad=1280:720:(ow-iw)/2:(oh-ih)/2,fps=25,format=yuv420p"
        );
        assert!(target.video_filter(None).starts_with("scale=1280:720:force_original"));
    }

    #[test]
    fn test_loudnorm_filter() {
        let target = NormalizationTarget::default();
        assert_eq!(target.loudnorm_filter(), "loudnorm=I=-16:LRA=11:TP=-1.5");
    }
}
