#![allow(clippy::collapsible_if, clippy::redundant_closure)]
pub mod command;
pub mod decision;
pub mod executor;
pub mod ffprobe;
pub mod gpu;
pub mod supervise;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use decision::{Decision, Policy, SkipReason, TranscodeReason};
pub use executor::{EncodeFailure, EncodeFailureKind, Executor, FfmpegExecutor};
pub use ffprobe::{FfprobeProber, MediaInfo, Prober};

#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("ffmpeg/ffprobe not found at {0}")]
    BinaryNotFound(PathBuf),
    #[error("ffprobe failed: {0}")]
    ProbeFailed(String),
    #[error("ffprobe timed out after {0:?}")]
    ProbeTimedOut(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub encode_timeout: Duration,
    pub probe_timeout: Duration,
    /// Outputs smaller than this are rejected.
    pub min_output_bytes: u64,
    /// Allowed difference between source and output duration.
    pub duration_tolerance_secs: f64,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            encode_timeout: Duration::from_secs(6 * 3600),
            probe_timeout: Duration::from_secs(30),
            min_output_bytes: 1024 * 1024,
            duration_tolerance_secs: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwAccel {
    Nvenc,
    Vaapi,
    Qsv,
    VideoToolbox,
}

impl HwAccel {
    pub fn encoder(self) -> &'static str {
        match self {
            Self::Nvenc => "h264_nvenc",
            Self::Vaapi => "h264_vaapi",
            Self::Qsv => "h264_qsv",
            Self::VideoToolbox => "h264_videotoolbox",
        }
    }
}

impl std::fmt::Display for HwAccel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.encoder())
    }
}

/// How the encoder is chosen at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccelPreference {
    /// Use the best accelerator `ffmpeg -encoders` reports.
    #[default]
    Auto,
    /// Always encode with libx264.
    #[serde(alias = "none")]
    Software,
    Nvenc,
    Qsv,
    Vaapi,
    VideoToolbox,
}
