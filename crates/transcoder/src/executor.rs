use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use recast_core::{FailureReason, TranscodePlan};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ffprobe::{FfprobeProber, Prober};
use crate::supervise::{self, SuperviseError};
use crate::{HwAccel, TranscoderConfig, command};

/// stderr fragments ffmpeg prints when a hardware device cannot be used.
const HARDWARE_MARKERS: &[&str] = &[
    "Error initializing an internal MFX session",
    "No VA display found",
    "Failed to initialise VAAPI connection",
    "Cannot load libcuda",
    "Cannot load libnvidia-encode",
    "No NVENC capable devices found",
    "Device creation failed",
    "hwaccel initialisation returned error",
    "Error creating a MFX session",
];

/// How often encode progress is logged at info level.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodeFailureKind {
    HardwareUnavailable,
    EncodeError,
    Timeout,
    ValidationFailed,
    Spawn,
    Cancelled,
}

impl EncodeFailureKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::EncodeError | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {detail}")]
pub struct EncodeFailure {
    pub kind: EncodeFailureKind,
    pub retryable: bool,
    pub detail: String,
}

impl EncodeFailure {
    pub fn new(kind: EncodeFailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: kind.is_retryable(),
            detail: detail.into(),
        }
    }

    /// The failure reason to record, or `None` when the attempt was cancelled
    /// and the job should stay as it is.
    pub fn reason(&self) -> Option<FailureReason> {
        match self.kind {
            EncodeFailureKind::HardwareUnavailable => Some(FailureReason::HardwareUnavailable),
            EncodeFailureKind::EncodeError => Some(FailureReason::EncodeError),
            EncodeFailureKind::Timeout => Some(FailureReason::Timeout),
            EncodeFailureKind::ValidationFailed => Some(FailureReason::ValidationFailed),
            EncodeFailureKind::Spawn => Some(FailureReason::Io),
            EncodeFailureKind::Cancelled => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncodeOutcome {
    pub elapsed: Duration,
    pub accel: Option<HwAccel>,
    pub output_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Validation {
    pub output_bytes: u64,
    pub duration_secs: f64,
}

/// Runs encodes and checks their output.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Encode `input` into `output`. `output` is a temporary path in the
    /// job's working area.
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        plan: &TranscodePlan,
        source_duration_secs: f64,
        cancel: &CancellationToken,
    ) -> Result<EncodeOutcome, EncodeFailure>;

    /// Check that an encoded file is usable as a replacement.
    async fn validate(
        &self,
        output: &Path,
        source_duration_secs: f64,
    ) -> Result<Validation, EncodeFailure>;
}

/// [`Executor`] that shells out to ffmpeg.
pub struct FfmpegExecutor {
    config: TranscoderConfig,
    accel: Option<HwAccel>,
    prober: FfprobeProber,
}

impl FfmpegExecutor {
    pub fn new(config: TranscoderConfig, accel: Option<HwAccel>) -> Self {
        let prober = FfprobeProber::new(config.ffprobe_path.clone(), config.probe_timeout);
        Self {
            config,
            accel,
            prober,
        }
    }

    pub fn accel(&self) -> Option<HwAccel> {
        self.accel
    }
}

#[async_trait]
impl Executor for FfmpegExecutor {
    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        plan: &TranscodePlan,
        source_duration_secs: f64,
        cancel: &CancellationToken,
    ) -> Result<EncodeOutcome, EncodeFailure> {
        let accel = if plan.software_only { None } else { self.accel };
        let args = command::build_args(input, output, plan, accel)
            .map_err(|e| EncodeFailure::new(EncodeFailureKind::EncodeError, e.to_string()))?;

        info!(
            input = %input.display(),
            encoder = command::video_encoder(&plan.video_codec, accel).unwrap_or("unknown"),
            height = plan.target_height,
            quality = plan.quality,
            "starting encode"
        );
        debug!(args = %args.join(" "), "ffmpeg command");

        let mut progress = ProgressTracker::new(source_duration_secs);
        let result = supervise::run(
            &self.config.ffmpeg_path,
            &args,
            self.config.encode_timeout,
            cancel,
            |line| progress.feed(line),
        )
        .await;

        let finished = match result {
            Ok(finished) => finished,
            Err(SuperviseError::Spawn { program, source }) => {
                return Err(EncodeFailure::new(
                    EncodeFailureKind::Spawn,
                    format!("spawn {}: {source}", program.display()),
                ));
            }
            Err(SuperviseError::TimedOut { after, .. }) => {
                return Err(EncodeFailure::new(
                    EncodeFailureKind::Timeout,
                    format!("encode exceeded {}s", after.as_secs()),
                ));
            }
            Err(SuperviseError::Cancelled { .. }) => {
                return Err(EncodeFailure::new(
                    EncodeFailureKind::Cancelled,
                    "encode cancelled",
                ));
            }
            Err(SuperviseError::Io(e)) => {
                return Err(EncodeFailure::new(EncodeFailureKind::Spawn, e.to_string()));
            }
        };

        if !finished.status.success() {
            let stderr = finished.stderr_text();
            let kind = classify_stderr(&stderr);
            warn!(
                status = %finished.status,
                kind = ?kind,
                stderr = %last_lines(&stderr, 5),
                "ffmpeg failed"
            );
            return Err(EncodeFailure::new(
                kind,
                format!("ffmpeg exited with {}: {}", finished.status, last_lines(&stderr, 5)),
            ));
        }

        let output_bytes = tokio::fs::metadata(output)
            .await
            .map(|m| m.len())
            .map_err(|e| {
                EncodeFailure::new(
                    EncodeFailureKind::EncodeError,
                    format!("ffmpeg succeeded but {} is missing: {e}", output.display()),
                )
            })?;

        info!(
            output = %output.display(),
            output_bytes,
            elapsed_secs = finished.elapsed.as_secs(),
            "encode finished"
        );

        Ok(EncodeOutcome {
            elapsed: finished.elapsed,
            accel,
            output_bytes,
        })
    }

    async fn validate(
        &self,
        output: &Path,
        source_duration_secs: f64,
    ) -> Result<Validation, EncodeFailure> {
        let invalid = |detail: String| EncodeFailure::new(EncodeFailureKind::ValidationFailed, detail);

        let meta = tokio::fs::metadata(output)
            .await
            .map_err(|e| invalid(format!("{} unreadable: {e}", output.display())))?;
        if meta.len() < self.config.min_output_bytes {
            return Err(invalid(format!(
                "output is {} bytes, expected at least {}",
                meta.len(),
                self.config.min_output_bytes
            )));
        }

        let info = self
            .prober
            .probe(output)
            .await
            .map_err(|e| invalid(format!("output does not probe: {e}")))?;
        if info.video.is_none() {
            return Err(invalid("output has no video stream".into()));
        }

        check_duration(
            source_duration_secs,
            info.duration_secs,
            self.config.duration_tolerance_secs,
        )
        .map_err(invalid)?;

        Ok(Validation {
            output_bytes: meta.len(),
            duration_secs: info.duration_secs,
        })
    }
}

/// Map ffmpeg's stderr to a failure kind.
pub fn classify_stderr(stderr: &str) -> EncodeFailureKind {
    if HARDWARE_MARKERS.iter().any(|m| stderr.contains(m)) {
        EncodeFailureKind::HardwareUnavailable
    } else {
        EncodeFailureKind::EncodeError
    }
}

/// An unknown source duration (0) skips the check.
fn check_duration(source: f64, output: f64, tolerance: f64) -> Result<(), String> {
    if source <= 0.0 {
        return Ok(());
    }
    let drift = (source - output).abs();
    if drift > tolerance {
        return Err(format!(
            "output runs {output:.1}s, source {source:.1}s (tolerance {tolerance:.1}s)"
        ));
    }
    Ok(())
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join(" | ")
}

/// Accumulates `-progress` blocks and logs them at a throttled rate.
struct ProgressTracker {
    duration_secs: f64,
    out_time_us: Option<i64>,
    speed: Option<String>,
    last_log: Instant,
}

impl ProgressTracker {
    fn new(duration_secs: f64) -> Self {
        Self {
            duration_secs,
            out_time_us: None,
            speed: None,
            last_log: Instant::now(),
        }
    }

    fn feed(&mut self, line: &str) {
        if let Some(val) = line.strip_prefix("out_time_us=") {
            self.out_time_us = val.trim().parse().ok();
        } else if let Some(val) = line.strip_prefix("speed=") {
            let v = val.trim();
            if v != "N/A" {
                self.speed = Some(v.to_string());
            }
        } else if line.starts_with("progress=") {
            if let Some(pct) = self.percent() {
                if self.last_log.elapsed() >= PROGRESS_LOG_INTERVAL {
                    info!(
                        percent = (pct * 10.0).round() / 10.0,
                        speed = self.speed.as_deref().unwrap_or("?"),
                        "encode progress"
                    );
                    self.last_log = Instant::now();
                } else {
                    debug!(percent = (pct * 10.0).round() / 10.0, "encode progress");
                }
            }
        }
    }

    fn percent(&self) -> Option<f64> {
        let out_us = self.out_time_us?;
        if self.duration_secs <= 0.0 {
            return None;
        }
        let done = out_us as f64 / 1_000_000.0;
        Some((done / self.duration_secs * 100.0).clamp(0.0, 100.0))
    }
}
