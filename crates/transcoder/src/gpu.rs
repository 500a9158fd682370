//! GPU hardware acceleration detection.
//!
//! Probes for available encoders by running `ffmpeg -encoders`, then confirms
//! the chosen one can actually open a device with a tiny test encode.

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::{AccelPreference, HwAccel};

/// Detected GPU capabilities.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct GpuCapabilities {
    pub nvenc: bool,
    pub vaapi: bool,
    pub qsv: bool,
    pub videotoolbox: bool,
}

impl GpuCapabilities {
    /// Pick the best available HW accelerator, or None for CPU.
    pub fn best(&self) -> Option<HwAccel> {
        if self.qsv {
            Some(HwAccel::Qsv)
        } else if self.nvenc {
            Some(HwAccel::Nvenc)
        } else if self.vaapi {
            Some(HwAccel::Vaapi)
        } else if self.videotoolbox {
            Some(HwAccel::VideoToolbox)
        } else {
            None
        }
    }

    pub fn supports(&self, accel: HwAccel) -> bool {
        match accel {
            HwAccel::Nvenc => self.nvenc,
            HwAccel::Vaapi => self.vaapi,
            HwAccel::Qsv => self.qsv,
            HwAccel::VideoToolbox => self.videotoolbox,
        }
    }

    /// Resolve a configured preference against what ffmpeg offers.
    pub fn select(&self, preference: AccelPreference) -> Option<HwAccel> {
        let wanted = match preference {
            AccelPreference::Auto => return self.best(),
            AccelPreference::Software => return None,
            AccelPreference::Nvenc => HwAccel::Nvenc,
            AccelPreference::Qsv => HwAccel::Qsv,
            AccelPreference::Vaapi => HwAccel::Vaapi,
            AccelPreference::VideoToolbox => HwAccel::VideoToolbox,
        };
        if self.supports(wanted) {
            Some(wanted)
        } else {
            warn!(accel = %wanted, "configured encoder not offered by ffmpeg, using software");
            None
        }
    }
}

/// Detect available hardware encoders by querying ffmpeg.
pub async fn detect(ffmpeg_path: &Path) -> GpuCapabilities {
    let encoders = match get_encoders(ffmpeg_path).await {
        Ok(s) => s,
        Err(e) => {
            info!(error = %e, "could not query ffmpeg encoders, assuming CPU-only");
            return GpuCapabilities::default();
        }
    };

    let caps = parse_encoders(&encoders);
    info!(?caps, "GPU encoder detection complete");
    caps
}

fn parse_encoders(listing: &str) -> GpuCapabilities {
    GpuCapabilities {
        nvenc: listing.contains("h264_nvenc"),
        vaapi: listing.contains("h264_vaapi") && vaapi_device_exists(),
        qsv: listing.contains("h264_qsv"),
        videotoolbox: listing.contains("h264_videotoolbox"),
    }
}

async fn get_encoders(ffmpeg_path: &Path) -> Result<String, String> {
    let output = tokio::process::Command::new(ffmpeg_path)
        .args(["-hide_banner", "-encoders"])
        .output()
        .await
        .map_err(|e| format!("spawn ffmpeg: {e}"))?;

    if !output.status.success() {
        return Err("ffmpeg -encoders failed".into());
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Encode a fraction of a second of generated video to confirm the device
/// opens. Listing an encoder does not mean the hardware is there.
pub async fn verify(ffmpeg_path: &Path, accel: HwAccel) -> bool {
    let mut cmd = tokio::process::Command::new(ffmpeg_path);
    cmd.args(["-hide_banner", "-loglevel", "error"]);
    if accel == HwAccel::Vaapi {
        cmd.args(["-vaapi_device", VAAPI_DEVICE]);
    }
    cmd.args(["-f", "lavfi", "-i", "testsrc=duration=0.1:size=1280x720:rate=1"]);
    if accel == HwAccel::Vaapi {
        cmd.args(["-vf", "format=nv12,hwupload"]);
    }
    cmd.args(["-c:v", accel.encoder(), "-f", "null", "-"]);
    cmd.kill_on_drop(true);

    match tokio::time::timeout(Duration::from_secs(20), cmd.output()).await {
        Ok(Ok(output)) if output.status.success() => {
            info!(accel = %accel, "hardware encoder verified");
            true
        }
        Ok(Ok(output)) => {
            warn!(
                accel = %accel,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "hardware encoder test failed, using software"
            );
            false
        }
        Ok(Err(e)) => {
            warn!(accel = %accel, error = %e, "could not run hardware encoder test");
            false
        }
        Err(_) => {
            warn!(accel = %accel, "hardware encoder test timed out");
            false
        }
    }
}

pub(crate) const VAAPI_DEVICE: &str = "/dev/dri/renderD128";

/// Check if a VAAPI device exists (Linux).
pub fn vaapi_device_exists() -> bool {
    Path::new(VAAPI_DEVICE).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_accelerator_preference() {
        let caps = GpuCapabilities {
            nvenc: true,
            vaapi: true,
            qsv: false,
            videotoolbox: false,
        };
        assert_eq!(caps.best(), Some(HwAccel::Nvenc));

        let caps = GpuCapabilities {
            nvenc: true,
            vaapi: true,
            qsv: true,
            videotoolbox: false,
        };
        assert_eq!(caps.best(), Some(HwAccel::Qsv));

        let caps = GpuCapabilities {
            vaapi: true,
            ..Default::default()
        };
        assert_eq!(caps.best(), Some(HwAccel::Vaapi));

        assert!(GpuCapabilities::default().best().is_none());
    }

    #[test]
    fn preference_overrides_detection() {
        let caps = GpuCapabilities {
            nvenc: true,
            qsv: true,
            ..Default::default()
        };
        assert_eq!(caps.select(AccelPreference::Auto), Some(HwAccel::Qsv));
        assert_eq!(caps.select(AccelPreference::Nvenc), Some(HwAccel::Nvenc));
        assert_eq!(caps.select(AccelPreference::Software), None);
        assert_eq!(caps.select(AccelPreference::VideoToolbox), None);
    }

    #[test]
    fn encoder_listing_is_parsed() {
        let listing = " V....D h264_nvenc           NVIDIA NVENC H.264 encoder\n \
                        V....D h264_qsv             H.264 (Intel Quick Sync Video acceleration)\n \
                        V....D libx264              libx264 H.264";
        let caps = parse_encoders(listing);
        assert!(caps.nvenc);
        assert!(caps.qsv);
        assert!(!caps.videotoolbox);
    }

    #[tokio::test]
    async fn missing_ffmpeg_means_cpu_only() {
        let caps = detect(Path::new("/nonexistent/ffmpeg-xyz")).await;
        assert!(caps.best().is_none());
        assert!(!verify(Path::new("/nonexistent/ffmpeg-xyz"), HwAccel::Qsv).await);
    }
}
