use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::TranscodeError;

/// Media information extracted via ffprobe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    pub container: String,
    pub duration_secs: f64,
    pub bitrate_kbps: Option<u32>,
    pub video: Option<VideoStream>,
    pub audio_streams: u32,
    pub subtitle_streams: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoStream {
    pub index: u32,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub pix_fmt: Option<String>,
    /// PQ/HLG transfer, mastering display metadata or Dolby Vision.
    pub hdr: bool,
    pub bitrate_kbps: Option<u32>,
}

/// Reads stream attributes from a media file.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, file: &Path) -> Result<MediaInfo, TranscodeError>;
}

/// [`Prober`] backed by the `ffprobe` binary.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe_path: PathBuf,
    timeout: Duration,
}

impl FfprobeProber {
    pub fn new(ffprobe_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Prober for FfprobeProber {
    async fn probe(&self, file: &Path) -> Result<MediaInfo, TranscodeError> {
        match tokio::time::timeout(self.timeout, probe(&self.ffprobe_path, file)).await {
            Ok(result) => result,
            Err(_) => Err(TranscodeError::ProbeTimedOut(self.timeout)),
        }
    }
}

/// Run ffprobe on a file and parse the JSON output.
pub async fn probe(ffprobe_path: &Path, file: &Path) -> Result<MediaInfo, TranscodeError> {
    let output = tokio::process::Command::new(ffprobe_path)
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(file)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                TranscodeError::BinaryNotFound(ffprobe_path.to_path_buf())
            }
            _ => TranscodeError::ProbeFailed(format!("spawn failed: {e}")),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TranscodeError::ProbeFailed(format!(
            "{}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let raw: serde_json::Value = serde_json::from_slice(&output.stdout)
        .map_err(|e| TranscodeError::ProbeFailed(format!("parse JSON: {e}")))?;

    parse_probe_output(&raw)
}

fn parse_probe_output(raw: &serde_json::Value) -> Result<MediaInfo, TranscodeError> {
    let format = raw
        .get("format")
        .ok_or_else(|| TranscodeError::ProbeFailed("missing 'format'".into()))?;

    let container = format
        .get("format_name")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let duration_secs: f64 = format
        .get("duration")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);

    let bitrate_kbps = format.get("bit_rate").and_then(parse_kbps);

    let streams = raw
        .get("streams")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut video = None;
    let mut audio_streams = 0;
    let mut subtitle_streams = 0;

    for s in &streams {
        let codec_type = s.get("codec_type").and_then(|v| v.as_str()).unwrap_or("");
        match codec_type {
            // Cover art shows up as a one-frame video stream
            "video" if video.is_none() && !is_attached_picture(s) => {
                video = Some(parse_video_stream(s));
            }
            "audio" => audio_streams += 1,
            "subtitle" => subtitle_streams += 1,
            _ => {}
        }
    }

    Ok(MediaInfo {
        container,
        duration_secs,
        bitrate_kbps,
        video,
        audio_streams,
        subtitle_streams,
    })
}

fn parse_video_stream(s: &serde_json::Value) -> VideoStream {
    let index = s.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    let codec = s
        .get("codec_name")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let width = s.get("width").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    let height = s.get("height").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    let pix_fmt = s
        .get("pix_fmt")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    VideoStream {
        index,
        codec,
        width,
        height,
        pix_fmt,
        hdr: has_hdr_metadata(s),
        bitrate_kbps: s.get("bit_rate").and_then(parse_kbps),
    }
}

fn has_hdr_metadata(s: &serde_json::Value) -> bool {
    let transfer = s
        .get("color_transfer")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if matches!(transfer, "smpte2084" | "arib-std-b67") {
        return true;
    }

    let side_data = s
        .get("side_data_list")
        .and_then(|v| v.as_array())
        .map(|list| list.as_slice())
        .unwrap_or_default();
    for item in side_data {
        let kind = item
            .get("side_data_type")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if matches!(
            kind,
            "Mastering display metadata"
                | "Content light level metadata"
                | "DOVI configuration record"
        ) {
            return true;
        }
    }

    s.get("tags")
        .map(|tags| tags.to_string().to_ascii_lowercase().contains("dolby"))
        .unwrap_or(false)
}

fn is_attached_picture(s: &serde_json::Value) -> bool {
    s.get("disposition")
        .and_then(|d| d.get("attached_pic"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0)
        == 1
}

fn parse_kbps(v: &serde_json::Value) -> Option<u32> {
    v.as_str()
        .and_then(|s| s.parse::<u64>().ok())
        .map(|b| (b / 1000) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_probe_json() {
        let json = serde_json::json!({
            "format": {
                "format_name": "matroska,webm",
                "duration": "7200.123",
                "bit_rate": "5000000"
            },
            "streams": [
                {
                    "index": 0,
                    "codec_type": "video",
                    "codec_name": "h264",
                    "width": 1920,
                    "height": 1080,
                    "pix_fmt": "yuv420p",
                    "disposition": { "default": 1, "attached_pic": 0 }
                },
                {
                    "index": 1,
                    "codec_type": "audio",
                    "codec_name": "aac",
                    "channels": 6
                },
                {
                    "index": 2,
                    "codec_type": "subtitle",
                    "codec_name": "subrip"
                },
                {
                    "index": 3,
                    "codec_type": "subtitle",
                    "codec_name": "hdmv_pgs_subtitle"
                }
            ]
        });

        let info = parse_probe_output(&json).unwrap();
        assert_eq!(info.container, "matroska,webm");
        assert!((info.duration_secs - 7200.123).abs() < 0.001);
        assert_eq!(info.bitrate_kbps, Some(5000));
        assert_eq!(info.audio_streams, 1);
        assert_eq!(info.subtitle_streams, 2);

        let v = info.video.unwrap();
        assert_eq!(v.codec, "h264");
        assert_eq!(v.width, 1920);
        assert_eq!(v.height, 1080);
        assert_eq!(v.pix_fmt.as_deref(), Some("yuv420p"));
        assert!(!v.hdr);
    }

    #[test]
    fn hdr_is_detected_from_transfer_or_side_data() {
        let pq = serde_json::json!({
            "codec_type": "video",
            "codec_name": "hevc",
            "color_transfer": "smpte2084"
        });
        assert!(parse_video_stream(&pq).hdr);

        let mastering = serde_json::json!({
            "codec_type": "video",
            "codec_name": "hevc",
            "side_data_list": [{ "side_data_type": "Mastering display metadata" }]
        });
        assert!(parse_video_stream(&mastering).hdr);

        let sdr = serde_json::json!({
            "codec_type": "video",
            "codec_name": "hevc",
            "color_transfer": "bt709"
        });
        assert!(!parse_video_stream(&sdr).hdr);
    }

    #[test]
    fn cover_art_is_not_the_video_stream() {
        let json = serde_json::json!({
            "format": { "format_name": "mov,mp4,m4a,3gp,3g2,mj2", "duration": "60.0" },
            "streams": [
                {
                    "index": 0,
                    "codec_type": "video",
                    "codec_name": "mjpeg",
                    "width": 600,
                    "height": 600,
                    "disposition": { "attached_pic": 1 }
                },
                { "index": 1, "codec_type": "audio", "codec_name": "aac" }
            ]
        });
        let info = parse_probe_output(&json).unwrap();
        assert!(info.video.is_none());
        assert_eq!(info.audio_streams, 1);
    }

    #[test]
    fn missing_format_is_an_error() {
        let json = serde_json::json!({ "streams": [] });
        assert!(parse_probe_output(&json).is_err());
    }
}
