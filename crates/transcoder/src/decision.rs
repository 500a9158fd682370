use std::path::Path;
use std::sync::LazyLock;

use recast_core::{MediaFile, TranscodePlan};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// What the library should look like after processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub target_height: u32,
    /// Video codecs that do not need re-encoding when the height is fine.
    pub allowed_codecs: Vec<String>,
    pub target_codec: String,
    pub target_container: String,
    pub audio_codec: String,
    pub audio_bitrate_kbps: u32,
    /// CRF-style quality value, lower is better.
    pub quality: u8,
    pub preset: String,
    pub subtitle_codec: String,
    /// Files below this overall bitrate are not worth re-encoding.
    pub min_bitrate_kbps: Option<u32>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            target_height: 1080,
            allowed_codecs: vec!["h264".into(), "hevc".into()],
            target_codec: "h264".into(),
            target_container: "mp4".into(),
            audio_codec: "aac".into(),
            audio_bitrate_kbps: 128,
            quality: 23,
            preset: "medium".into(),
            subtitle_codec: "mov_text".into(),
            min_bitrate_kbps: Some(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    NoVideoStream,
    AlreadyCompliant,
    BitrateBelowFloor { bitrate_kbps: u32, floor_kbps: u32 },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoVideoStream => f.write_str("no video stream"),
            Self::AlreadyCompliant => f.write_str("already compliant"),
            Self::BitrateBelowFloor {
                bitrate_kbps,
                floor_kbps,
            } => write!(f, "bitrate {bitrate_kbps} kbps below {floor_kbps} kbps"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranscodeReason {
    ResolutionAboveTarget { height: u32, target: u32 },
    CodecNotAllowed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Skip(SkipReason),
    Transcode(TranscodePlan, Vec<TranscodeReason>),
}

impl Decision {
    pub fn is_transcode(&self) -> bool {
        matches!(self, Self::Transcode(..))
    }
}

/// Decide whether a file needs re-encoding and with which parameters.
pub fn decide(media: &MediaFile, policy: &Policy) -> Decision {
    let Some(codec) = media.video_codec.as_deref() else {
        return Decision::Skip(SkipReason::NoVideoStream);
    };

    let mut reasons = Vec::new();

    if media.height > policy.target_height {
        reasons.push(TranscodeReason::ResolutionAboveTarget {
            height: media.height,
            target: policy.target_height,
        });
    }

    let codec_ok = policy
        .allowed_codecs
        .iter()
        .any(|c| c.eq_ignore_ascii_case(codec));
    if !codec_ok {
        reasons.push(TranscodeReason::CodecNotAllowed(codec.to_string()));
    }

    if reasons.is_empty() {
        return Decision::Skip(SkipReason::AlreadyCompliant);
    }

    if let (Some(floor), Some(bitrate)) = (policy.min_bitrate_kbps, media.bitrate_kbps) {
        if bitrate < floor {
            return Decision::Skip(SkipReason::BitrateBelowFloor {
                bitrate_kbps: bitrate,
                floor_kbps: floor,
            });
        }
    }

    let plan = TranscodePlan {
        target_height: policy.target_height.min(media.height.max(1)),
        video_codec: policy.target_codec.clone(),
        container: policy.target_container.clone(),
        audio_codec: policy.audio_codec.clone(),
        audio_bitrate_kbps: policy.audio_bitrate_kbps,
        quality: policy.quality,
        preset: policy.preset.clone(),
        subtitle_codec: policy.subtitle_codec.clone(),
        // QSV cannot reliably open HDR or 10-bit surfaces
        software_only: media.hdr || media.is_high_bit_depth(),
    };

    Decision::Transcode(plan, reasons)
}

static QUALITY_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[._ ](?:2160p|4k|uhd|1440p|1080p|720p|480p)\b").unwrap()
});

/// Final library file name for an encoded source:
/// `Show.S01E01.2160p.mkv` becomes `Show.S01E01.1080p.mp4`.
pub fn output_file_name(source: &Path, plan: &TranscodePlan) -> String {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let stripped = QUALITY_TOKEN.replace_all(&stem, "");
    let base = stripped.trim_end_matches(['.', '_', ' ', '-']);
    let base = if base.is_empty() { "video" } else { base };

    format!("{base}.{}p.{}", plan.target_height, plan.container)
}
