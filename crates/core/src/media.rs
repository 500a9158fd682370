use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::MediaKind;

/// Stable identity of a library entry, derived from its path, size and
/// modification time. Not a content hash: touching or resizing the file
/// yields a new fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn compute(path: &Path, size_bytes: u64, mtime_ts: i64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(size_bytes.to_le_bytes());
        hasher.update([0u8]);
        hasher.update(mtime_ts.to_le_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap a value read back from storage.
    pub fn from_stored(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Probed attributes of a library file, taken at scan time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFile {
    pub path: PathBuf,
    pub library_root: PathBuf,
    pub kind: MediaKind,
    pub container: String,
    /// `None` when the file has no video stream.
    pub video_codec: Option<String>,
    pub width: u32,
    pub height: u32,
    pub pix_fmt: Option<String>,
    pub hdr: bool,
    pub duration_secs: f64,
    pub bitrate_kbps: Option<u32>,
    pub size_bytes: u64,
    pub mtime_ts: i64,
    pub fingerprint: Fingerprint,
}

impl MediaFile {
    /// 10-bit pixel formats (`yuv420p10le`, `p010le`, ...).
    pub fn is_high_bit_depth(&self) -> bool {
        self.pix_fmt
            .as_deref()
            .is_some_and(|fmt| fmt.contains("10") || fmt.contains("12"))
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Target parameters for one encode, chosen by the policy engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodePlan {
    pub target_height: u32,
    pub video_codec: String,
    pub container: String,
    pub audio_codec: String,
    pub audio_bitrate_kbps: u32,
    pub quality: u8,
    pub preset: String,
    pub subtitle_codec: String,
    /// Skip hardware acceleration for this encode.
    #[serde(default)]
    pub software_only: bool,
}

impl TranscodePlan {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}
