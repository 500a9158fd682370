use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::media::{Fingerprint, MediaFile, TranscodePlan};
use crate::types::{FailureReason, JobState, MediaKind};

/// The unit of work for one fingerprint, as persisted in the job store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub fingerprint: Fingerprint,
    pub source_path: PathBuf,
    pub library_root: PathBuf,
    pub kind: MediaKind,
    pub state: JobState,
    /// Token of the worker currently driving the job. Every write from a
    /// worker must present it.
    pub claim_id: Option<String>,
    pub failure_reason: Option<FailureReason>,
    pub attempts: u32,
    pub created_at: i64,
    pub updated_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    /// Earliest time a worker may claim the job again.
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    /// Set when the file was replaced but the catalogue could not be updated.
    pub sync_error: Option<String>,
    pub output_path: Option<PathBuf>,
    pub size_before: u64,
    pub size_after: Option<u64>,
    pub plan: TranscodePlan,
    /// Source duration at scan time, used to validate the output.
    pub source_duration_secs: f64,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn completed_with_warning(&self) -> bool {
        self.state == JobState::Completed && self.sync_error.is_some()
    }

    pub fn bytes_saved(&self) -> i64 {
        match self.size_after {
            Some(after) => self.size_before as i64 - after as i64,
            None => 0,
        }
    }

    pub fn source_extension(&self) -> &str {
        self.source_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("bin")
    }
}

/// Everything needed to create a job record for a discovered file.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub fingerprint: Fingerprint,
    pub source_path: PathBuf,
    pub library_root: PathBuf,
    pub kind: MediaKind,
    pub size_before: u64,
    pub source_duration_secs: f64,
    pub plan: TranscodePlan,
}

impl NewJob {
    pub fn discovered(media: &MediaFile, plan: TranscodePlan) -> Self {
        Self {
            fingerprint: media.fingerprint.clone(),
            source_path: media.path.clone(),
            library_root: media.library_root.clone(),
            kind: media.kind,
            size_before: media.size_bytes,
            source_duration_secs: media.duration_secs,
            plan,
        }
    }
}
