pub mod arr;
pub mod library;
pub mod retry;

use std::path::{Path, PathBuf};

use recast_core::MediaKind;
use thiserror::Error;

pub use arr::{ArrConfig, RadarrClient, SonarrClient};
pub use library::{LibrarySync, SyncReport};
pub use retry::SyncRetry;

#[derive(Error, Debug)]
pub enum SyncError {
    /// 4xx: bad request or a stale id. Retrying will not help.
    #[error("request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    /// 5xx, timeouts and connection failures.
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("no library service configured for {0} files")]
    NotConfigured(MediaKind),
    #[error("no catalogue entry for {}", .0.display())]
    NotFound(PathBuf),
    #[error("unexpected response: {0}")]
    Decode(String),
    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Where a library file lives in an external catalogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryReference {
    /// Series id (Sonarr) or movie id (Radarr).
    pub library_id: i64,
    /// Episode-file or movie-file id.
    pub file_id: i64,
    /// Path of the file relative to the series or movie folder.
    pub relative_path: String,
}

/// One external catalogue, selected by the kind of file it owns.
#[async_trait::async_trait]
pub trait LibraryService: Send + Sync {
    fn kind(&self) -> MediaKind;

    /// Check that the service is reachable and accepts our credentials.
    async fn ping(&self) -> Result<(), SyncError>;

    /// Find the catalogue entry whose file is `path`.
    async fn lookup(&self, path: &Path) -> Result<Option<LibraryReference>, SyncError>;

    async fn update_file_reference(
        &self,
        file_id: i64,
        new_relative_path: &str,
    ) -> Result<(), SyncError>;

    async fn trigger_rescan(&self, library_id: i64) -> Result<(), SyncError>;
}
