use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::Stream;
use recast_core::{Fingerprint, MediaFile, MediaKind};
use recast_db::StoreError;
use recast_db::repo::jobs;
use recast_transcoder::{MediaInfo, Prober};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::walk::{self, MediaEntry};

/// A library directory and the catalogue that owns its files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryRoot {
    pub path: PathBuf,
    pub kind: MediaKind,
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub roots: Vec<LibraryRoot>,
    /// Files modified more recently than this are left alone.
    pub min_age: Duration,
    /// Working and archive areas, never scanned even when inside a root.
    pub exclude: Vec<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("job store error: {0}")]
    Store(#[from] StoreError),
    #[error("walk task failed: {0}")]
    Walk(String),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanCounts {
    pub seen: usize,
    pub too_young: usize,
    pub known: usize,
    pub probe_failed: usize,
    pub yielded: usize,
}

/// Enumerates library files that have no job yet.
pub struct Scanner {
    pool: SqlitePool,
    prober: Arc<dyn Prober>,
    config: ScannerConfig,
}

impl Scanner {
    pub fn new(pool: SqlitePool, prober: Arc<dyn Prober>, mut config: ScannerConfig) -> Self {
        config.roots.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            pool,
            prober,
            config,
        }
    }

    pub fn roots(&self) -> &[LibraryRoot] {
        &self.config.roots
    }

    /// Lazily yield probed files in path order.
    ///
    /// Paths at or before `resume_after` are skipped, so an interrupted scan
    /// can pick up where it stopped. Fingerprints with any recorded job are
    /// skipped. Unreadable or unprobeable files are logged and skipped.
    pub fn scan(
        &self,
        resume_after: Option<PathBuf>,
    ) -> impl Stream<Item = Result<MediaFile, ScanError>> + '_ {
        stream! {
            let mut counts = ScanCounts::default();
            let cutoff = chrono::Utc::now().timestamp() - self.config.min_age.as_secs() as i64;

            for root in &self.config.roots {
                if !root.path.is_dir() {
                    warn!(path = %root.path.display(), "library path does not exist, skipping");
                    continue;
                }

                let entries = match self.walk_root(&root.path).await {
                    Ok(entries) => entries,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };
                info!(
                    path = %root.path.display(),
                    kind = %root.kind,
                    files_found = entries.len(),
                    "scan found video files"
                );

                for entry in entries {
                    if let Some(cursor) = resume_after.as_deref() {
                        if entry.path.as_path() <= cursor {
                            continue;
                        }
                    }
                    counts.seen += 1;

                    if entry.mtime_ts > cutoff {
                        debug!(path = %entry.path.display(), "skipping recently modified file");
                        counts.too_young += 1;
                        continue;
                    }

                    let fingerprint =
                        Fingerprint::compute(&entry.path, entry.size_bytes, entry.mtime_ts);
                    match jobs::find_by_fingerprint(&self.pool, &fingerprint).await {
                        Ok(Some(job)) => {
                            debug!(
                                path = %entry.path.display(),
                                state = %job.state,
                                "fingerprint already has a job"
                            );
                            counts.known += 1;
                            continue;
                        }
                        Ok(None) => {}
                        Err(e) => {
                            yield Err(ScanError::Store(e));
                            return;
                        }
                    }

                    let info = match self.prober.probe(&entry.path).await {
                        Ok(info) => info,
                        Err(e) => {
                            warn!(path = %entry.path.display(), error = %e, "probe failed, skipping");
                            counts.probe_failed += 1;
                            continue;
                        }
                    };

                    counts.yielded += 1;
                    yield Ok(media_file(root, entry, fingerprint, info));
                }
            }

            info!(
                seen = counts.seen,
                too_young = counts.too_young,
                known = counts.known,
                probe_failed = counts.probe_failed,
                candidates = counts.yielded,
                "scan complete"
            );
        }
    }

    async fn walk_root(&self, root: &Path) -> Result<Vec<MediaEntry>, ScanError> {
        let root = root.to_path_buf();
        let exclude = self.config.exclude.clone();
        tokio::task::spawn_blocking(move || walk::walk_media_dir(&root, &exclude))
            .await
            .map_err(|e| ScanError::Walk(e.to_string()))
    }
}

fn media_file(
    root: &LibraryRoot,
    entry: MediaEntry,
    fingerprint: Fingerprint,
    info: MediaInfo,
) -> MediaFile {
    let video = info.video.as_ref();
    MediaFile {
        path: entry.path,
        library_root: root.path.clone(),
        kind: root.kind,
        container: info.container.clone(),
        video_codec: video.map(|v| v.codec.clone()),
        width: video.map(|v| v.width).unwrap_or(0),
        height: video.map(|v| v.height).unwrap_or(0),
        pix_fmt: video.and_then(|v| v.pix_fmt.clone()),
        hdr: video.is_some_and(|v| v.hdr),
        duration_secs: info.duration_secs,
        bitrate_kbps: info.bitrate_kbps.or_else(|| video.and_then(|v| v.bitrate_kbps)),
        size_bytes: entry.size_bytes,
        mtime_ts: entry.mtime_ts,
        fingerprint,
    }
}
