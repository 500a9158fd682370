//! Working areas and the library swap.
//!
//! The original library file is only removed after the validated output has
//! been written next to it under a hidden name, synced and renamed over the
//! final path. Every step of [`FileManager::replace`] checks its
//! precondition, so an interrupted replace can simply be run again.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use recast_core::{FailureReason, Job};
use recast_transcoder::decision::output_file_name;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::disk::{self, SpaceProbe};

/// What happens to the original after a successful replace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Retention {
    /// Keep the original in the archive directory.
    #[default]
    Archive,
    Delete,
}

#[derive(Debug, Error)]
pub enum FileError {
    #[error("need {needed} bytes free in the working area, {available} available")]
    InsufficientSpace { needed: u64, available: u64 },
    #[error("source file {} is missing", .0.display())]
    SourceMissing(PathBuf),
    #[error("source file {} changed size: expected {expected}, found {actual}", path.display())]
    SourceChanged {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("validated output {} is gone and the replacement is not in place", .0.display())]
    OutputMissing(PathBuf),
    #[error("{} already exists and was not written by this job", .0.display())]
    TargetExists(PathBuf),
    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FileError {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::InsufficientSpace { .. } => FailureReason::InsufficientSpace,
            Self::SourceMissing(_) | Self::SourceChanged { .. } => FailureReason::SourceMissing,
            Self::OutputMissing(_) | Self::Io { .. } => FailureReason::Io,
            Self::TargetExists(_) => FailureReason::TargetExists,
        }
    }
}

/// A replace that stopped part way.
#[derive(Debug, Error)]
pub enum ReplaceError {
    /// The library still holds the original.
    #[error("replace failed before the swap: {0}")]
    BeforeCommit(FileError),
    /// The replacement is in place; only clean-up is outstanding.
    #[error("clean-up after the swap failed: {0}")]
    AfterCommit(FileError),
}

fn io<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> FileError + 'a {
    move |source| FileError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// Paths owned by one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkArea {
    pub dir: PathBuf,
    /// Working copy of the library file.
    pub source: PathBuf,
    /// Encoder output.
    pub output: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replaced {
    pub final_path: PathBuf,
    pub size_after: u64,
    pub archived: Option<PathBuf>,
}

#[derive(Clone)]
pub struct FileManager {
    work_dir: PathBuf,
    archive_dir: PathBuf,
    retention: Retention,
    space_margin: f64,
    space: Arc<dyn SpaceProbe>,
}

impl FileManager {
    pub fn new(
        work_dir: PathBuf,
        archive_dir: PathBuf,
        retention: Retention,
        space_margin: f64,
        space: Arc<dyn SpaceProbe>,
    ) -> Self {
        Self {
            work_dir,
            archive_dir,
            retention,
            space_margin,
            space,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    pub fn work_area(&self, job: &Job) -> WorkArea {
        let dir = self.work_dir.join(&job.id);
        WorkArea {
            source: dir.join(format!("source.{}", job.source_extension())),
            output: dir.join(format!("output.{}", job.plan.container)),
            dir,
        }
    }

    /// Where the replacement ends up in the library.
    pub fn final_path(&self, job: &Job) -> PathBuf {
        let name = output_file_name(&job.source_path, &job.plan);
        match job.source_path.parent() {
            Some(parent) => parent.join(name),
            None => PathBuf::from(name),
        }
    }

    fn archive_path(&self, job: &Job) -> PathBuf {
        let name = job
            .source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("source.{}", job.source_extension()));
        self.archive_dir.join(format!("{}-{}", job.id, name))
    }

    /// Fails with `TargetExists` when the replacement would land on some
    /// other file in the library.
    pub async fn check_target(&self, job: &Job) -> Result<(), FileError> {
        let final_path = self.final_path(job);
        if final_path != job.source_path && file_len(&final_path).await.is_some() {
            return Err(FileError::TargetExists(final_path));
        }
        Ok(())
    }

    /// Set up a fresh working area and copy the library file into it.
    ///
    /// Fails with `InsufficientSpace` before anything is copied when the
    /// working area cannot hold the source plus the encode.
    pub async fn prepare(&self, job: &Job) -> Result<WorkArea, FileError> {
        self.check_target(job).await?;
        let meta = match tokio::fs::metadata(&job.source_path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FileError::SourceMissing(job.source_path.clone()));
            }
            Err(e) => return Err(io("stat", &job.source_path)(e)),
        };
        if meta.len() != job.size_before {
            return Err(FileError::SourceChanged {
                path: job.source_path.clone(),
                expected: job.size_before,
                actual: meta.len(),
            });
        }

        let area = self.work_area(job);
        if tokio::fs::try_exists(&area.dir).await.unwrap_or(false) {
            debug!(job_id = %job.id, dir = %area.dir.display(), "removing leftovers of an earlier attempt");
            tokio::fs::remove_dir_all(&area.dir)
                .await
                .map_err(io("remove", &area.dir))?;
        }
        tokio::fs::create_dir_all(&area.dir)
            .await
            .map_err(io("create", &area.dir))?;

        let available = self.space.available_bytes(&area.dir);
        if !disk::has_room(available, job.size_before, self.space_margin) {
            if let Err(e) = tokio::fs::remove_dir_all(&area.dir).await {
                warn!(job_id = %job.id, dir = %area.dir.display(), error = %e, "cannot remove working area");
            }
            return Err(FileError::InsufficientSpace {
                needed: (job.size_before as f64 * self.space_margin) as u64,
                available: available.unwrap_or(0),
            });
        }

        let copied = tokio::fs::copy(&job.source_path, &area.source)
            .await
            .map_err(io("copy", &job.source_path))?;
        if copied != job.size_before {
            return Err(FileError::SourceChanged {
                path: job.source_path.clone(),
                expected: job.size_before,
                actual: copied,
            });
        }

        debug!(job_id = %job.id, bytes = copied, "working copy ready");
        Ok(area)
    }

    /// Swap the validated output into the library.
    ///
    /// 1. copy the output next to the final path as a hidden `.partial`,
    ///    fsync it and rename it over the final path (the commit)
    /// 2. drop the encoder output
    /// 3. archive or drop the working copy of the original
    /// 4. remove the original library file when the name changed
    /// 5. remove the working area
    ///
    /// A file already at the final path only counts as this job's
    /// replacement when its size matches the validated output recorded in
    /// `job.size_after`; anything else there is left alone.
    pub async fn replace(&self, job: &Job, area: &WorkArea) -> Result<Replaced, ReplaceError> {
        let final_path = self.final_path(job);
        let renamed = final_path != job.source_path;
        let in_place = file_len(&final_path).await;

        if let Some(output_len) = file_len(&area.output).await {
            if renamed && in_place.is_some_and(|len| len != output_len) {
                return Err(ReplaceError::BeforeCommit(FileError::TargetExists(final_path)));
            }
            self.commit(&area.output, &final_path)
                .await
                .map_err(ReplaceError::BeforeCommit)?;
            tokio::fs::remove_file(&area.output)
                .await
                .map_err(io("remove", &area.output))
                .map_err(ReplaceError::AfterCommit)?;
        } else {
            match in_place {
                Some(len) if job.size_after == Some(len) => {
                    debug!(job_id = %job.id, path = %final_path.display(), "replacement already in place");
                }
                Some(_) if renamed => {
                    return Err(ReplaceError::BeforeCommit(FileError::TargetExists(final_path)));
                }
                _ => {
                    return Err(ReplaceError::BeforeCommit(FileError::OutputMissing(
                        area.output.clone(),
                    )));
                }
            }
        }

        self.finish(job, area, &final_path)
            .await
            .map_err(ReplaceError::AfterCommit)
    }

    async fn commit(&self, output: &Path, final_path: &Path) -> Result<(), FileError> {
        let partial = partial_path(final_path);
        tokio::fs::copy(output, &partial)
            .await
            .map_err(io("copy", output))?;
        let file = tokio::fs::File::open(&partial)
            .await
            .map_err(io("open", &partial))?;
        file.sync_all().await.map_err(io("fsync", &partial))?;
        drop(file);

        tokio::fs::rename(&partial, final_path)
            .await
            .map_err(io("rename", &partial))?;
        if let Some(dir) = final_path.parent() {
            sync_dir(dir).await;
        }
        info!(path = %final_path.display(), "replacement in place");
        Ok(())
    }

    async fn finish(
        &self,
        job: &Job,
        area: &WorkArea,
        final_path: &Path,
    ) -> Result<Replaced, FileError> {
        let mut archived = None;
        if self.retention == Retention::Archive {
            let target = self.archive_path(job);
            if tokio::fs::try_exists(&area.source).await.unwrap_or(false) {
                tokio::fs::create_dir_all(&self.archive_dir)
                    .await
                    .map_err(io("create", &self.archive_dir))?;
                move_file(&area.source, &target).await?;
                debug!(job_id = %job.id, archive = %target.display(), "original archived");
            }
            if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                archived = Some(target);
            }
        }

        if job.source_path != final_path
            && tokio::fs::try_exists(&job.source_path).await.unwrap_or(false)
        {
            tokio::fs::remove_file(&job.source_path)
                .await
                .map_err(io("remove", &job.source_path))?;
        }

        if tokio::fs::try_exists(&area.dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&area.dir)
                .await
                .map_err(io("remove", &area.dir))?;
        }

        let size_after = tokio::fs::metadata(final_path)
            .await
            .map_err(io("stat", final_path))?
            .len();

        Ok(Replaced {
            final_path: final_path.to_path_buf(),
            size_after,
            archived,
        })
    }

    /// Remove a job's working area. The library is never touched.
    pub async fn discard(&self, job_id: &str) -> Result<(), FileError> {
        let dir = self.work_dir.join(job_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io("remove", &dir)(e)),
        }
    }

    /// Remove working areas that belong to no active job.
    pub async fn sweep_orphans(&self, active_ids: &HashSet<String>) -> Result<usize, FileError> {
        let mut entries = match tokio::fs::read_dir(&self.work_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io("read", &self.work_dir)(e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io("read", &self.work_dir))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if active_ids.contains(&name) {
                continue;
            }
            let path = entry.path();
            let result = if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match result {
                Ok(()) => {
                    info!(path = %path.display(), "removed orphaned working area");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "cannot remove orphaned working area"),
            }
        }
        Ok(removed)
    }
}

async fn file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
}

/// `dir/.name.partial` for `dir/name`.
pub fn partial_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!(".{name}.partial"))
}

/// Rename, falling back to copy and delete across filesystems.
async fn move_file(from: &Path, to: &Path) -> Result<(), FileError> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await.map_err(io("copy", from))?;
    tokio::fs::remove_file(from)
        .await
        .map_err(io("remove", from))
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) {
    match tokio::fs::File::open(dir).await {
        Ok(handle) => {
            if let Err(e) = handle.sync_all().await {
                debug!(dir = %dir.display(), error = %e, "directory fsync failed");
            }
        }
        Err(e) => debug!(dir = %dir.display(), error = %e, "cannot open directory for fsync"),
    }
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) {}
