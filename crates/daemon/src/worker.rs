//! Drives one claimed job through encode, validation, replace and sync.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use recast_core::{FailureReason, Job, JobState, RetryBudget, StageError};
use recast_db::StoreError;
use recast_db::repo::jobs::{self, JobUpdate};
use recast_sync::{LibrarySync, SyncError};
use recast_transcoder::Executor;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::files::{FileManager, ReplaceError, WorkArea};

pub struct Worker {
    pool: SqlitePool,
    executor: Arc<dyn Executor>,
    files: FileManager,
    sync: LibrarySync,
    budget: RetryBudget,
    heartbeat_every: Duration,
}

impl Worker {
    pub fn new(
        pool: SqlitePool,
        executor: Arc<dyn Executor>,
        files: FileManager,
        sync: LibrarySync,
        budget: RetryBudget,
        heartbeat_every: Duration,
    ) -> Self {
        Self {
            pool,
            executor,
            files,
            sync,
            budget,
            heartbeat_every,
        }
    }

    pub fn files(&self) -> &FileManager {
        &self.files
    }

    /// Drive a job claimed by `claim_next` (state `Transcoding`) as far as
    /// it goes.
    ///
    /// Returns the job as last written. When `abort` fires mid-encode the
    /// record is left in flight for `reclaim_stale`. Every write presents the
    /// job's claim, so a worker whose job was reclaimed gets `Conflict` and
    /// its encode is stopped at the next heartbeat.
    pub async fn drive(&self, job: Job, abort: &CancellationToken) -> Result<Job, StoreError> {
        info!(
            job_id = %job.id,
            fingerprint = job.fingerprint.short(),
            path = %job.source_path.display(),
            attempt = job.attempts + 1,
            "processing"
        );

        let cancel = abort.child_token();
        let prepared = self
            .with_heartbeat(&job, &cancel, self.files.prepare(&job))
            .await;
        let area = match prepared {
            Ok(_) if cancel.is_cancelled() => {
                warn!(job_id = %job.id, "stopping before encode, job is no longer ours");
                return Ok(job);
            }
            Ok(area) => area,
            Err(e) => {
                return self
                    .fail(&job, JobState::Transcoding, e.reason(), e.to_string())
                    .await;
            }
        };

        let encoded = self
            .with_heartbeat(
                &job,
                &cancel,
                self.executor.transcode(
                    &area.source,
                    &area.output,
                    &job.plan,
                    job.source_duration_secs,
                    &cancel,
                ),
            )
            .await;
        if let Err(failure) = encoded {
            let Some(reason) = failure.reason() else {
                if abort.is_cancelled() {
                    warn!(job_id = %job.id, "encode interrupted by shutdown, leaving job for reclaim");
                } else {
                    warn!(job_id = %job.id, "encode stopped, job was claimed by another worker");
                }
                return Ok(job);
            };
            return self
                .fail(&job, JobState::Transcoding, reason, failure.detail)
                .await;
        }

        let job = jobs::advance(&self.pool, &job, JobState::Validating, JobUpdate::default()).await?;
        let validation = self
            .with_heartbeat(
                &job,
                &cancel,
                self.executor.validate(&area.output, job.source_duration_secs),
            )
            .await;
        let validation = match validation {
            Ok(v) => v,
            Err(failure) => {
                let reason = failure.reason().unwrap_or(FailureReason::ValidationFailed);
                return self
                    .fail(&job, JobState::Validating, reason, failure.detail)
                    .await;
            }
        };
        debug!(
            job_id = %job.id,
            output_bytes = validation.output_bytes,
            duration_secs = validation.duration_secs,
            "output validated"
        );

        // Never swap over a library file this job did not create.
        if let Err(e) = self.files.check_target(&job).await {
            return self
                .fail(&job, JobState::Validating, e.reason(), e.to_string())
                .await;
        }

        let job = jobs::advance(
            &self.pool,
            &job,
            JobState::Replacing,
            JobUpdate {
                output_path: Some(self.files.final_path(&job)),
                size_after: Some(validation.output_bytes),
                ..Default::default()
            },
        )
        .await?;
        self.finish_replace(job, &area, &cancel).await
    }

    /// Continue a job that stopped in `Replacing` or `SyncingMetadata`.
    ///
    /// Takes the claim over first; a job whose worker is still heart-beating
    /// is left alone.
    pub async fn roll_forward(&self, job: Job, abort: &CancellationToken) -> Result<Job, StoreError> {
        let Some(job) = jobs::take_over(&self.pool, &job).await? else {
            debug!(job_id = %job.id, state = %job.state, "job is still owned, not rolling forward");
            return Ok(job);
        };
        info!(job_id = %job.id, state = %job.state, path = %job.source_path.display(), "rolling forward interrupted job");
        let cancel = abort.child_token();
        match job.state {
            JobState::Replacing => {
                let area = self.files.work_area(&job);
                self.finish_replace(job, &area, &cancel).await
            }
            JobState::SyncingMetadata => self.finish_sync(job, &cancel).await,
            _ => Ok(job),
        }
    }

    async fn finish_replace(
        &self,
        job: Job,
        area: &WorkArea,
        cancel: &CancellationToken,
    ) -> Result<Job, StoreError> {
        let replaced = self
            .with_heartbeat(&job, cancel, self.files.replace(&job, area))
            .await;
        let replaced = match replaced {
            Ok(replaced) => replaced,
            Err(ReplaceError::BeforeCommit(e)) => {
                return self
                    .fail(&job, JobState::Replacing, e.reason(), e.to_string())
                    .await;
            }
            Err(ReplaceError::AfterCommit(e)) => {
                // The library already holds the replacement; retry the
                // clean-up on a later cycle instead of failing the job.
                error!(job_id = %job.id, error = %e, "clean-up after replace failed");
                return Ok(job);
            }
        };

        let job = jobs::advance(
            &self.pool,
            &job,
            JobState::SyncingMetadata,
            JobUpdate {
                output_path: Some(replaced.final_path),
                size_after: Some(replaced.size_after),
                ..Default::default()
            },
        )
        .await?;
        self.finish_sync(job, cancel).await
    }

    async fn finish_sync(&self, job: Job, cancel: &CancellationToken) -> Result<Job, StoreError> {
        let final_path = job
            .output_path
            .clone()
            .unwrap_or_else(|| self.files.final_path(&job));

        let sync_error = if self.sync.is_configured(job.kind) {
            let synced = self
                .with_heartbeat(
                    &job,
                    cancel,
                    self.sync.sync(job.kind, &job.source_path, &final_path, cancel),
                )
                .await;
            match synced {
                Ok(report) => {
                    info!(
                        job_id = %job.id,
                        file_id = report.file_id,
                        relative_path = %report.new_relative_path,
                        "catalogue updated"
                    );
                    None
                }
                Err(SyncError::Cancelled) => {
                    warn!(job_id = %job.id, "catalogue sync interrupted, will resume");
                    return Ok(job);
                }
                Err(e) => {
                    warn!(job_id = %job.id, kind = %job.kind, error = %e, "catalogue sync failed, completing with warning");
                    Some(e.to_string())
                }
            }
        } else {
            debug!(job_id = %job.id, kind = %job.kind, "no library service for kind, skipping sync");
            None
        };

        let job = jobs::advance(
            &self.pool,
            &job,
            JobState::Completed,
            JobUpdate {
                sync_error,
                ..Default::default()
            },
        )
        .await?;
        log_completed(&job, &final_path);
        Ok(job)
    }

    async fn fail(
        &self,
        job: &Job,
        stage: JobState,
        reason: FailureReason,
        message: String,
    ) -> Result<Job, StoreError> {
        let err = StageError::new(&job.id, job.fingerprint.clone(), stage, reason, message);
        warn!(
            job_id = %err.job_id,
            fingerprint = err.fingerprint.short(),
            stage = %err.stage,
            reason = err.code(),
            error = %err.message,
            "stage failed"
        );

        // Failed is not claimable, so the working area is ours until the
        // job is settled.
        let failed = jobs::mark_failed(&self.pool, job, reason, &err.to_string()).await?;
        if let Err(e) = self.files.discard(&job.id).await {
            warn!(job_id = %job.id, error = %e, "cannot remove working area");
        }

        let mut retry_changes = JobUpdate::default();
        if reason == FailureReason::HardwareUnavailable && !job.plan.software_only {
            let mut plan = job.plan.clone();
            plan.software_only = true;
            retry_changes.plan = Some(plan);
        }
        jobs::settle(&self.pool, &failed, &self.budget, retry_changes).await
    }

    /// Await `work`, refreshing the job's heartbeat while it runs. Cancels
    /// `cancel` once the job's claim has passed to someone else.
    async fn with_heartbeat<F: Future>(
        &self,
        job: &Job,
        cancel: &CancellationToken,
        work: F,
    ) -> F::Output {
        tokio::pin!(work);
        let mut ticker = tokio::time::interval(self.heartbeat_every);
        ticker.tick().await;
        loop {
            tokio::select! {
                out = &mut work => return out,
                _ = ticker.tick(), if !cancel.is_cancelled() => {
                    match jobs::heartbeat(&self.pool, job).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(job_id = %job.id, state = %job.state, "claim lost, stopping work on job");
                            cancel.cancel();
                        }
                        Err(e) => warn!(job_id = %job.id, error = %e, "heartbeat failed"),
                    }
                }
            }
        }
    }
}

fn log_completed(job: &Job, final_path: &Path) {
    let saved_mb = job.bytes_saved() as f64 / (1024.0 * 1024.0);
    if job.completed_with_warning() {
        warn!(
            job_id = %job.id,
            path = %final_path.display(),
            saved_mb,
            "completed, catalogue needs manual attention"
        );
    } else {
        info!(
            job_id = %job.id,
            path = %final_path.display(),
            saved_mb,
            "completed"
        );
    }
}
