use std::path::{Path, PathBuf};
use std::time::Duration;

use recast_core::{
    Disposition, FailureReason, Fingerprint, Job, JobState, MediaKind, NewJob, RetryBudget,
    TranscodePlan,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};

use crate::StoreError;
use crate::repo::stats;

const COLUMNS: &str = "id, source_path, library_root, media_kind, fingerprint, status, \
     claim_id, failure_reason, attempts, created_at, updated_at, started_at, finished_at, \
     next_attempt_at, output_path, error_message, sync_error, size_before, size_after, \
     source_duration_secs, plan_json";

const SETTLED: &str = "('completed', 'permanently_failed')";

/// Result of trying to take ownership of a fingerprint.
#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    Reserved(Job),
    /// Another job for the fingerprint is still in progress.
    AlreadyActive(Job),
    /// The fingerprint already reached a terminal state.
    AlreadySettled(Job),
}

/// Which eligible job a worker picks next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickOrder {
    #[default]
    OldestFirst,
    NewestFirst,
    SmallestFirst,
    LargestFirst,
}

impl PickOrder {
    fn order_by(self) -> &'static str {
        match self {
            Self::OldestFirst => "created_at ASC, rowid ASC",
            Self::NewestFirst => "created_at DESC, rowid DESC",
            Self::SmallestFirst => "size_before ASC, created_at ASC, rowid ASC",
            Self::LargestFirst => "size_before DESC, created_at ASC, rowid ASC",
        }
    }
}

/// Fields written alongside a state change. `None` leaves the column as is.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub failure_reason: Option<FailureReason>,
    pub error: Option<String>,
    pub sync_error: Option<String>,
    pub output_path: Option<PathBuf>,
    pub size_after: Option<u64>,
    pub attempts: Option<u32>,
    pub next_attempt_at: Option<i64>,
    /// Replace the stored plan, e.g. to force a software encode on retry.
    pub plan: Option<TranscodePlan>,
}

/// Record a new job for `new.fingerprint` unless one is live or settled.
///
/// The check and the insert are one statement; the partial unique index on
/// live fingerprints turns a concurrent duplicate into a no-op.
pub async fn reserve(pool: &SqlitePool, new: &NewJob) -> Result<ReserveOutcome, StoreError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();
    let plan_json = new.plan.to_json()?;

    let result = sqlx::query(&format!(
        "INSERT OR IGNORE INTO processed_files \
         (id, source_path, library_root, media_kind, fingerprint, status, attempts, \
          created_at, updated_at, next_attempt_at, size_before, source_duration_secs, plan_json) \
         SELECT ?, ?, ?, ?, ?, 'reserved', 0, ?, ?, 0, ?, ?, ? \
         WHERE NOT EXISTS ( \
             SELECT 1 FROM processed_files WHERE fingerprint = ? AND status IN {SETTLED})"
    ))
    .bind(&id)
    .bind(path_text(&new.source_path))
    .bind(path_text(&new.library_root))
    .bind(new.kind.as_str())
    .bind(new.fingerprint.as_str())
    .bind(now)
    .bind(now)
    .bind(new.size_before as i64)
    .bind(new.source_duration_secs)
    .bind(plan_json)
    .bind(new.fingerprint.as_str())
    .execute(pool)
    .await?;

    if result.rows_affected() == 1 {
        let job = get(pool, &id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        debug!(job_id = %job.id, fingerprint = job.fingerprint.short(), "job reserved");
        return Ok(ReserveOutcome::Reserved(job));
    }

    match find_by_fingerprint(pool, &new.fingerprint).await? {
        Some(existing) if existing.is_terminal() => Ok(ReserveOutcome::AlreadySettled(existing)),
        Some(existing) => Ok(ReserveOutcome::AlreadyActive(existing)),
        None => Err(StoreError::NotFound(new.fingerprint.to_string())),
    }
}

/// Atomically move one eligible `Reserved` job to `Transcoding` under a
/// fresh claim token.
pub async fn claim_next(pool: &SqlitePool, order: PickOrder) -> Result<Option<Job>, StoreError> {
    let now = chrono::Utc::now().timestamp();
    let claim = uuid::Uuid::new_v4().to_string();
    let row = sqlx::query(&format!(
        "UPDATE processed_files \
         SET status = 'transcoding', claim_id = ?, started_at = ?, updated_at = ? \
         WHERE id = ( \
             SELECT id FROM processed_files \
             WHERE status = 'reserved' AND next_attempt_at <= ? \
             ORDER BY {} LIMIT 1) \
         AND status = 'reserved' \
         RETURNING {COLUMNS}",
        order.order_by()
    ))
    .bind(&claim)
    .bind(now)
    .bind(now)
    .bind(now)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_job).transpose()
}

/// Move a job to `to`, validating the edge and guarding against a concurrent
/// writer with a compare-and-swap on the current status.
///
/// Reads the row first, so it does not check who holds the claim. Workers
/// use [`advance`].
pub async fn update(
    pool: &SqlitePool,
    job_id: &str,
    to: JobState,
    changes: JobUpdate,
) -> Result<Job, StoreError> {
    let current = get(pool, job_id)
        .await?
        .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
    apply(pool, &current, to, changes, false).await
}

/// Move a claimed job to `to`. Fails with `Conflict` when the row is no
/// longer in `job.state` or another worker has claimed it since.
pub async fn advance(
    pool: &SqlitePool,
    job: &Job,
    to: JobState,
    changes: JobUpdate,
) -> Result<Job, StoreError> {
    apply(pool, job, to, changes, false).await
}

/// Record a failed attempt for a claimed job. The result is left in
/// `Failed`; pass it to [`settle`] once the working area is cleaned up.
pub async fn mark_failed(
    pool: &SqlitePool,
    job: &Job,
    reason: FailureReason,
    message: &str,
) -> Result<Job, StoreError> {
    apply(
        pool,
        job,
        JobState::Failed,
        JobUpdate {
            failure_reason: Some(reason),
            error: Some(message.to_string()),
            ..Default::default()
        },
        false,
    )
    .await
}

/// Record a failed attempt, then either requeue the job with back-off or give
/// up on it, depending on the reason and the remaining budget.
pub async fn fail(
    pool: &SqlitePool,
    job_id: &str,
    reason: FailureReason,
    message: &str,
    budget: &RetryBudget,
) -> Result<Job, StoreError> {
    fail_with(pool, job_id, reason, message, budget, JobUpdate::default()).await
}

/// Like [`fail`], with extra columns written on the way back to `Reserved`.
pub async fn fail_with(
    pool: &SqlitePool,
    job_id: &str,
    reason: FailureReason,
    message: &str,
    budget: &RetryBudget,
    retry_changes: JobUpdate,
) -> Result<Job, StoreError> {
    let failed = update(
        pool,
        job_id,
        JobState::Failed,
        JobUpdate {
            failure_reason: Some(reason),
            error: Some(message.to_string()),
            ..Default::default()
        },
    )
    .await?;
    settle(pool, &failed, budget, retry_changes).await
}

/// Requeue a `Failed` job with back-off, or give up on it once the reason
/// or the spent budget rules out another attempt.
pub async fn settle(
    pool: &SqlitePool,
    failed: &Job,
    budget: &RetryBudget,
    retry_changes: JobUpdate,
) -> Result<Job, StoreError> {
    let reason = failed.failure_reason.unwrap_or(FailureReason::Stale);
    match budget.after_failure(failed.attempts, reason) {
        Disposition::Retry { attempts, delay } => {
            let not_before = chrono::Utc::now().timestamp() + delay.as_secs() as i64;
            let job = apply(
                pool,
                failed,
                JobState::Reserved,
                JobUpdate {
                    attempts: Some(attempts),
                    next_attempt_at: Some(not_before),
                    ..retry_changes
                },
                false,
            )
            .await?;
            info!(
                job_id = %job.id,
                reason = %reason,
                attempts,
                retry_in_secs = delay.as_secs(),
                "job requeued"
            );
            Ok(job)
        }
        Disposition::GiveUp { attempts } => {
            let job = apply(
                pool,
                failed,
                JobState::PermanentlyFailed,
                JobUpdate {
                    attempts: Some(attempts),
                    ..Default::default()
                },
                false,
            )
            .await?;
            warn!(
                job_id = %job.id,
                reason = %reason,
                attempts,
                path = %job.source_path.display(),
                "job permanently failed"
            );
            Ok(job)
        }
    }
}

/// Refresh `updated_at` for a job a worker is still driving. Returns `false`
/// once the job has left the worker's hands.
pub async fn heartbeat(pool: &SqlitePool, job: &Job) -> Result<bool, StoreError> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        "UPDATE processed_files SET updated_at = ? \
         WHERE id = ? AND claim_id IS ? \
         AND status IN ('transcoding', 'validating', 'replacing', 'syncing_metadata')",
    )
    .bind(now)
    .bind(&job.id)
    .bind(job.claim_id.as_deref())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Requeue (or give up on) jobs whose worker stopped making progress before
/// the library was touched.
pub async fn reclaim_stale(
    pool: &SqlitePool,
    timeout: Duration,
    budget: &RetryBudget,
) -> Result<Vec<Job>, StoreError> {
    let cutoff = chrono::Utc::now().timestamp() - timeout.as_secs() as i64;
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM processed_files \
         WHERE status IN ('transcoding', 'validating', 'failed') AND updated_at <= ? \
         ORDER BY updated_at ASC, rowid ASC"
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    let mut reclaimed = Vec::with_capacity(rows.len());
    for row in &rows {
        let job = row_to_job(row)?;

        let failed = if job.state == JobState::Failed {
            job
        } else {
            let changes = JobUpdate {
                failure_reason: Some(FailureReason::Stale),
                error: Some(format!(
                    "no progress for {}s while {}",
                    timeout.as_secs(),
                    job.state
                )),
                ..Default::default()
            };
            match apply(pool, &job, JobState::Failed, changes, true).await {
                Ok(failed) => failed,
                Err(StoreError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        };

        match settle(pool, &failed, budget, JobUpdate::default()).await {
            Ok(settled) => {
                info!(
                    job_id = %settled.id,
                    state = %settled.state,
                    path = %settled.source_path.display(),
                    "reclaimed stale job"
                );
                reclaimed.push(settled);
            }
            Err(StoreError::Conflict { .. }) => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(reclaimed)
}

/// Jobs that stopped while the library swap or the catalogue update was in
/// progress. These are rolled forward by the orchestrator, never requeued.
pub async fn stale_after_replace(
    pool: &SqlitePool,
    timeout: Duration,
) -> Result<Vec<Job>, StoreError> {
    let cutoff = chrono::Utc::now().timestamp() - timeout.as_secs() as i64;
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM processed_files \
         WHERE status IN ('replacing', 'syncing_metadata') AND updated_at <= ? \
         ORDER BY updated_at ASC, rowid ASC"
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_job).collect()
}

/// Claim a job found by [`stale_after_replace`] for roll-forward. Returns
/// `None` when its worker heart-beat or another process took it first.
pub async fn take_over(pool: &SqlitePool, job: &Job) -> Result<Option<Job>, StoreError> {
    let now = chrono::Utc::now().timestamp();
    let claim = uuid::Uuid::new_v4().to_string();
    let row = sqlx::query(&format!(
        "UPDATE processed_files SET claim_id = ?, updated_at = ? \
         WHERE id = ? AND status = ? AND updated_at = ? AND claim_id IS ? \
         RETURNING {COLUMNS}"
    ))
    .bind(&claim)
    .bind(now)
    .bind(&job.id)
    .bind(job.state.as_str())
    .bind(job.updated_at)
    .bind(job.claim_id.as_deref())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_job).transpose()
}

pub async fn get(pool: &SqlitePool, job_id: &str) -> Result<Option<Job>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM processed_files WHERE id = ?"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_job).transpose()
}

/// The live job for a fingerprint, or else its most recent settled one.
pub async fn find_by_fingerprint(
    pool: &SqlitePool,
    fingerprint: &Fingerprint,
) -> Result<Option<Job>, StoreError> {
    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM processed_files WHERE fingerprint = ? \
         ORDER BY CASE WHEN status IN {SETTLED} THEN 1 ELSE 0 END, created_at DESC, rowid DESC \
         LIMIT 1"
    ))
    .bind(fingerprint.as_str())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_job).transpose()
}

/// Every job ever recorded for a library path, newest first.
pub async fn history(pool: &SqlitePool, source_path: &Path) -> Result<Vec<Job>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM processed_files WHERE source_path = ? \
         ORDER BY created_at DESC, rowid DESC"
    ))
    .bind(path_text(source_path))
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_job).collect()
}

pub async fn list_by_state(pool: &SqlitePool, state: JobState) -> Result<Vec<Job>, StoreError> {
    let rows = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM processed_files WHERE status = ? \
         ORDER BY created_at ASC, rowid ASC"
    ))
    .bind(state.as_str())
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_job).collect()
}

/// Ids of every job that has not reached a terminal state.
pub async fn active_ids(pool: &SqlitePool) -> Result<Vec<String>, StoreError> {
    let ids: Vec<(String,)> = sqlx::query_as(&format!(
        "SELECT id FROM processed_files WHERE status NOT IN {SETTLED}"
    ))
    .fetch_all(pool)
    .await?;
    Ok(ids.into_iter().map(|(id,)| id).collect())
}

async fn apply(
    pool: &SqlitePool,
    current: &Job,
    to: JobState,
    changes: JobUpdate,
    require_unchanged: bool,
) -> Result<Job, StoreError> {
    if !current.state.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            job_id: current.id.clone(),
            from: current.state,
            to,
        });
    }

    let now = chrono::Utc::now().timestamp();
    let finished_at = to.is_terminal().then_some(now);
    let plan_json = changes.plan.as_ref().map(TranscodePlan::to_json).transpose()?;

    let mut tx = pool.begin().await?;
    let result = sqlx::query(
        "UPDATE processed_files SET \
             status = ?, updated_at = ?, \
             claim_id = CASE WHEN ? = 'reserved' THEN NULL ELSE claim_id END, \
             failure_reason = COALESCE(?, failure_reason), \
             error_message = COALESCE(?, error_message), \
             sync_error = COALESCE(?, sync_error), \
             output_path = COALESCE(?, output_path), \
             size_after = COALESCE(?, size_after), \
             attempts = COALESCE(?, attempts), \
             next_attempt_at = COALESCE(?, next_attempt_at), \
             plan_json = COALESCE(?, plan_json), \
             finished_at = COALESCE(?, finished_at) \
         WHERE id = ? AND status = ? AND claim_id IS ? AND (? = 0 OR updated_at = ?)",
    )
    .bind(to.as_str())
    .bind(now)
    .bind(to.as_str())
    .bind(changes.failure_reason.map(FailureReason::as_str))
    .bind(changes.error)
    .bind(changes.sync_error)
    .bind(changes.output_path.as_deref().map(path_text))
    .bind(changes.size_after.map(|v| v as i64))
    .bind(changes.attempts.map(i64::from))
    .bind(changes.next_attempt_at)
    .bind(plan_json)
    .bind(finished_at)
    .bind(&current.id)
    .bind(current.state.as_str())
    .bind(current.claim_id.as_deref())
    .bind(require_unchanged)
    .bind(current.updated_at)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::Conflict {
            job_id: current.id.clone(),
            expected: current.state,
        });
    }

    let row = sqlx::query(&format!(
        "SELECT {COLUMNS} FROM processed_files WHERE id = ?"
    ))
    .bind(&current.id)
    .fetch_one(&mut *tx)
    .await?;
    let updated = row_to_job(&row)?;

    match to {
        JobState::Completed => {
            stats::record_completion(&mut tx, now, updated.bytes_saved()).await?
        }
        JobState::PermanentlyFailed => stats::record_failure(&mut tx, now).await?,
        _ => {}
    }

    tx.commit().await?;

    debug!(
        job_id = %updated.id,
        from = %current.state,
        to = %updated.state,
        "job transition"
    );
    Ok(updated)
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn corrupt(job_id: &str, column: &'static str, detail: impl Into<String>) -> StoreError {
    StoreError::CorruptRow {
        job_id: job_id.to_string(),
        column,
        detail: detail.into(),
    }
}

fn row_to_job(row: &SqliteRow) -> Result<Job, StoreError> {
    let id: String = row.try_get("id")?;

    let status: String = row.try_get("status")?;
    let state = JobState::parse(&status).ok_or_else(|| corrupt(&id, "status", &status))?;

    let kind: String = row.try_get("media_kind")?;
    let kind = MediaKind::parse(&kind).ok_or_else(|| corrupt(&id, "media_kind", &kind))?;

    let failure_reason = match row.try_get::<Option<String>, _>("failure_reason")? {
        Some(raw) => Some(
            FailureReason::parse(&raw).ok_or_else(|| corrupt(&id, "failure_reason", &raw))?,
        ),
        None => None,
    };

    let plan: String = row.try_get("plan_json")?;
    let plan = TranscodePlan::from_json(&plan)
        .map_err(|e| corrupt(&id, "plan_json", e.to_string()))?;

    let attempts: i64 = row.try_get("attempts")?;
    let size_before: i64 = row.try_get("size_before")?;
    let size_after: Option<i64> = row.try_get("size_after")?;
    let source_path: String = row.try_get("source_path")?;
    let library_root: String = row.try_get("library_root")?;
    let output_path: Option<String> = row.try_get("output_path")?;
    let fingerprint: String = row.try_get("fingerprint")?;

    Ok(Job {
        fingerprint: Fingerprint::from_stored(fingerprint),
        source_path: PathBuf::from(source_path),
        library_root: PathBuf::from(library_root),
        kind,
        state,
        claim_id: row.try_get("claim_id")?,
        failure_reason,
        attempts: attempts.max(0) as u32,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        last_error: row.try_get("error_message")?,
        sync_error: row.try_get("sync_error")?,
        output_path: output_path.map(PathBuf::from),
        size_before: size_before.max(0) as u64,
        size_after: size_after.map(|v| v.max(0) as u64),
        plan,
        source_duration_secs: row.try_get("source_duration_secs")?,
        id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let pool = crate::open(path.to_str().unwrap()).await.unwrap();
        (dir, pool)
    }

    fn plan() -> TranscodePlan {
        TranscodePlan {
            target_height: 1080,
            video_codec: "h264".into(),
            container: "mp4".into(),
            audio_codec: "aac".into(),
            audio_bitrate_kbps: 128,
            quality: 23,
            preset: "medium".into(),
            subtitle_codec: "mov_text".into(),
            software_only: false,
        }
    }

    fn new_job(path: &str, size: u64) -> NewJob {
        NewJob {
            fingerprint: Fingerprint::compute(Path::new(path), size, 1_700_000_000),
            source_path: PathBuf::from(path),
            library_root: PathBuf::from("/tv"),
            kind: MediaKind::Episode,
            size_before: size,
            source_duration_secs: 1200.0,
            plan: plan(),
        }
    }

    fn budget(max_retries: u32) -> RetryBudget {
        RetryBudget {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    async fn reserved(pool: &SqlitePool, new: &NewJob) -> Job {
        match reserve(pool, new).await.unwrap() {
            ReserveOutcome::Reserved(job) => job,
            other => panic!("expected a reservation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reserve_is_exclusive_per_fingerprint() {
        let (_dir, pool) = test_pool().await;
        let new = new_job("/tv/Show/S01E01.mkv", 1000);

        let job = reserved(&pool, &new).await;
        assert_eq!(job.state, JobState::Reserved);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.plan, plan());

        match reserve(&pool, &new).await.unwrap() {
            ReserveOutcome::AlreadyActive(existing) => assert_eq!(existing.id, job.id),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn settled_fingerprint_is_never_reserved_again() {
        let (_dir, pool) = test_pool().await;
        let new = new_job("/tv/Show/S01E02.mkv", 1000);
        let job = reserved(&pool, &new).await;

        fail(&pool, &job.id, FailureReason::EncodeError, "bad stream", &budget(3))
            .await
            .unwrap();

        assert!(matches!(
            reserve(&pool, &new).await.unwrap(),
            ReserveOutcome::AlreadySettled(_)
        ));
    }

    #[tokio::test]
    async fn claim_moves_one_job_to_transcoding() {
        let (_dir, pool) = test_pool().await;
        let first = reserved(&pool, &new_job("/tv/a.mkv", 10)).await;
        let _second = reserved(&pool, &new_job("/tv/b.mkv", 20)).await;

        let claimed = claim_next(&pool, PickOrder::OldestFirst)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.state, JobState::Transcoding);
        assert!(claimed.started_at.is_some());

        let next = claim_next(&pool, PickOrder::OldestFirst)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(next.id, first.id);
        assert!(claim_next(&pool, PickOrder::OldestFirst)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn largest_first_prefers_bigger_sources() {
        let (_dir, pool) = test_pool().await;
        reserved(&pool, &new_job("/tv/small.mkv", 10)).await;
        let big = reserved(&pool, &new_job("/tv/big.mkv", 10_000)).await;

        let claimed = claim_next(&pool, PickOrder::LargestFirst)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, big.id);
    }

    #[tokio::test]
    async fn update_rejects_skipped_states() {
        let (_dir, pool) = test_pool().await;
        let job = reserved(&pool, &new_job("/tv/c.mkv", 10)).await;

        let err = update(&pool, &job.id, JobState::Replacing, JobUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));

        let unchanged = get(&pool, &job.id).await.unwrap().unwrap();
        assert_eq!(unchanged.state, JobState::Reserved);
    }

    #[tokio::test]
    async fn terminal_jobs_are_immutable() {
        let (_dir, pool) = test_pool().await;
        let job = reserved(&pool, &new_job("/tv/d.mkv", 10)).await;
        let dead = fail(&pool, &job.id, FailureReason::SourceMissing, "gone", &budget(3))
            .await
            .unwrap();
        assert_eq!(dead.state, JobState::PermanentlyFailed);
        assert!(dead.finished_at.is_some());

        for to in JobState::ALL {
            assert!(update(&pool, &job.id, to, JobUpdate::default()).await.is_err());
        }
    }

    #[tokio::test]
    async fn happy_path_records_stats() {
        let (_dir, pool) = test_pool().await;
        let job = reserved(&pool, &new_job("/tv/e.mkv", 1000)).await;
        claim_next(&pool, PickOrder::OldestFirst).await.unwrap();

        update(&pool, &job.id, JobState::Validating, JobUpdate::default())
            .await
            .unwrap();
        update(&pool, &job.id, JobState::Replacing, JobUpdate::default())
            .await
            .unwrap();
        update(
            &pool,
            &job.id,
            JobState::SyncingMetadata,
            JobUpdate {
                output_path: Some(PathBuf::from("/tv/e.1080p.mp4")),
                size_after: Some(400),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let done = update(&pool, &job.id, JobState::Completed, JobUpdate::default())
            .await
            .unwrap();

        assert_eq!(done.output_path.as_deref(), Some(Path::new("/tv/e.1080p.mp4")));
        assert_eq!(done.bytes_saved(), 600);

        let today = chrono::Utc::now().date_naive();
        let summary = stats::summary(&pool, today).await.unwrap();
        assert_eq!(summary.files_processed, 1);
        assert_eq!(summary.bytes_saved, 600);
        assert_eq!(summary.failures, 0);
        assert_eq!(summary.by_status.get("completed"), Some(&1));
    }

    #[tokio::test]
    async fn fail_requeues_until_budget_is_spent() {
        let (_dir, pool) = test_pool().await;
        let job = reserved(&pool, &new_job("/tv/f.mkv", 10)).await;
        let budget = budget(2);

        claim_next(&pool, PickOrder::OldestFirst).await.unwrap();
        let retry = fail(&pool, &job.id, FailureReason::Timeout, "too slow", &budget)
            .await
            .unwrap();
        assert_eq!(retry.state, JobState::Reserved);
        assert_eq!(retry.attempts, 1);
        assert_eq!(retry.failure_reason, Some(FailureReason::Timeout));
        assert_eq!(retry.last_error.as_deref(), Some("too slow"));

        claim_next(&pool, PickOrder::OldestFirst).await.unwrap();
        let dead = fail(&pool, &job.id, FailureReason::Timeout, "too slow", &budget)
            .await
            .unwrap();
        assert_eq!(dead.state, JobState::PermanentlyFailed);
        assert_eq!(dead.attempts, 2);
    }

    #[tokio::test]
    async fn backoff_delays_the_next_claim() {
        let (_dir, pool) = test_pool().await;
        let job = reserved(&pool, &new_job("/tv/g.mkv", 10)).await;
        let budget = RetryBudget {
            max_retries: 3,
            base_delay: Duration::from_secs(3600),
            max_delay: Duration::from_secs(3600),
        };

        claim_next(&pool, PickOrder::OldestFirst).await.unwrap();
        let retry = fail(&pool, &job.id, FailureReason::Io, "disk hiccup", &budget)
            .await
            .unwrap();
        assert!(retry.next_attempt_at > chrono::Utc::now().timestamp());
        assert!(claim_next(&pool, PickOrder::OldestFirst)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn fail_with_rewrites_the_plan() {
        let (_dir, pool) = test_pool().await;
        let job = reserved(&pool, &new_job("/tv/h.mkv", 10)).await;
        claim_next(&pool, PickOrder::OldestFirst).await.unwrap();

        let mut software = plan();
        software.software_only = true;
        let retry = fail_with(
            &pool,
            &job.id,
            FailureReason::HardwareUnavailable,
            "no device",
            &budget(3),
            JobUpdate {
                plan: Some(software.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(retry.state, JobState::Reserved);
        assert_eq!(retry.plan, software);
    }

    #[tokio::test]
    async fn reclaim_requeues_abandoned_encodes() {
        let (_dir, pool) = test_pool().await;
        let job = reserved(&pool, &new_job("/tv/i.mkv", 10)).await;
        claim_next(&pool, PickOrder::OldestFirst).await.unwrap();

        let reclaimed = reclaim_stale(&pool, Duration::ZERO, &budget(3))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, job.id);
        assert_eq!(reclaimed[0].state, JobState::Reserved);
        assert_eq!(reclaimed[0].failure_reason, Some(FailureReason::Stale));
        assert_eq!(reclaimed[0].attempts, 1);
    }

    #[tokio::test]
    async fn reclaim_ignores_fresh_and_replacing_jobs() {
        let (_dir, pool) = test_pool().await;
        let job = reserved(&pool, &new_job("/tv/j.mkv", 10)).await;
        claim_next(&pool, PickOrder::OldestFirst).await.unwrap();

        let reclaimed = reclaim_stale(&pool, Duration::from_secs(3600), &budget(3))
            .await
            .unwrap();
        assert!(reclaimed.is_empty());

        update(&pool, &job.id, JobState::Validating, JobUpdate::default())
            .await
            .unwrap();
        update(&pool, &job.id, JobState::Replacing, JobUpdate::default())
            .await
            .unwrap();
        let reclaimed = reclaim_stale(&pool, Duration::ZERO, &budget(3))
            .await
            .unwrap();
        assert!(reclaimed.is_empty());

        let interrupted = stale_after_replace(&pool, Duration::ZERO).await.unwrap();
        assert_eq!(interrupted.len(), 1);
        assert_eq!(interrupted[0].state, JobState::Replacing);
    }

    #[tokio::test]
    async fn heartbeat_only_touches_in_flight_jobs() {
        let (_dir, pool) = test_pool().await;
        let job = reserved(&pool, &new_job("/tv/k.mkv", 10)).await;
        assert!(!heartbeat(&pool, &job).await.unwrap());

        let claimed = claim_next(&pool, PickOrder::OldestFirst)
            .await
            .unwrap()
            .unwrap();
        assert!(claimed.claim_id.is_some());
        assert!(heartbeat(&pool, &claimed).await.unwrap());
    }

    #[tokio::test]
    async fn stale_worker_cannot_write_after_reclaim() {
        let (_dir, pool) = test_pool().await;
        reserved(&pool, &new_job("/tv/m.mkv", 10)).await;

        let first = claim_next(&pool, PickOrder::OldestFirst)
            .await
            .unwrap()
            .unwrap();
        let reclaimed = reclaim_stale(&pool, Duration::ZERO, &budget(3))
            .await
            .unwrap();
        assert_eq!(reclaimed[0].claim_id, None);
        let second = claim_next(&pool, PickOrder::OldestFirst)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_ne!(second.claim_id, first.claim_id);

        let err = advance(&pool, &first, JobState::Validating, JobUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert!(mark_failed(&pool, &first, FailureReason::Timeout, "late")
            .await
            .is_err());
        assert!(!heartbeat(&pool, &first).await.unwrap());

        let current = get(&pool, &first.id).await.unwrap().unwrap();
        assert_eq!(current.state, JobState::Transcoding);
        assert_eq!(current.claim_id, second.claim_id);

        let next = advance(&pool, &second, JobState::Validating, JobUpdate::default())
            .await
            .unwrap();
        assert_eq!(next.state, JobState::Validating);
    }

    #[tokio::test]
    async fn take_over_loses_to_a_live_worker() {
        let (_dir, pool) = test_pool().await;
        reserved(&pool, &new_job("/tv/n.mkv", 10)).await;
        let job = claim_next(&pool, PickOrder::OldestFirst)
            .await
            .unwrap()
            .unwrap();
        let job = advance(&pool, &job, JobState::Validating, JobUpdate::default())
            .await
            .unwrap();
        let job = advance(&pool, &job, JobState::Replacing, JobUpdate::default())
            .await
            .unwrap();

        let seen = stale_after_replace(&pool, Duration::ZERO).await.unwrap();
        assert_eq!(seen.len(), 1);

        // The owner heart-beats after the scan saw the row.
        sqlx::query("UPDATE processed_files SET updated_at = updated_at + 1 WHERE id = ?")
            .bind(&job.id)
            .execute(&pool)
            .await
            .unwrap();
        assert!(take_over(&pool, &seen[0]).await.unwrap().is_none());

        let fresh = get(&pool, &job.id).await.unwrap().unwrap();
        let taken = take_over(&pool, &fresh).await.unwrap().unwrap();
        assert_ne!(taken.claim_id, job.claim_id);
        assert!(advance(&pool, &job, JobState::SyncingMetadata, JobUpdate::default())
            .await
            .is_err());
        assert!(advance(&pool, &taken, JobState::SyncingMetadata, JobUpdate::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn history_lists_every_attempt_for_a_path() {
        let (_dir, pool) = test_pool().await;
        let first = new_job("/tv/l.mkv", 10);
        let job = reserved(&pool, &first).await;
        fail(&pool, &job.id, FailureReason::EncodeError, "corrupt", &budget(3))
            .await
            .unwrap();

        // Same path with a new size is a new fingerprint
        let second = new_job("/tv/l.mkv", 11);
        reserved(&pool, &second).await;

        let jobs = history(&pool, Path::new("/tv/l.mkv")).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(
            list_by_state(&pool, JobState::PermanentlyFailed)
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(active_ids(&pool).await.unwrap().len(), 1);
    }
}
