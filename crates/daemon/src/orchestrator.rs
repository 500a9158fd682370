//! Scan cycles, the worker pool and shutdown.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use recast_core::{NewJob, RetryBudget};
use recast_db::StoreError;
use recast_db::repo::jobs::{self, PickOrder, ReserveOutcome};
use recast_db::repo::stats;
use recast_scanner::Scanner;
use recast_transcoder::decision::{self, Decision, Policy};
use sqlx::SqlitePool;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::window::ProcessingWindow;
use crate::worker::Worker;

/// How often an idle worker looks for claimable jobs.
const IDLE_POLL: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct Settings {
    pub concurrency: usize,
    pub pick_order: PickOrder,
    pub budget: RetryBudget,
    pub stale_timeout: Duration,
    pub scan_interval: Duration,
    pub grace_period: Duration,
    pub window: ProcessingWindow,
}

/// Counts from one scan-and-reserve pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub reclaimed: usize,
    pub rolled_forward: usize,
    pub scanned: usize,
    pub skipped: usize,
    pub reserved: usize,
    pub already_known: usize,
    /// The scan stopped early and will resume from here next cycle.
    pub resume_after: Option<PathBuf>,
}

pub struct Orchestrator {
    pool: SqlitePool,
    scanner: Scanner,
    policy: Policy,
    worker: Arc<Worker>,
    settings: Settings,
    /// Cancels in-flight work once the grace period is over.
    abort: CancellationToken,
    resume_after: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(
        pool: SqlitePool,
        scanner: Scanner,
        policy: Policy,
        worker: Arc<Worker>,
        settings: Settings,
    ) -> Self {
        Self {
            pool,
            scanner,
            policy,
            worker,
            settings,
            abort: CancellationToken::new(),
            resume_after: None,
        }
    }

    /// Run until `shutdown` fires.
    ///
    /// After shutdown no new scans or claims start; in-flight jobs get the
    /// grace period, then their encoders are killed and the records are
    /// left for `reclaim_stale` on the next start.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), StoreError> {
        info!(
            concurrency = self.settings.concurrency,
            window = %self.settings.window,
            order = ?self.settings.pick_order,
            "orchestrator starting"
        );
        self.startup().await?;
        self.logged_cycle(&shutdown).await;

        let mut workers = JoinSet::new();
        for slot in 0..self.settings.concurrency {
            workers.spawn(worker_loop(
                slot,
                self.pool.clone(),
                self.worker.clone(),
                self.settings.pick_order,
                self.settings.window,
                shutdown.clone(),
                self.abort.clone(),
            ));
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.scan_interval) => {}
            }
            self.logged_cycle(&shutdown).await;
        }

        info!(
            grace_secs = self.settings.grace_period.as_secs(),
            "shutdown requested, waiting for in-flight jobs"
        );
        let drained = tokio::time::timeout(self.settings.grace_period, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("grace period over, stopping in-flight encodes");
            self.abort.cancel();
            while workers.join_next().await.is_some() {}
        }
        info!("orchestrator stopped");
        Ok(())
    }

    async fn logged_cycle(&mut self, shutdown: &CancellationToken) {
        if let Err(e) = self.run_cycle(shutdown).await {
            error!(error = %e, "cycle failed");
        }
    }

    /// Clear working areas left behind by jobs that no longer run.
    pub async fn startup(&self) -> Result<(), StoreError> {
        let active: HashSet<String> = jobs::active_ids(&self.pool).await?.into_iter().collect();
        match self.worker.files().sweep_orphans(&active).await {
            Ok(0) => {}
            Ok(n) => info!(removed = n, "swept orphaned working areas"),
            Err(e) => warn!(error = %e, "cannot sweep working areas"),
        }
        Ok(())
    }

    /// Reclaim stale jobs, finish interrupted swaps, then scan and reserve.
    pub async fn run_cycle(&mut self, shutdown: &CancellationToken) -> Result<CycleReport, StoreError> {
        let mut report = CycleReport::default();

        let reclaimed =
            jobs::reclaim_stale(&self.pool, self.settings.stale_timeout, &self.settings.budget)
                .await?;
        report.reclaimed = reclaimed.len();

        for job in jobs::stale_after_replace(&self.pool, self.settings.stale_timeout).await? {
            if shutdown.is_cancelled() {
                break;
            }
            match self.worker.roll_forward(job, &self.abort).await {
                Ok(_) => report.rolled_forward += 1,
                Err(StoreError::Conflict { job_id, .. }) => {
                    warn!(job_id = %job_id, "interrupted job changed hands during roll-forward");
                }
                Err(e) => return Err(e),
            }
        }

        if !self.settings.window.is_open_now() {
            debug!(window = %self.settings.window, "outside processing window, not scanning");
            return Ok(report);
        }

        self.scan_and_reserve(shutdown, &mut report).await?;
        self.log_stats().await;
        Ok(report)
    }

    async fn scan_and_reserve(
        &mut self,
        shutdown: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<(), StoreError> {
        let window = self.settings.window;
        let mut last = None;
        let mut interrupted = false;
        {
            let stream = self.scanner.scan(self.resume_after.clone());
            futures::pin_mut!(stream);

            while let Some(item) = stream.next().await {
                if shutdown.is_cancelled() || !window.is_open_now() {
                    interrupted = true;
                    break;
                }
                let media = match item {
                    Ok(media) => media,
                    Err(e) => {
                        error!(error = %e, "scan aborted");
                        interrupted = true;
                        break;
                    }
                };
                report.scanned += 1;
                last = Some(media.path.clone());

                let (plan, reasons) = match decision::decide(&media, &self.policy) {
                    Decision::Skip(reason) => {
                        debug!(path = %media.path.display(), %reason, "no transcode needed");
                        report.skipped += 1;
                        continue;
                    }
                    Decision::Transcode(plan, reasons) => (plan, reasons),
                };

                match jobs::reserve(&self.pool, &NewJob::discovered(&media, plan)).await? {
                    ReserveOutcome::Reserved(job) => {
                        info!(
                            job_id = %job.id,
                            fingerprint = job.fingerprint.short(),
                            path = %media.path.display(),
                            reasons = ?reasons,
                            "job reserved"
                        );
                        report.reserved += 1;
                    }
                    ReserveOutcome::AlreadyActive(job) | ReserveOutcome::AlreadySettled(job) => {
                        debug!(job_id = %job.id, state = %job.state, "fingerprint already has a job");
                        report.already_known += 1;
                    }
                }
            }
        }

        self.resume_after = if interrupted { last.or(self.resume_after.take()) } else { None };
        report.resume_after = self.resume_after.clone();
        info!(
            scanned = report.scanned,
            skipped = report.skipped,
            reserved = report.reserved,
            resumable = interrupted,
            "scan pass finished"
        );
        Ok(())
    }

    async fn log_stats(&self) {
        let since = chrono::Utc::now().date_naive() - chrono::Duration::days(7);
        match stats::summary(&self.pool, since).await {
            Ok(s) => info!(
                since = %s.since,
                files_processed = s.files_processed,
                saved_gb = s.bytes_saved as f64 / (1024.0 * 1024.0 * 1024.0),
                failures = s.failures,
                sync_warnings = s.sync_warnings,
                by_status = ?s.by_status,
                "processing stats"
            ),
            Err(e) => warn!(error = %e, "cannot read stats"),
        }
    }
}

async fn worker_loop(
    slot: usize,
    pool: SqlitePool,
    worker: Arc<Worker>,
    order: PickOrder,
    window: ProcessingWindow,
    shutdown: CancellationToken,
    abort: CancellationToken,
) {
    debug!(slot, "worker started");
    while !shutdown.is_cancelled() {
        let claimed = if window.is_open_now() {
            jobs::claim_next(&pool, order).await
        } else {
            Ok(None)
        };

        match claimed {
            Ok(Some(job)) => {
                let job_id = job.id.clone();
                match worker.drive(job, &abort).await {
                    Ok(_) => {}
                    Err(StoreError::Conflict { .. }) => {
                        warn!(slot, job_id = %job_id, "job was reclaimed while in progress, dropping it");
                    }
                    Err(e) => {
                        error!(slot, job_id = %job_id, error = %e, "job store error while driving job");
                    }
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => error!(slot, error = %e, "cannot claim job"),
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(IDLE_POLL) => {}
        }
    }
    debug!(slot, "worker stopped");
}
