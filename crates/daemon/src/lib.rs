pub mod config;
pub mod disk;
pub mod files;
pub mod orchestrator;
pub mod window;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use recast_scanner::{Scanner, ScannerConfig};
use recast_sync::{LibrarySync, RadarrClient, SonarrClient};
use recast_transcoder::{Executor, Prober};
use sqlx::SqlitePool;

pub use config::{Config, ConfigError, LogFormat};
pub use orchestrator::{CycleReport, Orchestrator, Settings};

use crate::disk::SpaceProbe;
use crate::files::FileManager;
use crate::worker::Worker;

/// Catalogue clients for every enabled service.
pub fn library_sync(config: &Config) -> LibrarySync {
    let mut sync = LibrarySync::new(config.sync_retry);
    if config.sonarr.enabled {
        sync = sync.with_service(Arc::new(SonarrClient::new(&config.sonarr.arr())));
    }
    if config.radarr.enabled {
        sync = sync.with_service(Arc::new(RadarrClient::new(&config.radarr.arr())));
    }
    sync
}

/// Wire the pipeline together from a validated config.
pub fn build(
    config: &Config,
    pool: SqlitePool,
    prober: Arc<dyn Prober>,
    executor: Arc<dyn Executor>,
    sync: LibrarySync,
    space: Arc<dyn SpaceProbe>,
) -> Result<Orchestrator, ConfigError> {
    let window = config
        .processing_window()
        .map_err(|e| ConfigError::Invalid(vec![e]))?;
    let budget = config.retry_budget();
    let stale_timeout = Duration::from_secs(config.stale_timeout_secs);

    let scanner = Scanner::new(
        pool.clone(),
        prober,
        ScannerConfig {
            roots: config.libraries.clone(),
            min_age: config.min_file_age(),
            exclude: vec![config.work_dir.clone(), config.archive_dir.clone()],
        },
    );
    let files = FileManager::new(
        config.work_dir.clone(),
        config.archive_dir.clone(),
        config.retention,
        config.space_margin,
        space,
    );
    let worker = Worker::new(
        pool.clone(),
        executor,
        files,
        sync,
        budget,
        (stale_timeout / 4).max(Duration::from_secs(1)),
    );

    Ok(Orchestrator::new(
        pool,
        scanner,
        config.policy.clone(),
        Arc::new(worker),
        Settings {
            concurrency: config.concurrency,
            pick_order: config.pick_order,
            budget,
            stale_timeout,
            scan_interval: Duration::from_secs(config.scan_interval_secs),
            grace_period: Duration::from_secs(config.shutdown_grace_secs),
            window,
        },
    ))
}
