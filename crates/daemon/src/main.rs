use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use recast_daemon::disk::SystemSpaceProbe;
use recast_daemon::{Config, LogFormat};
use recast_transcoder::{FfmpegExecutor, FfprobeProber, gpu};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Config file: RECAST_CONFIG or defaults plus environment
    let config_path = std::env::var("RECAST_CONFIG").ok().map(PathBuf::from);
    let config = Config::load(config_path.as_deref(), |key| std::env::var(key).ok())
        .context("failed to load configuration")?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    match config.log_format {
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    let db_path = config.db_path.to_string_lossy().into_owned();
    if let Some(dir) = config.db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).context("failed to create database dir")?;
    }
    info!(db_path = %db_path, "opening job store");
    let pool = recast_db::open(&db_path)
        .await
        .context("failed to open job store")?;
    info!("migrations complete");

    std::fs::create_dir_all(&config.work_dir).context("failed to create working dir")?;

    // Encoder selection
    let caps = gpu::detect(&config.ffmpeg_path).await;
    let accel = match caps.select(config.hardware_accel) {
        Some(accel) if gpu::verify(&config.ffmpeg_path, accel).await => Some(accel),
        Some(accel) => {
            warn!(accel = %accel, "hardware encoder failed its test encode, using software");
            None
        }
        None => None,
    };
    info!(
        accel = accel.map(|a| a.to_string()).unwrap_or_else(|| "libx264".into()),
        "encoder selected"
    );

    let transcoder = config.transcoder();
    let prober = Arc::new(FfprobeProber::new(
        transcoder.ffprobe_path.clone(),
        transcoder.probe_timeout,
    ));
    let executor = Arc::new(FfmpegExecutor::new(transcoder, accel));

    let sync = recast_daemon::library_sync(&config);
    sync.check_connections().await;

    let orchestrator = recast_daemon::build(
        &config,
        pool,
        prober,
        executor,
        sync,
        Arc::new(SystemSpaceProbe),
    )
    .context("failed to build pipeline")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    orchestrator.run(shutdown).await?;
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
    shutdown.cancel();
}
