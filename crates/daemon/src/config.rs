//! Daemon configuration: a TOML file, then `RECAST_*` environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use recast_core::{MediaKind, RetryBudget};
use recast_db::repo::jobs::PickOrder;
use recast_scanner::LibraryRoot;
use recast_sync::{ArrConfig, SyncRetry};
use recast_transcoder::{AccelPreference, Policy, TranscoderConfig, command};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::files::Retention;
use crate::window::ProcessingWindow;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {key}")]
    Env { key: &'static str, value: String },
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Endpoint of a Sonarr or Radarr instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub enabled: bool,
    pub url: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

impl ServiceConfig {
    fn with_url(url: &str) -> Self {
        Self {
            enabled: false,
            url: url.to_string(),
            api_key: String::new(),
            timeout_secs: 30,
        }
    }

    pub fn arr(&self) -> ArrConfig {
        ArrConfig {
            url: self.url.clone(),
            api_key: self.api_key.clone(),
            timeout_secs: self.timeout_secs,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::with_url("http://localhost")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// `HH:MM`, local time.
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub libraries: Vec<LibraryRoot>,
    pub db_path: PathBuf,
    /// Job-scoped working directories live here.
    pub work_dir: PathBuf,
    /// Originals are moved here after a successful replace.
    pub archive_dir: PathBuf,
    pub retention: Retention,
    pub min_file_age_hours: u64,
    pub policy: Policy,
    pub hardware_accel: AccelPreference,
    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,
    pub encode_timeout_secs: u64,
    pub concurrency: usize,
    pub pick_order: PickOrder,
    pub max_retries: u32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    /// In-flight jobs without a heartbeat for this long are reclaimed.
    pub stale_timeout_secs: u64,
    /// Free space required in the working area, as a multiple of the source size.
    pub space_margin: f64,
    /// Unset means always open.
    pub window: Option<WindowConfig>,
    pub scan_interval_secs: u64,
    pub shutdown_grace_secs: u64,
    pub log_format: LogFormat,
    pub sonarr: ServiceConfig,
    pub radarr: ServiceConfig,
    pub sync_retry: SyncRetry,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            libraries: Vec::new(),
            db_path: PathBuf::from("recast.db"),
            work_dir: PathBuf::from("/data/temp/working"),
            archive_dir: PathBuf::from("/data/temp/completed"),
            retention: Retention::default(),
            min_file_age_hours: 24,
            policy: Policy::default(),
            hardware_accel: AccelPreference::default(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            encode_timeout_secs: 6 * 3600,
            concurrency: 1,
            pick_order: PickOrder::default(),
            max_retries: 3,
            retry_base_delay_secs: 300,
            retry_max_delay_secs: 6 * 3600,
            stale_timeout_secs: 900,
            space_margin: 3.0,
            window: None,
            scan_interval_secs: 300,
            shutdown_grace_secs: 120,
            log_format: LogFormat::default(),
            sonarr: ServiceConfig::with_url("http://sonarr:8989"),
            radarr: ServiceConfig::with_url("http://radarr:7878"),
            sync_retry: SyncRetry::default(),
        }
    }
}

impl Config {
    /// Read `path` (or start from defaults), apply environment overrides
    /// from `env`, then validate.
    pub fn load(
        path: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let content =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                        path: path.to_path_buf(),
                        source,
                    })?;
                toml::from_str(&content)?
            }
            None => Config::default(),
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = env("RECAST_DB") {
            self.db_path = v.into();
        }
        if let Some(v) = env("RECAST_WORK_DIR") {
            self.work_dir = v.into();
        }
        if let Some(v) = env("RECAST_ARCHIVE_DIR") {
            self.archive_dir = v.into();
        }
        for (key, kind) in [
            ("RECAST_TV_PATH", MediaKind::Episode),
            ("RECAST_MOVIES_PATH", MediaKind::Movie),
        ] {
            if let Some(v) = env(key) {
                let path = PathBuf::from(v);
                if !self.libraries.iter().any(|l| l.path == path) {
                    self.libraries.push(LibraryRoot { path, kind });
                }
            }
        }
        if let Some(v) = env("RECAST_CONCURRENCY") {
            self.concurrency = v.parse().map_err(|_| ConfigError::Env {
                key: "RECAST_CONCURRENCY",
                value: v.clone(),
            })?;
        }
        if let Some(v) = env("RECAST_HARDWARE_ACCEL") {
            self.hardware_accel = serde_json::from_value(serde_json::Value::String(v.clone()))
                .map_err(|_| ConfigError::Env {
                    key: "RECAST_HARDWARE_ACCEL",
                    value: v,
                })?;
        }
        if let Some(v) = env("RECAST_LOG_FORMAT") {
            self.log_format = serde_json::from_value(serde_json::Value::String(v.clone()))
                .map_err(|_| ConfigError::Env {
                    key: "RECAST_LOG_FORMAT",
                    value: v,
                })?;
        }
        for (prefix, service) in [
            ("RECAST_SONARR", &mut self.sonarr),
            ("RECAST_RADARR", &mut self.radarr),
        ] {
            if let Some(v) = env(&format!("{prefix}_URL")) {
                service.url = v;
                service.enabled = true;
            }
            if let Some(v) = env(&format!("{prefix}_API_KEY")) {
                service.api_key = v;
                service.enabled = true;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.libraries.is_empty() {
            errors.push("at least one library path must be configured".to_string());
        }
        let target = self.policy.target_codec.to_ascii_lowercase();
        if !command::SUPPORTED_CODECS.contains(&target.as_str()) {
            errors.push(format!(
                "target codec must be one of {}, got {:?}",
                command::SUPPORTED_CODECS.join(", "),
                self.policy.target_codec
            ));
        }
        if self.policy.quality > 51 {
            errors.push(format!(
                "quality must be between 0 and 51, got {}",
                self.policy.quality
            ));
        }
        if !(64..=320).contains(&self.policy.audio_bitrate_kbps) {
            errors.push(format!(
                "audio bitrate must be between 64 and 320 kbps, got {}",
                self.policy.audio_bitrate_kbps
            ));
        }
        if self.concurrency == 0 {
            errors.push("concurrency must be at least 1".to_string());
        }
        if !(self.space_margin >= 1.0) {
            errors.push(format!(
                "space margin must be at least 1.0, got {}",
                self.space_margin
            ));
        }
        if let Err(e) = self.processing_window() {
            errors.push(e);
        }
        for (name, service) in [("sonarr", &self.sonarr), ("radarr", &self.radarr)] {
            if service.enabled && service.api_key.is_empty() {
                errors.push(format!("{name} is enabled but has no API key"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    pub fn processing_window(&self) -> Result<ProcessingWindow, String> {
        match &self.window {
            None => Ok(ProcessingWindow::always()),
            Some(w) => ProcessingWindow::parse(&w.start, &w.end),
        }
    }

    pub fn retry_budget(&self) -> RetryBudget {
        RetryBudget {
            max_retries: self.max_retries,
            base_delay: Duration::from_secs(self.retry_base_delay_secs),
            max_delay: Duration::from_secs(self.retry_max_delay_secs),
        }
    }

    pub fn transcoder(&self) -> TranscoderConfig {
        TranscoderConfig {
            ffmpeg_path: self.ffmpeg_path.clone(),
            ffprobe_path: self.ffprobe_path.clone(),
            encode_timeout: Duration::from_secs(self.encode_timeout_secs),
            ..TranscoderConfig::default()
        }
    }

    pub fn min_file_age(&self) -> Duration {
        Duration::from_secs(self.min_file_age_hours * 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    const MINIMAL: &str = r#"
        [[libraries]]
        path = "/data/tv"
        kind = "episode"
    "#;

    fn parse(toml_text: &str) -> Config {
        toml::from_str(toml_text).unwrap()
    }

    #[test]
    fn defaults_follow_the_documented_values() {
        let config = parse(MINIMAL);
        assert_eq!(config.min_file_age(), Duration::from_secs(24 * 3600));
        assert_eq!(config.policy.target_height, 1080);
        assert_eq!(config.policy.quality, 23);
        assert_eq!(config.space_margin, 3.0);
        assert_eq!(config.pick_order, PickOrder::OldestFirst);
        assert_eq!(config.retention, Retention::Archive);
        assert!(!config.sonarr.enabled);
        config.validate().unwrap();
    }

    #[test]
    fn full_file_parses() {
        let config = parse(
            r#"
            db_path = "/var/lib/recast/recast.db"
            retention = "delete"
            hardware_accel = "none"
            concurrency = 2
            pick_order = "largest_first"
            log_format = "json"

            [[libraries]]
            path = "/data/movies"
            kind = "movie"

            [policy]
            target_height = 720
            quality = 20
            allowed_codecs = ["h264"]

            [window]
            start = "22:00"
            end = "06:00"

            [radarr]
            enabled = true
            url = "http://radarr:7878"
            api_key = "abc"

            [sync_retry]
            max_retries = 5
            base_delay = 1
            max_delay = 10
            "#,
        );
        assert_eq!(config.retention, Retention::Delete);
        assert_eq!(config.hardware_accel, AccelPreference::Software);
        assert_eq!(config.pick_order, PickOrder::LargestFirst);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.policy.target_height, 720);
        assert_eq!(config.policy.audio_codec, "aac");
        assert_eq!(config.sync_retry.max_retries, 5);
        assert_eq!(config.radarr.arr().api_key, "abc");
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_paths_and_services() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("RECAST_DB", "/tmp/x.db"),
                ("RECAST_TV_PATH", "/media/tv"),
                ("RECAST_SONARR_URL", "http://sonarr:8989"),
                ("RECAST_SONARR_API_KEY", "key"),
                ("RECAST_HARDWARE_ACCEL", "qsv"),
                ("RECAST_CONCURRENCY", "3"),
            ]))
            .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.libraries[0].kind, MediaKind::Episode);
        assert!(config.sonarr.enabled);
        assert_eq!(config.hardware_accel, AccelPreference::Qsv);
        assert_eq!(config.concurrency, 3);
        config.validate().unwrap();
    }

    #[test]
    fn bad_env_value_is_reported() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[("RECAST_CONCURRENCY", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { key: "RECAST_CONCURRENCY", .. }));
    }

    #[test]
    fn validation_collects_every_problem() {
        let mut config = Config::default();
        config.policy.quality = 60;
        config.policy.target_codec = "av1".into();
        config.policy.audio_bitrate_kbps = 32;
        config.concurrency = 0;
        config.window = Some(WindowConfig {
            start: "02:00".into(),
            end: "02:00".into(),
        });
        config.sonarr.enabled = true;

        let ConfigError::Invalid(errors) = config.validate().unwrap_err() else {
            panic!("expected validation errors");
        };
        assert_eq!(errors.len(), 7);
        assert!(errors.iter().any(|e| e.contains("library")));
        assert!(errors.iter().any(|e| e.contains("\"av1\"")));
        assert!(errors.iter().any(|e| e.contains("sonarr")));
    }

    #[test]
    fn load_reads_file_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recast.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = Config::load(Some(&path), env(&[("RECAST_WORK_DIR", "/scratch")])).unwrap();
        assert_eq!(config.work_dir, PathBuf::from("/scratch"));
        assert_eq!(config.libraries.len(), 1);

        let err = Config::load(Some(&dir.path().join("missing.toml")), env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
