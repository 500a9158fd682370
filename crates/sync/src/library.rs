use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use recast_core::MediaKind;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::retry::{SyncRetry, retry_with_backoff};
use crate::{LibraryReference, LibraryService, SyncError};

/// What a successful catalogue sync did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub kind: MediaKind,
    pub library_id: i64,
    pub file_id: i64,
    pub old_relative_path: String,
    pub new_relative_path: String,
    /// False when the catalogue already pointed at the new file.
    pub path_updated: bool,
}

/// Routes catalogue updates to the service that owns each kind of file.
#[derive(Clone, Default)]
pub struct LibrarySync {
    services: HashMap<MediaKind, Arc<dyn LibraryService>>,
    retry: SyncRetry,
}

impl LibrarySync {
    pub fn new(retry: SyncRetry) -> Self {
        Self {
            services: HashMap::new(),
            retry,
        }
    }

    pub fn with_service(mut self, service: Arc<dyn LibraryService>) -> Self {
        self.services.insert(service.kind(), service);
        self
    }

    pub fn is_configured(&self, kind: MediaKind) -> bool {
        self.services.contains_key(&kind)
    }

    /// Ping every configured service. Failures are logged, not fatal.
    pub async fn check_connections(&self) {
        for (kind, service) in &self.services {
            match service.ping().await {
                Ok(()) => info!(%kind, "library service reachable"),
                Err(e) => warn!(%kind, error = %e, "library service unreachable"),
            }
        }
    }

    /// Point the catalogue entry for `source` at `replacement` and ask the
    /// service to rescan.
    ///
    /// Safe to repeat: if `source` is no longer catalogued but `replacement`
    /// already is, only the rescan is issued.
    pub async fn sync(
        &self,
        kind: MediaKind,
        source: &Path,
        replacement: &Path,
        cancel: &CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        let service = self
            .services
            .get(&kind)
            .ok_or(SyncError::NotConfigured(kind))?;

        let (reference, catalogued_path) = match self.lookup(service, source, cancel).await? {
            Some(r) => (r, source),
            None => match self.lookup(service, replacement, cancel).await? {
                Some(r) => (r, replacement),
                None => return Err(SyncError::NotFound(source.to_path_buf())),
            },
        };

        let new_relative_path = replace_file_name(&reference.relative_path, replacement);
        let path_updated = catalogued_path != replacement
            || reference.relative_path != new_relative_path;

        if path_updated {
            retry_with_backoff(&self.retry, cancel, "update_file_reference", |_| {
                service.update_file_reference(reference.file_id, &new_relative_path)
            })
            .await?;
        }
        retry_with_backoff(&self.retry, cancel, "trigger_rescan", |_| {
            service.trigger_rescan(reference.library_id)
        })
        .await?;

        Ok(SyncReport {
            kind,
            library_id: reference.library_id,
            file_id: reference.file_id,
            old_relative_path: reference.relative_path,
            new_relative_path,
            path_updated,
        })
    }

    async fn lookup(
        &self,
        service: &Arc<dyn LibraryService>,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<LibraryReference>, SyncError> {
        retry_with_backoff(&self.retry, cancel, "lookup", |_| service.lookup(path)).await
    }
}

/// Swap the last component of a catalogue-relative path for the file name
/// of `replacement`, keeping any season folder.
fn replace_file_name(relative_path: &str, replacement: &Path) -> String {
    let name = replacement
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match relative_path.rfind('/') {
        Some(idx) => format!("{}/{}", &relative_path[..idx], name),
        None => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        catalogue: Mutex<HashMap<PathBuf, LibraryReference>>,
        updates: Mutex<Vec<(i64, String)>>,
        rescans: Mutex<Vec<i64>>,
        fail_rescans: Mutex<u32>,
    }

    #[async_trait::async_trait]
    impl LibraryService for Recorder {
        fn kind(&self) -> MediaKind {
            MediaKind::Episode
        }

        async fn ping(&self) -> Result<(), SyncError> {
            Ok(())
        }

        async fn lookup(&self, path: &Path) -> Result<Option<LibraryReference>, SyncError> {
            Ok(self.catalogue.lock().unwrap().get(path).cloned())
        }

        async fn update_file_reference(
            &self,
            file_id: i64,
            new_relative_path: &str,
        ) -> Result<(), SyncError> {
            self.updates
                .lock()
                .unwrap()
                .push((file_id, new_relative_path.to_string()));
            Ok(())
        }

        async fn trigger_rescan(&self, library_id: i64) -> Result<(), SyncError> {
            let mut remaining = self.fail_rescans.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::Unavailable("502".into()));
            }
            self.rescans.lock().unwrap().push(library_id);
            Ok(())
        }
    }

    fn retry() -> SyncRetry {
        SyncRetry {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn catalogued(path: &str, rel: &str) -> Arc<Recorder> {
        let service = Recorder::default();
        service.catalogue.lock().unwrap().insert(
            PathBuf::from(path),
            LibraryReference {
                library_id: 7,
                file_id: 42,
                relative_path: rel.to_string(),
            },
        );
        Arc::new(service)
    }

    #[test]
    fn season_folder_is_kept() {
        assert_eq!(
            replace_file_name("Season 01/Show.S01E01.2160p.mkv", Path::new("/tv/Show/Season 01/Show.S01E01.1080p.mp4")),
            "Season 01/Show.S01E01.1080p.mp4"
        );
        assert_eq!(
            replace_file_name("Film.mkv", Path::new("/m/Film/Film.1080p.mp4")),
            "Film.1080p.mp4"
        );
    }

    #[tokio::test]
    async fn updates_path_then_rescans() {
        let service = catalogued("/tv/Show/Season 01/Show.S01E01.2160p.mkv", "Season 01/Show.S01E01.2160p.mkv");
        let sync = LibrarySync::new(retry()).with_service(service.clone());

        let report = sync
            .sync(
                MediaKind::Episode,
                Path::new("/tv/Show/Season 01/Show.S01E01.2160p.mkv"),
                Path::new("/tv/Show/Season 01/Show.S01E01.1080p.mp4"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(report.path_updated);
        assert_eq!(report.new_relative_path, "Season 01/Show.S01E01.1080p.mp4");
        assert_eq!(
            *service.updates.lock().unwrap(),
            vec![(42, "Season 01/Show.S01E01.1080p.mp4".to_string())]
        );
        assert_eq!(*service.rescans.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn already_synced_file_only_rescans() {
        let service = catalogued("/tv/Show/e.1080p.mp4", "e.1080p.mp4");
        let sync = LibrarySync::new(retry()).with_service(service.clone());

        let report = sync
            .sync(
                MediaKind::Episode,
                Path::new("/tv/Show/e.mkv"),
                Path::new("/tv/Show/e.1080p.mp4"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(!report.path_updated);
        assert!(service.updates.lock().unwrap().is_empty());
        assert_eq!(*service.rescans.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn transient_rescan_failure_is_retried() {
        let service = catalogued("/tv/Show/e.mkv", "e.mkv");
        *service.fail_rescans.lock().unwrap() = 2;
        let sync = LibrarySync::new(retry()).with_service(service.clone());

        sync.sync(
            MediaKind::Episode,
            Path::new("/tv/Show/e.mkv"),
            Path::new("/tv/Show/e.1080p.mp4"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(*service.rescans.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn unknown_file_and_missing_service_are_errors() {
        let service = catalogued("/tv/Show/other.mkv", "other.mkv");
        let sync = LibrarySync::new(retry()).with_service(service);
        let cancel = CancellationToken::new();

        let err = sync
            .sync(MediaKind::Episode, Path::new("/tv/Show/e.mkv"), Path::new("/tv/Show/e.mp4"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));

        let err = sync
            .sync(MediaKind::Movie, Path::new("/m/f.mkv"), Path::new("/m/f.mp4"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotConfigured(MediaKind::Movie)));
    }
}
