//! Sonarr and Radarr v3 API clients.

use std::path::{Path, PathBuf};
use std::time::Duration;

use recast_core::MediaKind;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{LibraryReference, LibraryService, SyncError};

/// Endpoint and credential for one *arr instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrConfig {
    pub url: String,
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

struct ArrHttp {
    client: Client,
    base_url: String,
    api_key: String,
}

impl ArrHttp {
    fn new(config: &ArrConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeout");
                Client::new()
            });

        Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v3{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SyncError> {
        debug!(path, "GET");
        let response = self
            .client
            .get(self.url(path))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await
            .map_err(transport)?;
        check(response)
            .await?
            .json()
            .await
            .map_err(|e| SyncError::Decode(format!("GET {path}: {e}")))
    }

    async fn put_json(&self, path: &str, body: &serde_json::Value) -> Result<(), SyncError> {
        debug!(path, "PUT");
        let response = self
            .client
            .put(self.url(path))
            .header("X-Api-Key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        check(response).await.map(drop)
    }

    async fn post_command<T: Serialize>(&self, command: &T) -> Result<(), SyncError> {
        let response = self
            .client
            .post(self.url("/command"))
            .header("X-Api-Key", &self.api_key)
            .json(command)
            .send()
            .await
            .map_err(transport)?;
        check(response).await.map(drop)
    }

    async fn ping(&self) -> Result<(), SyncError> {
        self.get_json::<serde_json::Value>("/system/status")
            .await
            .map(drop)
    }

    /// Rewrite `relativePath` on a file resource, keeping every other field
    /// the service returned.
    async fn rewrite_relative_path(
        &self,
        resource: &str,
        new_relative_path: &str,
    ) -> Result<(), SyncError> {
        let mut file: serde_json::Value = self.get_json(resource).await?;
        let Some(fields) = file.as_object_mut() else {
            return Err(SyncError::Decode(format!("{resource} is not an object")));
        };
        fields.insert(
            "relativePath".to_string(),
            serde_json::Value::String(new_relative_path.to_string()),
        );
        self.put_json(resource, &file).await
    }
}

fn transport(e: reqwest::Error) -> SyncError {
    SyncError::Unavailable(e.to_string())
}

async fn check(response: Response) -> Result<Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_client_error() {
        Err(SyncError::Rejected {
            status: status.as_u16(),
            body,
        })
    } else {
        Err(SyncError::Unavailable(format!("status {status}: {body}")))
    }
}

/// The folder in `folders` that contains `file`, preferring the deepest.
fn owning_folder<'a, T>(
    folders: &'a [T],
    file: &Path,
    path_of: impl Fn(&T) -> &str,
) -> Option<&'a T> {
    folders
        .iter()
        .filter(|f| file.starts_with(path_of(f)))
        .max_by_key(|f| path_of(f).len())
}

/// Does a catalogue file record point at `file`?
fn same_file(folder: &str, path: Option<&str>, relative_path: Option<&str>, file: &Path) -> bool {
    if let Some(path) = path {
        return Path::new(path) == file;
    }
    relative_path.is_some_and(|rel| PathBuf::from(folder).join(rel) == file)
}

// -- Sonarr --

#[derive(Debug, Deserialize)]
struct Series {
    id: i64,
    path: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EpisodeFile {
    id: i64,
    relative_path: Option<String>,
    path: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RescanSeriesCommand {
    name: &'static str,
    series_id: i64,
}

/// Episode-file catalogue.
pub struct SonarrClient(ArrHttp);

impl SonarrClient {
    pub fn new(config: &ArrConfig) -> Self {
        Self(ArrHttp::new(config))
    }
}

#[async_trait::async_trait]
impl LibraryService for SonarrClient {
    fn kind(&self) -> MediaKind {
        MediaKind::Episode
    }

    async fn ping(&self) -> Result<(), SyncError> {
        self.0.ping().await
    }

    async fn lookup(&self, path: &Path) -> Result<Option<LibraryReference>, SyncError> {
        let series: Vec<Series> = self.0.get_json("/series").await?;
        let Some(series) = owning_folder(&series, path, |s| s.path.as_str()) else {
            debug!(path = %path.display(), "no series folder contains file");
            return Ok(None);
        };

        let files: Vec<EpisodeFile> = self
            .0
            .get_json(&format!("/episodefile?seriesId={}", series.id))
            .await?;
        let found = files.into_iter().find(|f| {
            same_file(
                &series.path,
                f.path.as_deref(),
                f.relative_path.as_deref(),
                path,
            )
        });

        Ok(found.map(|f| LibraryReference {
            library_id: series.id,
            file_id: f.id,
            relative_path: f.relative_path.unwrap_or_else(|| relative_to(path, &series.path)),
        }))
    }

    async fn update_file_reference(
        &self,
        file_id: i64,
        new_relative_path: &str,
    ) -> Result<(), SyncError> {
        self.0
            .rewrite_relative_path(&format!("/episodefile/{file_id}"), new_relative_path)
            .await?;
        info!(file_id, relative_path = new_relative_path, "updated Sonarr episode file path");
        Ok(())
    }

    async fn trigger_rescan(&self, library_id: i64) -> Result<(), SyncError> {
        self.0
            .post_command(&RescanSeriesCommand {
                name: "RescanSeries",
                series_id: library_id,
            })
            .await?;
        info!(series_id = library_id, "triggered Sonarr series rescan");
        Ok(())
    }
}

// -- Radarr --

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Movie {
    id: i64,
    path: String,
    movie_file: Option<MovieFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MovieFile {
    id: i64,
    relative_path: Option<String>,
    path: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RescanMovieCommand {
    name: &'static str,
    movie_ids: Vec<i64>,
}

/// Movie-file catalogue.
pub struct RadarrClient(ArrHttp);

impl RadarrClient {
    pub fn new(config: &ArrConfig) -> Self {
        Self(ArrHttp::new(config))
    }
}

#[async_trait::async_trait]
impl LibraryService for RadarrClient {
    fn kind(&self) -> MediaKind {
        MediaKind::Movie
    }

    async fn ping(&self) -> Result<(), SyncError> {
        self.0.ping().await
    }

    async fn lookup(&self, path: &Path) -> Result<Option<LibraryReference>, SyncError> {
        let movies: Vec<Movie> = self.0.get_json("/movie").await?;
        let Some(movie) = owning_folder(&movies, path, |m| m.path.as_str()) else {
            debug!(path = %path.display(), "no movie folder contains file");
            return Ok(None);
        };
        let Some(file) = movie.movie_file.as_ref() else {
            return Ok(None);
        };
        if !same_file(
            &movie.path,
            file.path.as_deref(),
            file.relative_path.as_deref(),
            path,
        ) {
            return Ok(None);
        }

        Ok(Some(LibraryReference {
            library_id: movie.id,
            file_id: file.id,
            relative_path: file
                .relative_path
                .clone()
                .unwrap_or_else(|| relative_to(path, &movie.path)),
        }))
    }

    async fn update_file_reference(
        &self,
        file_id: i64,
        new_relative_path: &str,
    ) -> Result<(), SyncError> {
        self.0
            .rewrite_relative_path(&format!("/moviefile/{file_id}"), new_relative_path)
            .await?;
        info!(file_id, relative_path = new_relative_path, "updated Radarr movie file path");
        Ok(())
    }

    async fn trigger_rescan(&self, library_id: i64) -> Result<(), SyncError> {
        self.0
            .post_command(&RescanMovieCommand {
                name: "RescanMovie",
                movie_ids: vec![library_id],
            })
            .await?;
        info!(movie_id = library_id, "triggered Radarr movie rescan");
        Ok(())
    }
}

fn relative_to(file: &Path, folder: &str) -> String {
    file.strip_prefix(folder)
        .unwrap_or(file)
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deepest_folder_wins() {
        let folders = vec!["/tv".to_string(), "/tv/Show".to_string(), "/tv/Other".to_string()];
        let found = owning_folder(&folders, Path::new("/tv/Show/Season 01/e.mkv"), |s| s.as_str());
        assert_eq!(found.map(String::as_str), Some("/tv/Show"));
        assert!(owning_folder(&folders, Path::new("/movies/x.mkv"), |s| s.as_str()).is_none());
    }

    #[test]
    fn folder_prefix_is_component_wise() {
        let folders = vec!["/tv/Show".to_string()];
        assert!(owning_folder(&folders, Path::new("/tv/Show 2/e.mkv"), |s| s.as_str()).is_none());
    }

    #[test]
    fn file_match_prefers_absolute_path() {
        let file = Path::new("/tv/Show/Season 01/e.mkv");
        assert!(same_file("/tv/Show", Some("/tv/Show/Season 01/e.mkv"), None, file));
        assert!(!same_file("/tv/Show", Some("/tv/Show/Season 01/x.mkv"), Some("Season 01/e.mkv"), file));
        assert!(same_file("/tv/Show", None, Some("Season 01/e.mkv"), file));
        assert!(!same_file("/tv/Show", None, None, file));
    }

    #[test]
    fn relative_path_falls_back_to_the_whole_path() {
        assert_eq!(relative_to(Path::new("/m/Film/f.mkv"), "/m/Film"), "f.mkv");
        assert_eq!(relative_to(Path::new("/x/f.mkv"), "/m/Film"), "/x/f.mkv");
    }
}
