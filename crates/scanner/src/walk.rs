use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::filter;

/// Entry discovered during a filesystem walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEntry {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub mtime_ts: i64,
}

/// Walk a directory recursively and collect video files in path order,
/// skipping ignored patterns and anything under `exclude`.
pub fn walk_media_dir(root: &Path, exclude: &[PathBuf]) -> Vec<MediaEntry> {
    let mut entries = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            if e.file_type().is_dir() && filter::is_junk_dir(&name) {
                return false;
            }
            if filter::should_ignore(&name) {
                debug!(path = %e.path().display(), "skipping ignored entry");
                return false;
            }
            !exclude.iter().any(|x| e.path().starts_with(x))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(
                    path = %e.path().map(|p| p.display().to_string()).unwrap_or_default(),
                    error = %e,
                    "cannot read entry"
                );
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !filter::is_video_file(&name) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %entry.path().display(), error = %e, "cannot stat file");
                continue;
            }
        };
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        entries.push(MediaEntry {
            path: entry.into_path(),
            size_bytes: metadata.len(),
            mtime_ts: mtime,
        });
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn walk_is_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("Show B/Season 01")).unwrap();
        fs::create_dir_all(root.join("Show A")).unwrap();
        fs::create_dir_all(root.join("@eaDir")).unwrap();
        fs::create_dir_all(root.join(".recast/work")).unwrap();
        fs::write(root.join("Show B/Season 01/S01E02.mkv"), b"x").unwrap();
        fs::write(root.join("Show B/Season 01/S01E01.mkv"), b"x").unwrap();
        fs::write(root.join("Show A/A.mp4"), b"xy").unwrap();
        fs::write(root.join("Show A/A.nfo"), b"x").unwrap();
        fs::write(root.join("Show A/.A.1080p.mp4.partial"), b"x").unwrap();
        fs::write(root.join("@eaDir/thumb.mkv"), b"x").unwrap();
        fs::write(root.join(".recast/work/source.mkv"), b"x").unwrap();

        let entries = walk_media_dir(root, &[]);
        let names: Vec<_> = entries
            .iter()
            .map(|e| e.path.strip_prefix(root).unwrap().to_path_buf())
            .collect();
        assert_eq!(
            names,
            vec![
                PathBuf::from("Show A/A.mp4"),
                PathBuf::from("Show B/Season 01/S01E01.mkv"),
                PathBuf::from("Show B/Season 01/S01E02.mkv"),
            ]
        );
        assert_eq!(entries[0].size_bytes, 2);
        assert!(entries[0].mtime_ts > 0);
    }

    #[test]
    fn excluded_subtrees_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("work/job-1")).unwrap();
        fs::create_dir_all(root.join("movies")).unwrap();
        fs::write(root.join("work/job-1/source.mkv"), b"x").unwrap();
        fs::write(root.join("movies/Film.mkv"), b"x").unwrap();

        let entries = walk_media_dir(root, &[root.join("work")]);
        assert_eq!(entries.len(), 1);
        assert!(entries[0].path.ends_with("movies/Film.mkv"));
    }

    #[test]
    fn missing_root_yields_nothing() {
        assert!(walk_media_dir(Path::new("/nonexistent/library-xyz"), &[]).is_empty());
    }
}
