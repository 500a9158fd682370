/// Sidecars and OS clutter that sit next to media files.
static IGNORE_NAMES: &[&str] = &[
    ".DS_Store",
    "Thumbs.db",
    "@eaDir",
    ".nfo",
    ".txt",
    ".jpg",
    ".jpeg",
    ".png",
    ".srt",
    ".sub",
    ".idx",
    ".ass",
    ".ssa",
    ".partial",
];

/// Directories that never contain library media.
static JUNK_DIRS: &[&str] = &["@eaDir", "#recycle", ".Trash", "$RECYCLE.BIN", "lost+found"];

static VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "avi", "m4v", "mov", "wmv", "flv", "webm", "ts", "m2ts", "mts", "mpg", "mpeg",
    "mpe", "mpv", "3gp", "3g2", "ogv", "vob", "mxf", "f4v", "asf",
];

/// Check if a filename should be ignored.
pub fn should_ignore(filename: &str) -> bool {
    if filename.starts_with('.') {
        return true;
    }
    let lower = filename.to_lowercase();
    IGNORE_NAMES
        .iter()
        .any(|pat| lower == pat.to_lowercase() || lower.ends_with(pat))
}

pub fn is_junk_dir(name: &str) -> bool {
    JUNK_DIRS.iter().any(|d| d.eq_ignore_ascii_case(name))
}

/// Check if a file has a video extension.
pub fn is_video_file(filename: &str) -> bool {
    match filename.rsplit_once('.') {
        Some((_, ext)) => VIDEO_EXTENSIONS.contains(&ext.to_lowercase().as_str()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hidden_and_staging_files_are_ignored() {
        assert!(should_ignore(".Show.S01E01.1080p.mp4.partial"));
        assert!(should_ignore("Show.S01E01.mkv.partial"));
        assert!(should_ignore(".hidden.mkv"));
        assert!(should_ignore("Thumbs.db"));
        assert!(should_ignore("Movie.en.srt"));
        assert!(!should_ignore("Movie.mkv"));
    }

    #[test]
    fn junk_dirs() {
        assert!(is_junk_dir("@eaDir"));
        assert!(is_junk_dir("#recycle"));
        assert!(!is_junk_dir("Season 01"));
    }

    #[test]
    fn extension_without_dot_is_not_video() {
        assert!(!is_video_file("mkv"));
        assert!(is_video_file("a.MKV"));
    }
}
