//! Content scanning and directory discovery.
//!
//! The scanner is stateless: it reads a file, counts the marker string
//! and forgets about it.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::WatcherError;
use crate::Result;

/// Result of scanning a single path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Number of marker occurrences in the file.
    Hits(u64),
    /// The path is a directory and was skipped.
    Directory,
}

/// Count case-insensitive, non-overlapping occurrences of `marker`.
///
/// An empty marker never matches.
#[must_use]
pub fn count_marker(content: &str, marker: &str) -> u64 {
    if marker.is_empty() {
        return 0;
    }

    let content = content.to_lowercase();
    let marker = marker.to_lowercase();
    content.matches(marker.as_str()).count() as u64
}

/// Read a file fully and count marker occurrences.
///
/// Invalid UTF-8 is decoded lossily so binary files still scan.
///
/// # Errors
///
/// Returns a read error if the path cannot be stat'ed or read.
pub fn scan_file(path: &Path, marker: &str) -> Result<ScanOutcome> {
    let metadata = std::fs::metadata(path).map_err(|e| WatcherError::read(path, e))?;
    if metadata.is_dir() {
        tracing::debug!(path = %path.display(), "Skipping directory");
        return Ok(ScanOutcome::Directory);
    }

    let bytes = std::fs::read(path).map_err(|e| WatcherError::read(path, e))?;
    let hits = count_marker(&String::from_utf8_lossy(&bytes), marker);

    tracing::debug!(path = %path.display(), bytes = bytes.len(), hits, "Scanned file");
    Ok(ScanOutcome::Hits(hits))
}

/// An entry found while walking the watched tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPath {
    pub path: PathBuf,
    pub is_directory: bool,
}

/// Walk statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WalkStats {
    pub files: u64,
    pub directories: u64,
    pub errors: u64,
}

/// Walk `root` (inclusive) and hand every entry to `visit`.
///
/// Entries that cannot be read are logged and skipped. The walk stops
/// early when `visit` returns `false`.
pub fn walk_directory(root: &Path, mut visit: impl FnMut(DiscoveredPath) -> bool) -> WalkStats {
    let mut stats = WalkStats::default();

    tracing::info!(path = %root.display(), "Starting directory walk");

    for entry in WalkDir::new(root).follow_links(false) {
        match entry {
            Ok(entry) => {
                let is_directory = entry.file_type().is_dir();
                if is_directory {
                    stats.directories += 1;
                } else {
                    stats.files += 1;
                }

                let discovered = DiscoveredPath {
                    path: entry.into_path(),
                    is_directory,
                };
                if !visit(discovered) {
                    tracing::warn!("Walk consumer closed; stopping early");
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Error walking directory");
                stats.errors += 1;
            }
        }
    }

    tracing::info!(
        path = %root.display(),
        files = stats.files,
        directories = stats.directories,
        errors = stats.errors,
        "Directory walk complete"
    );

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_count_marker_case_insensitive() {
        assert_eq!(
            count_marker("Hi THERE you are!! there you are!!", "there you are!!"),
            2
        );
    }

    #[test]
    fn test_count_marker_non_overlapping() {
        assert_eq!(count_marker("aaaa", "aa"), 2);
        assert_eq!(count_marker("abababa", "ABA"), 2);
    }

    #[test]
    fn test_count_marker_edge_cases() {
        assert_eq!(count_marker("anything", ""), 0);
        assert_eq!(count_marker("", "x"), 0);
        assert_eq!(count_marker("no match here", "marker"), 0);
    }

    #[test]
    fn test_scan_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("notes.txt");
        fs::write(&path, "There you are!!\nand THERE YOU ARE!!").unwrap();

        assert_eq!(
            scan_file(&path, "there you are!!").unwrap(),
            ScanOutcome::Hits(2)
        );
    }

    #[test]
    fn test_scan_binary_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("blob.bin");
        let mut bytes = vec![0xff, 0xfe, 0x00];
        bytes.extend_from_slice(b"marker");
        fs::write(&path, bytes).unwrap();

        assert_eq!(scan_file(&path, "MARKER").unwrap(), ScanOutcome::Hits(1));
    }

    #[test]
    fn test_scan_directory_is_skipped() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(
            scan_file(tmp.path(), "x").unwrap(),
            ScanOutcome::Directory
        );
    }

    #[test]
    fn test_scan_missing_file_is_read_error() {
        let tmp = TempDir::new().unwrap();
        let err = scan_file(&tmp.path().join("gone.txt"), "x").unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn test_walk_directory() {
        let tmp = TempDir::new().unwrap();
        let sub = tmp.path().join("sub");
        fs::create_dir(&sub).unwrap();
        fs::write(tmp.path().join("a.txt"), "a").unwrap();
        fs::write(sub.join("b.txt"), "b").unwrap();

        let mut seen = Vec::new();
        let stats = walk_directory(tmp.path(), |d| {
            seen.push(d);
            true
        });

        assert_eq!(stats.files, 2);
        assert_eq!(stats.directories, 2);
        assert_eq!(stats.errors, 0);
        assert!(seen
            .iter()
            .any(|d| d.path == tmp.path() && d.is_directory));
        assert!(seen
            .iter()
            .any(|d| d.path.ends_with("sub/b.txt") && !d.is_directory));
    }

    #[test]
    fn test_walk_stops_when_visitor_declines() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "a").unwrap();
        fs::write(tmp.path().join("b.txt"), "b").unwrap();

        let mut visited = 0;
        walk_directory(tmp.path(), |_| {
            visited += 1;
            false
        });
        assert_eq!(visited, 1);
    }

    #[test]
    fn test_walk_missing_root_counts_error() {
        let tmp = TempDir::new().unwrap();
        let stats = walk_directory(&tmp.path().join("missing"), |_| true);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.files, 0);
    }
}
