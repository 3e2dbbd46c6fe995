//! Deterministic archive layout.
//!
//! Every tier root holds the same date-derived hierarchy:
//! ```text
//! 2024/2024-03/pictures/sunset-pier.jpg
//! 2024/2024-03/videos/birthday.mp4
//! unknown/pictures/scan-0042.jpg
//! ```
//! A record's relative path never changes when it moves between tiers.

use chrono::{Datelike, NaiveDateTime};
use std::path::{Path, PathBuf};

use crate::error::{ArchiveError, Result};
use crate::store::MediaKind;

/// Classifies a file by extension against the configured lists.
pub fn media_kind_for(
    path: &Path,
    picture_extensions: &[String],
    video_extensions: &[String],
) -> Option<MediaKind> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    if picture_extensions.iter().any(|e| e == &ext) {
        Some(MediaKind::Picture)
    } else if video_extensions.iter().any(|e| e == &ext) {
        Some(MediaKind::Video)
    } else {
        None
    }
}

/// Sanitize a string for use in filenames
pub fn sanitize_filename(s: &str) -> String {
    let cleaned: String = s
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' => c,
            _ => '-',
        })
        .collect();
    let mut result = String::with_capacity(cleaned.len());
    let mut last_dash = false;
    for c in cleaned.chars() {
        if c == '-' {
            if !last_dash {
                result.push(c);
            }
            last_dash = true;
        } else {
            result.push(c);
            last_dash = false;
        }
    }
    result.trim_matches('-').to_string()
}

fn kind_segment(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Picture => "pictures",
        MediaKind::Video => "videos",
    }
}

/// Relative destination path for a file, derived from its capture time.
/// Files without a parseable capture time land under `unknown/`.
pub fn destination(
    capture_time: Option<&str>,
    kind: MediaKind,
    original_name: &str,
) -> PathBuf {
    let filename = sanitize_filename(original_name);
    let filename = if filename.is_empty() { "file".to_string() } else { filename };

    let bucket = capture_time
        .and_then(parse_capture_time)
        .map(|dt| format!("{}/{}-{:02}", dt.year(), dt.year(), dt.month()))
        .unwrap_or_else(|| "unknown".to_string());

    PathBuf::from(bucket).join(kind_segment(kind)).join(filename)
}

fn parse_capture_time(raw: &str) -> Option<NaiveDateTime> {
    // EXIF style first, then ISO-8601 as written by export tools.
    NaiveDateTime::parse_from_str(raw, "%Y:%m:%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S"))
        .ok()
}

/// Resolves filename conflicts under `root` by suffixing `-001`, `-002`, ...
/// before the extension until the path is free.
pub fn resolve_conflict(root: &Path, rel_path: &Path) -> PathBuf {
    if !root.join(rel_path).exists() {
        return rel_path.to_path_buf();
    }

    let stem = rel_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let ext = rel_path.extension().and_then(|s| s.to_str());
    let parent = rel_path.parent().unwrap_or_else(|| Path::new(""));

    for count in 1u32.. {
        let candidate_name = match ext {
            Some(ext) => format!("{stem}-{count:03}.{ext}"),
            None => format!("{stem}-{count:03}"),
        };
        let candidate = parent.join(candidate_name);
        if !root.join(&candidate).exists() {
            return candidate;
        }
    }
    unreachable!()
}

/// Copies a source file into the archive at its destination, then strips
/// write permission. Returns the final relative path.
pub fn place_original(source: &Path, root: &Path, rel_path: &Path) -> Result<PathBuf> {
    let rel_path = resolve_conflict(root, rel_path);
    let absolute = root.join(&rel_path);

    if let Some(parent) = absolute.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ArchiveError::io(parent, e))?;
    }
    std::fs::copy(source, &absolute).map_err(|e| ArchiveError::io(source, e))?;
    mark_read_only(&absolute)?;

    Ok(rel_path)
}

/// Archived payloads are immutable. Write permission comes off after the
/// first byte lands and stays off through every tier move.
pub fn mark_read_only(path: &Path) -> Result<()> {
    let metadata = std::fs::metadata(path).map_err(|e| ArchiveError::io(path, e))?;
    let mut permissions = metadata.permissions();
    permissions.set_readonly(true);
    std::fs::set_permissions(path, permissions).map_err(|e| ArchiveError::io(path, e))?;
    Ok(())
}
