//! Unit paths
//!
//! A unit is a device log bundle: a directory or a `.zip`/`.7z` archive
//! whose path carries a device id segment. Triggers from the watcher, the
//! initial discovery and the periodic sweep are all reduced to a unit path
//! here before they reach the scan queue.

use crate::services::key_extractor::device_id_in_segment;
use std::path::{Component, Path, PathBuf};

/// Archive extensions handled as units
pub const ARCHIVE_EXTENSIONS: [&str; 2] = [".zip", ".7z"];

/// True for `.zip` / `.7z` paths (case-insensitive)
pub fn is_archive_path(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    ARCHIVE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

/// Lowercase identity used for queue dedup and debounce maps
pub fn unit_key(path: &Path) -> String {
    path.to_string_lossy().to_lowercase()
}

fn segment_has_device_id(component: &Component<'_>) -> bool {
    match component {
        Component::Normal(segment) => device_id_in_segment(&segment.to_string_lossy()).is_some(),
        _ => false,
    }
}

/// Truncate `path` after its deepest device-id-bearing segment.
///
/// Returns `None` when the path cannot be reduced to a unit.
pub fn normalize_unit_path(path: &Path) -> Option<PathBuf> {
    let components: Vec<Component<'_>> = path.components().collect();

    if let Some(idx) = components.iter().rposition(segment_has_device_id) {
        return Some(components[..=idx].iter().collect());
    }

    if is_archive_path(path) {
        let named = path
            .file_name()
            .map(|n| device_id_in_segment(&n.to_string_lossy()).is_some())
            .unwrap_or(false);
        if named {
            return Some(path.to_path_buf());
        }
    }
    None
}

/// Find units below `root`.
///
/// Directories whose name carries a device id and archives whose name
/// carries one are units. With `descend_into_units` false the walk stops at
/// a unit directory (initial discovery); with true it keeps going (periodic
/// sweep, so nested units are seen as well). `max_depth` counts directory
/// levels below `root`.
pub fn discover_units(root: &Path, max_depth: usize, descend_into_units: bool) -> Vec<PathBuf> {
    let mut units = Vec::new();
    let mut stack = vec![(root.to_path_buf(), 0usize)];

    while let Some((dir, depth)) = stack.pop() {
        if depth > max_depth {
            continue;
        }
        let mut entries: Vec<(PathBuf, bool)> = match std::fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| {
                    let is_dir = e.file_type().map(|t| t.is_dir()).unwrap_or(false);
                    (e.path(), is_dir)
                })
                .collect(),
            Err(e) => {
                tracing::debug!(path = %dir.display(), error = %e, "Unit discovery could not read directory");
                continue;
            }
        };
        entries.sort();

        let mut subdirs = Vec::new();
        for (path, is_dir) in entries {
            let named = path
                .file_name()
                .map(|n| device_id_in_segment(&n.to_string_lossy()).is_some())
                .unwrap_or(false);

            if is_dir {
                if named {
                    units.push(path.clone());
                    if descend_into_units {
                        subdirs.push(path);
                    }
                } else {
                    subdirs.push(path);
                }
            } else if named && is_archive_path(&path) {
                units.push(path);
            }
        }
        for sub in subdirs.into_iter().rev() {
            stack.push((sub, depth + 1));
        }
    }
    units
}
