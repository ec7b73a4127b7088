//! Key and device id extraction
//!
//! Every unit needs two things before its files may be uploaded: the device
//! id (taken from the path) and the decrypt key (a MAC-address token read
//! from the key descriptor file, `systemInfo.txt` by default).
//!
//! All functions here do blocking filesystem I/O; async callers run them on
//! the blocking pool.

use once_cell::sync::Lazy;
use regex::Regex;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Upper bound on bytes read from a key descriptor
pub const MAX_KEY_FILE_BYTES: u64 = 64 * 1024;

/// 3-5 alphanumerics, hyphen, 2 alphanumerics, not embedded in a longer
/// alphanumeric run
static DEVICE_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[^0-9A-Za-z])([0-9A-Za-z]{3,5}-[0-9A-Za-z]{2})(?:[^0-9A-Za-z]|$)")
        .expect("device id pattern is valid")
});

/// MAC token with one consistent separator
static MAC_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2}){5}|[0-9A-Fa-f]{2}(?:-[0-9A-Fa-f]{2}){5}")
        .expect("mac pattern is valid")
});

static MAC_EXACT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[0-9A-Fa-f]{2}(?::[0-9A-Fa-f]{2}){5}|[0-9A-Fa-f]{2}(?:-[0-9A-Fa-f]{2}){5})$")
        .expect("mac pattern is valid")
});

/// Device id contained in a single path segment or file name
pub fn device_id_in_segment(segment: &str) -> Option<String> {
    DEVICE_ID_RE
        .captures(segment)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Device id from the deepest path segment that carries one
pub fn extract_device_id(path: &Path) -> Option<String> {
    let text = path.to_string_lossy();
    text.rsplit(['/', '\\'])
        .filter(|segment| !segment.is_empty())
        .find_map(device_id_in_segment)
}

/// True when `value` is exactly a MAC-address-shaped token
pub fn is_mac_like(value: &str) -> bool {
    MAC_EXACT_RE.is_match(value.trim())
}

/// First MAC token in `text`, scanning line by line, lowercased
pub fn parse_mac_token(text: &str) -> Option<String> {
    text.lines()
        .find_map(|line| MAC_RE.find(line))
        .map(|m| m.as_str().to_lowercase())
}

/// Try the supported text decodings in order until one yields a key.
///
/// Order: UTF-8 (BOM stripped), UTF-16LE, UTF-16BE, Latin-1.
pub fn parse_key_bytes(bytes: &[u8]) -> Option<String> {
    let utf8_body = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    if let Ok(text) = std::str::from_utf8(utf8_body) {
        if let Some(key) = parse_mac_token(text) {
            return Some(key);
        }
    }

    if bytes.len() >= 2 {
        for little_endian in [true, false] {
            let text = decode_utf16(bytes, little_endian);
            if let Some(key) = parse_mac_token(&text) {
                return Some(key);
            }
        }
    }

    let latin1: String = bytes.iter().map(|&b| b as char).collect();
    parse_mac_token(&latin1)
}

fn decode_utf16(bytes: &[u8], little_endian: bool) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| {
            if little_endian {
                u16::from_le_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16_lossy(&units)
        .trim_start_matches('\u{feff}')
        .to_string()
}

/// Read a key descriptor and extract its key
pub fn read_key_file(path: &Path) -> std::io::Result<Option<String>> {
    let mut bytes = Vec::new();
    File::open(path)?
        .take(MAX_KEY_FILE_BYTES)
        .read_to_end(&mut bytes)?;
    Ok(parse_key_bytes(&bytes))
}

/// Key descriptor inside `dir`, matching `file_name` case-insensitively
pub fn find_key_file_in_dir(dir: &Path, file_name: &str) -> Option<PathBuf> {
    let wanted = file_name.to_lowercase();
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .find(|entry| {
            entry.file_name().to_string_lossy().to_lowercase() == wanted
                && entry.file_type().map(|t| t.is_file()).unwrap_or(false)
        })
        .map(|entry| entry.path())
}

fn key_in_dir(dir: &Path, file_name: &str) -> Option<String> {
    let key_file = find_key_file_in_dir(dir, file_name)?;
    match read_key_file(&key_file) {
        Ok(Some(key)) => {
            tracing::debug!(path = %key_file.display(), "Decrypt key found");
            Some(key)
        }
        Ok(None) => {
            tracing::debug!(path = %key_file.display(), "Key descriptor has no MAC token");
            None
        }
        Err(e) => {
            tracing::debug!(path = %key_file.display(), error = %e, "Key descriptor unreadable");
            None
        }
    }
}

/// Depth-first search below `root` (inclusive) for the first usable key.
///
/// `depth_limit` counts directory levels below `root`.
pub fn find_key_downward(root: &Path, file_name: &str, depth_limit: usize) -> Option<String> {
    let mut stack = vec![(root.to_path_buf(), 0usize)];

    while let Some((dir, depth)) = stack.pop() {
        if let Some(key) = key_in_dir(&dir, file_name) {
            return Some(key);
        }
        if depth >= depth_limit {
            continue;
        }

        let mut children: Vec<PathBuf> = match std::fs::read_dir(&dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
                .map(|e| e.path())
                .collect(),
            Err(_) => continue,
        };
        // Reverse order so the alphabetically first child is visited first
        children.sort();
        for child in children.into_iter().rev() {
            stack.push((child, depth + 1));
        }
    }
    None
}

/// Walk from `start_dir` toward the filesystem root, at most `max_levels`
/// directories, returning the first usable key.
pub fn find_key_upward(start_dir: &Path, file_name: &str, max_levels: usize) -> Option<String> {
    let mut current = Some(start_dir);
    for _ in 0..max_levels {
        let dir = current?;
        if dir.parent().is_none() {
            break;
        }
        if let Some(key) = key_in_dir(dir, file_name) {
            return Some(key);
        }
        current = dir.parent();
    }
    None
}
