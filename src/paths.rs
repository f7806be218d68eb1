//! Filesystem layout: default directories and conversation-id file names.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Longest encoded key placed verbatim in a file name. Longer ids are
/// replaced by a digest so names stay under the 255-byte filesystem limit.
pub const MAX_ENCODED_KEY_LEN: usize = 128;

/// Leading marker of a digest key; `encode_key` never emits it.
const DIGEST_MARKER: char = '~';

/// Resumer config directory (e.g. `~/.config/resumer/`).
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("resumer"))
}

/// Default spool directory: the platform data dir, else the system temp dir.
pub fn default_spool_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("resumer").join("spool"))
        .unwrap_or_else(|| std::env::temp_dir().join("resumer-spool"))
}

/// Default shared locator directory for the `file` backend.
pub fn default_locator_dir() -> PathBuf {
    std::env::temp_dir().join("resumer-locators")
}

/// Encode an opaque conversation id into a file-name-safe key.
///
/// ASCII alphanumerics, `-` and `_` pass through; every other byte becomes `%XX`.
pub fn encode_key(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for b in id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Inverse of [`encode_key`]. Returns `None` for malformed input.
pub fn decode_key(key: &str) -> Option<String> {
    let bytes = key.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = key.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// File-name key for an id: the encoded id, or `~<sha256>` when that would be
/// longer than [`MAX_ENCODED_KEY_LEN`].
pub fn file_key(id: &str) -> String {
    let encoded = encode_key(id);
    if encoded.len() <= MAX_ENCODED_KEY_LEN {
        return encoded;
    }
    format!("{DIGEST_MARKER}{}", hex::encode(Sha256::digest(id.as_bytes())))
}

/// Build `<prefix><file key><suffix>`.
pub fn keyed_file_name(prefix: &str, id: &str, suffix: &str) -> String {
    format!("{prefix}{}{suffix}", file_key(id))
}

/// Key part of a file name with the given shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKey {
    /// Decoded conversation id
    Id(String),
    /// Digest of an id too long for the name; the file content names the id
    Digest,
}

/// Parse the key out of a keyed file name, if it has the given shape.
pub fn key_from_file_name(name: &str, prefix: &str, suffix: &str) -> Option<FileKey> {
    let key = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
    if key.is_empty() {
        return None;
    }
    if key.starts_with(DIGEST_MARKER) {
        return Some(FileKey::Digest);
    }
    decode_key(key).map(FileKey::Id)
}

/// Files directly inside `dir` whose names match `prefix*suffix`.
pub fn list_keyed_files(dir: &Path, prefix: &str, suffix: &str) -> Vec<(FileKey, PathBuf)> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Vec::new(),
    };

    let mut out = Vec::new();
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(key) = key_from_file_name(name, prefix, suffix) {
            out.push((key, entry.path()));
        }
    }
    out
}

/// Time since the file was last modified; `None` if it cannot be stat'ed.
pub fn modified_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    )
}
