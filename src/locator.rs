//! Locator directory - cluster-wide map of conversation id to owning node
//!
//! Entries carry a TTL. The owning node refreshes its entry while a recording
//! is active; a node that disappears simply stops refreshing and its entry
//! expires. Backends:
//!
//! - [`MemoryDirectory`]: process-local map, shared by nodes living in one process.
//! - [`FileDirectory`]: one JSON file per conversation on a shared filesystem.
//! - [`NoopDirectory`]: unavailable; the resumer runs single-node.

use crate::address::NodeAddress;
use crate::config::atomic_write;
use crate::paths;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace, warn};

const LOCATOR_FILE_PREFIX: &str = "locator-";
const LOCATOR_FILE_SUFFIX: &str = ".json";
const TOMBSTONE_EXTENSION: &str = "purge";

/// Age after which a leftover tombstone from a crashed purge is deleted
const STALE_TOMBSTONE_AGE: Duration = Duration::from_secs(600);

/// Cap for TTLs that overflow `Instant`
const MAX_MEMORY_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Errors raised by a directory backend
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("locator directory unavailable")]
    Unavailable,
    #[error("locator directory IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt locator entry for {conversation_id}: {message}")]
    Corrupt {
        conversation_id: String,
        message: String,
    },
}

/// What the named node holds for the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorKind {
    /// The node owns an active recording
    Recording,
    /// The node finished a recording and still retains it for replay
    Retained,
}

/// Directory value: which node, and what it holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub node: NodeAddress,
    pub kind: LocatorKind,
}

impl Locator {
    pub fn recording(node: NodeAddress) -> Self {
        Self {
            node,
            kind: LocatorKind::Recording,
        }
    }

    pub fn retained(node: NodeAddress) -> Self {
        Self {
            node,
            kind: LocatorKind::Retained,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.kind == LocatorKind::Recording
    }
}

/// A stored entry, as persisted by [`FileDirectory`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocatorEntry {
    pub conversation_id: String,
    #[serde(flatten)]
    pub locator: Locator,
    pub expires_at: DateTime<Utc>,
}

impl LocatorEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Cluster-visible TTL key/value directory.
///
/// Implementations must be cheap to call from async code; all shipped
/// backends complete without awaiting.
pub trait LocatorDirectory: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &str;

    /// Whether lookups can reach a shared directory at all.
    fn available(&self) -> bool;

    fn get(&self, conversation_id: &str) -> Result<Option<Locator>, DirectoryError>;

    fn upsert(
        &self,
        conversation_id: &str,
        locator: &Locator,
        ttl: Duration,
    ) -> Result<(), DirectoryError>;

    fn remove(&self, conversation_id: &str) -> Result<(), DirectoryError>;

    /// True only while some node advertises an active recording.
    fn exists(&self, conversation_id: &str) -> Result<bool, DirectoryError> {
        Ok(self
            .get(conversation_id)?
            .is_some_and(|locator| locator.is_recording()))
    }

    /// Drop expired entries eagerly. Returns how many were removed.
    fn purge_expired(&self) -> usize {
        0
    }
}

/// Directory backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryKind {
    #[default]
    None,
    Memory,
    File,
}

/// Build the configured backend.
pub fn open_directory(
    kind: DirectoryKind,
    path: Option<&Path>,
) -> Result<Arc<dyn LocatorDirectory>, DirectoryError> {
    Ok(match kind {
        DirectoryKind::None => Arc::new(NoopDirectory),
        DirectoryKind::Memory => Arc::new(MemoryDirectory::new()),
        DirectoryKind::File => {
            let dir = path
                .map(Path::to_path_buf)
                .unwrap_or_else(paths::default_locator_dir);
            Arc::new(FileDirectory::open(dir)?)
        }
    })
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// In-process directory with lazy expiry
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    entries: Mutex<HashMap<String, (Locator, Instant)>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unexpired entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|(_, exp)| *exp > now).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LocatorDirectory for MemoryDirectory {
    fn name(&self) -> &str {
        "memory"
    }

    fn available(&self) -> bool {
        true
    }

    fn get(&self, conversation_id: &str) -> Result<Option<Locator>, DirectoryError> {
        let mut entries = self.entries.lock().map_err(|_| DirectoryError::Unavailable)?;
        let now = Instant::now();
        match entries.get(conversation_id) {
            Some((locator, expires_at)) if *expires_at > now => Ok(Some(locator.clone())),
            Some(_) => {
                trace!(%conversation_id, "memory locator expired");
                entries.remove(conversation_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn upsert(
        &self,
        conversation_id: &str,
        locator: &Locator,
        ttl: Duration,
    ) -> Result<(), DirectoryError> {
        let now = Instant::now();
        let expires_at = now.checked_add(ttl).unwrap_or(now + MAX_MEMORY_TTL);
        let mut entries = self.entries.lock().map_err(|_| DirectoryError::Unavailable)?;
        entries.insert(conversation_id.to_string(), (locator.clone(), expires_at));
        Ok(())
    }

    fn remove(&self, conversation_id: &str) -> Result<(), DirectoryError> {
        let mut entries = self.entries.lock().map_err(|_| DirectoryError::Unavailable)?;
        entries.remove(conversation_id);
        Ok(())
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        before - entries.len()
    }
}

// ---------------------------------------------------------------------------
// File
// ---------------------------------------------------------------------------

/// Directory kept as JSON files under a (typically shared) path
#[derive(Debug)]
pub struct FileDirectory {
    root: PathBuf,
}

impl FileDirectory {
    pub fn open(root: PathBuf) -> Result<Self, DirectoryError> {
        std::fs::create_dir_all(&root)?;
        debug!(path = %root.display(), "file locator directory ready");
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, conversation_id: &str) -> PathBuf {
        self.root.join(paths::keyed_file_name(
            LOCATOR_FILE_PREFIX,
            conversation_id,
            LOCATOR_FILE_SUFFIX,
        ))
    }

    fn read_entry(&self, conversation_id: &str) -> Result<Option<LocatorEntry>, DirectoryError> {
        read_entry_at(&self.entry_path(conversation_id), conversation_id)
    }

    /// Delete the entry at `path` if it is still expired or corrupt.
    ///
    /// The file is first moved aside so a concurrent upsert lands on a fresh
    /// path. If the moved file turns out to be live after all, it is linked
    /// back unless a newer entry already took its place.
    fn purge_path(&self, path: &Path, now: DateTime<Utc>) -> bool {
        let tomb = tombstone_path(path);
        if std::fs::rename(path, &tomb).is_err() {
            return false;
        }
        let label = path.display().to_string();
        let live = matches!(read_entry_at(&tomb, &label), Ok(Some(entry)) if !entry.is_expired(now));
        if !live {
            let _ = std::fs::remove_file(&tomb);
            return true;
        }
        match std::fs::hard_link(&tomb, path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                warn!(path = %label, error = %e, "failed to restore locator entry");
                if std::fs::rename(&tomb, path).is_ok() {
                    return false;
                }
            }
        }
        trace!(path = %label, "kept locator refreshed during purge");
        let _ = std::fs::remove_file(&tomb);
        false
    }

    fn remove_stale_tombstones(&self) {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_tomb = path
                .extension()
                .is_some_and(|ext| ext == TOMBSTONE_EXTENSION);
            if is_tomb && paths::modified_age(&path).is_some_and(|age| age >= STALE_TOMBSTONE_AGE) {
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}

fn read_entry_at(path: &Path, label: &str) -> Result<Option<LocatorEntry>, DirectoryError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| DirectoryError::Corrupt {
            conversation_id: label.to_string(),
            message: e.to_string(),
        })
}

/// Unique sibling name that no keyed-file listing matches.
fn tombstone_path(path: &Path) -> PathBuf {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(
        ".{}-{}.{TOMBSTONE_EXTENSION}",
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ));
    path.with_file_name(name)
}

impl LocatorDirectory for FileDirectory {
    fn name(&self) -> &str {
        "file"
    }

    fn available(&self) -> bool {
        self.root.is_dir()
    }

    fn get(&self, conversation_id: &str) -> Result<Option<Locator>, DirectoryError> {
        let entry = match self.read_entry(conversation_id) {
            Ok(Some(entry)) => entry,
            Ok(None) => return Ok(None),
            Err(DirectoryError::Corrupt { message, .. }) => {
                // Left for purge_expired; reads never delete.
                warn!(%conversation_id, %message, "ignoring corrupt locator entry");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if entry.is_expired(Utc::now()) {
            trace!(%conversation_id, "file locator expired");
            return Ok(None);
        }
        Ok(Some(entry.locator))
    }

    fn upsert(
        &self,
        conversation_id: &str,
        locator: &Locator,
        ttl: Duration,
    ) -> Result<(), DirectoryError> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let entry = LocatorEntry {
            conversation_id: conversation_id.to_string(),
            locator: locator.clone(),
            expires_at: Utc::now().checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        };
        let json = serde_json::to_vec(&entry).map_err(std::io::Error::other)?;
        atomic_write(&self.entry_path(conversation_id), &json)?;
        Ok(())
    }

    fn remove(&self, conversation_id: &str) -> Result<(), DirectoryError> {
        match std::fs::remove_file(self.entry_path(conversation_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        for (_, path) in paths::list_keyed_files(&self.root, LOCATOR_FILE_PREFIX, LOCATOR_FILE_SUFFIX)
        {
            match read_entry_at(&path, &path.display().to_string()) {
                Ok(Some(entry)) if !entry.is_expired(now) => continue,
                Ok(None) => continue,
                Ok(Some(_)) | Err(DirectoryError::Corrupt { .. }) => {}
                Err(_) => continue,
            }
            if self.purge_path(&path, now) {
                removed += 1;
            }
        }
        self.remove_stale_tombstones();
        removed
    }
}

// ---------------------------------------------------------------------------
// Noop
// ---------------------------------------------------------------------------

/// Always-empty directory used when no shared store is configured
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDirectory;

impl LocatorDirectory for NoopDirectory {
    fn name(&self) -> &str {
        "none"
    }

    fn available(&self) -> bool {
        false
    }

    fn get(&self, _conversation_id: &str) -> Result<Option<Locator>, DirectoryError> {
        Ok(None)
    }

    fn upsert(
        &self,
        _conversation_id: &str,
        _locator: &Locator,
        _ttl: Duration,
    ) -> Result<(), DirectoryError> {
        Ok(())
    }

    fn remove(&self, _conversation_id: &str) -> Result<(), DirectoryError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn node(s: &str) -> NodeAddress {
        NodeAddress::parse(s).unwrap()
    }

    #[test]
    fn memory_upsert_get_remove() {
        let dir = MemoryDirectory::new();
        assert!(dir.get("c1").unwrap().is_none());

        dir.upsert("c1", &Locator::recording(node("a:1")), Duration::from_secs(10))
            .unwrap();
        let found = dir.get("c1").unwrap().unwrap();
        assert_eq!(found.node, node("a:1"));
        assert!(dir.exists("c1").unwrap());
        assert_eq!(dir.len(), 1);

        dir.remove("c1").unwrap();
        assert!(dir.get("c1").unwrap().is_none());
        assert!(!dir.exists("c1").unwrap());
    }

    #[test]
    fn memory_entry_expires() {
        let dir = MemoryDirectory::new();
        dir.upsert("c1", &Locator::recording(node("a:1")), Duration::from_millis(20))
            .unwrap();
        assert!(dir.exists("c1").unwrap());
        std::thread::sleep(Duration::from_millis(40));
        assert!(dir.get("c1").unwrap().is_none());
        assert!(dir.is_empty());
    }

    #[test]
    fn memory_refresh_extends_ttl() {
        let dir = MemoryDirectory::new();
        let loc = Locator::recording(node("a:1"));
        dir.upsert("c1", &loc, Duration::from_millis(60)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        dir.upsert("c1", &loc, Duration::from_millis(60)).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        assert!(dir.exists("c1").unwrap());
    }

    #[test]
    fn retained_entries_do_not_count_as_existing() {
        let dir = MemoryDirectory::new();
        dir.upsert("c1", &Locator::retained(node("a:1")), Duration::from_secs(10))
            .unwrap();
        assert!(dir.get("c1").unwrap().is_some());
        assert!(!dir.exists("c1").unwrap());
    }

    #[test]
    fn file_directory_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let dir = FileDirectory::open(tmp.path().join("locators")).unwrap();
        assert!(dir.available());

        dir.upsert("conv/1", &Locator::recording(node("b:2")), Duration::from_secs(10))
            .unwrap();
        let found = dir.get("conv/1").unwrap().unwrap();
        assert_eq!(found.node, node("b:2"));
        assert!(found.is_recording());
        assert!(dir.exists("conv/1").unwrap());

        dir.remove("conv/1").unwrap();
        assert!(dir.get("conv/1").unwrap().is_none());
        // Removing twice is fine.
        dir.remove("conv/1").unwrap();
    }

    #[test]
    fn file_directory_accepts_long_ids() {
        let tmp = TempDir::new().unwrap();
        let dir = FileDirectory::open(tmp.path().to_path_buf()).unwrap();
        let long_id = "é".repeat(50);
        dir.upsert(&long_id, &Locator::recording(node("a:1")), Duration::from_secs(10))
            .unwrap();
        assert_eq!(dir.get(&long_id).unwrap().unwrap().node, node("a:1"));
        assert!(dir.get(&"é".repeat(51)).unwrap().is_none());
    }

    #[test]
    fn file_directory_shared_between_handles() {
        let tmp = TempDir::new().unwrap();
        let a = FileDirectory::open(tmp.path().to_path_buf()).unwrap();
        let b = FileDirectory::open(tmp.path().to_path_buf()).unwrap();

        a.upsert("c1", &Locator::recording(node("a:1")), Duration::from_secs(10))
            .unwrap();
        assert_eq!(b.get("c1").unwrap().unwrap().node, node("a:1"));
    }

    #[test]
    fn file_directory_zero_ttl_is_absent() {
        let tmp = TempDir::new().unwrap();
        let dir = FileDirectory::open(tmp.path().to_path_buf()).unwrap();
        dir.upsert("c1", &Locator::recording(node("a:1")), Duration::ZERO)
            .unwrap();
        assert!(dir.get("c1").unwrap().is_none());
        // Reads leave the file for purge_expired.
        assert!(dir.entry_path("c1").exists());
        assert_eq!(dir.purge_expired(), 1);
        assert!(!dir.entry_path("c1").exists());
    }

    #[test]
    fn file_directory_ignores_corrupt_entry() {
        let tmp = TempDir::new().unwrap();
        let dir = FileDirectory::open(tmp.path().to_path_buf()).unwrap();
        std::fs::write(dir.entry_path("c1"), "not json").unwrap();
        assert!(dir.get("c1").unwrap().is_none());
        assert!(dir.entry_path("c1").exists());
        assert_eq!(dir.purge_expired(), 1);
        assert!(!dir.entry_path("c1").exists());
    }

    #[test]
    fn file_directory_purge_expired() {
        let tmp = TempDir::new().unwrap();
        let dir = FileDirectory::open(tmp.path().to_path_buf()).unwrap();
        dir.upsert("old", &Locator::recording(node("a:1")), Duration::ZERO)
            .unwrap();
        dir.upsert("live", &Locator::recording(node("a:1")), Duration::from_secs(60))
            .unwrap();
        assert_eq!(dir.purge_expired(), 1);
        assert!(dir.exists("live").unwrap());
        let leftovers: Vec<_> = std::fs::read_dir(dir.root())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|x| x == TOMBSTONE_EXTENSION))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn file_directory_refresh_survives_concurrent_expiry() {
        let tmp = TempDir::new().unwrap();
        let owner = FileDirectory::open(tmp.path().to_path_buf()).unwrap();
        let peer = FileDirectory::open(tmp.path().to_path_buf()).unwrap();

        for round in 0..200 {
            owner
                .upsert("c1", &Locator::recording(node("a:1")), Duration::ZERO)
                .unwrap();
            std::thread::scope(|s| {
                s.spawn(|| {
                    let _ = peer.get("c1");
                    peer.purge_expired();
                });
                s.spawn(|| {
                    owner
                        .upsert("c1", &Locator::recording(node("a:1")), Duration::from_secs(60))
                        .unwrap();
                });
            });
            assert!(
                owner.get("c1").unwrap().is_some(),
                "refreshed entry lost in round {round}"
            );
        }
    }

    #[test]
    fn entry_file_format() {
        let entry = LocatorEntry {
            conversation_id: "c1".into(),
            locator: Locator::recording(node("a:1")),
            expires_at: DateTime::parse_from_rfc3339("2026-01-31T12:45:31Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"node\":\"a:1\""));
        assert!(json.contains("\"kind\":\"recording\""));
        assert!(json.contains("\"expires_at\":\"2026-01-31T12:45:31Z\""));
    }

    #[test]
    fn noop_is_unavailable_and_empty() {
        let dir = NoopDirectory;
        assert!(!dir.available());
        dir.upsert("c1", &Locator::recording(node("a:1")), Duration::from_secs(10))
            .unwrap();
        assert!(dir.get("c1").unwrap().is_none());
        assert!(!dir.exists("c1").unwrap());
    }

    #[test]
    fn open_directory_by_kind() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(open_directory(DirectoryKind::None, None).unwrap().name(), "none");
        assert_eq!(open_directory(DirectoryKind::Memory, None).unwrap().name(), "memory");
        let file = open_directory(DirectoryKind::File, Some(tmp.path())).unwrap();
        assert_eq!(file.name(), "file");
        assert!(file.available());
    }
}
