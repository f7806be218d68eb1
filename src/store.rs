//! Durable append store - one spool file per conversation.
//!
//! A spool is newline-delimited JSON: a `start` record naming the
//! conversation, one `chunk` record per appended chunk, then a single `end`
//! record carrying the [`FinalStatus`]. The writer flushes
//! each record before publishing the new byte length on a `watch` channel;
//! readers tail the file up to the published length and stop at the `end`
//! record. Readers never block the writer, and a reader can never see the end
//! of a recording before its last chunk.

use crate::locator::LocatorDirectory;
use crate::paths;
use crate::session::FinalStatus;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

const SPOOL_FILE_PREFIX: &str = "response-";
const SPOOL_FILE_SUFFIX: &str = ".chunks";

/// Upper bound on bytes pulled from a spool per read.
const READ_LIMIT: u64 = 1 << 20;

/// Errors raised by the append store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("spool IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed spool record in {path}: {message}")]
    Corrupt { path: PathBuf, message: String },
    #[error("conversation {0} already has an open spool writer")]
    WriterBusy(String),
}

/// One line of a spool file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SpoolRecord {
    Start { conversation_id: String },
    Chunk { content: String },
    End(FinalStatus),
}

/// Writer progress as seen by tailing readers
#[derive(Debug, Clone, Default)]
struct Progress {
    /// Bytes flushed to the spool file
    bytes: u64,
    /// The writer is gone (finalized or dropped)
    closed: bool,
    /// Final status, also kept here in case the trailer could not be written
    status: Option<FinalStatus>,
}

/// Shared per-conversation state: the spool path plus writer progress
#[derive(Debug)]
struct SpoolEntry {
    conversation_id: String,
    path: PathBuf,
    progress: watch::Sender<Progress>,
    readers: AtomicUsize,
    last_activity: Mutex<Instant>,
}

impl SpoolEntry {
    fn touch(&self) {
        if let Ok(mut at) = self.last_activity.lock() {
            *at = Instant::now();
        }
    }

    fn idle_for(&self, now: Instant) -> Duration {
        self.last_activity
            .lock()
            .map(|at| now.saturating_duration_since(*at))
            .unwrap_or_default()
    }

    fn is_closed(&self) -> bool {
        self.progress.borrow().closed
    }

    fn readers(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }
}

/// Per-process store of spool files keyed by conversation id
#[derive(Debug)]
pub struct AppendStore {
    dir: PathBuf,
    entries: Mutex<HashMap<String, Arc<SpoolEntry>>>,
}

impl AppendStore {
    /// Open (and create) the spool directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        debug!(path = %dir.display(), "spool directory ready");
        Ok(Self {
            dir,
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the spool file for a conversation.
    pub fn spool_path(&self, conversation_id: &str) -> PathBuf {
        self.dir.join(paths::keyed_file_name(
            SPOOL_FILE_PREFIX,
            conversation_id,
            SPOOL_FILE_SUFFIX,
        ))
    }

    /// Start a new spool for the conversation, replacing any retained one.
    ///
    /// Readers still attached to a replaced spool keep reading the old file.
    pub fn create(&self, conversation_id: &str) -> Result<SpoolWriter, StoreError> {
        let mut entries = self.lock_entries();
        if entries
            .get(conversation_id)
            .is_some_and(|existing| !existing.is_closed())
        {
            return Err(StoreError::WriterBusy(conversation_id.to_string()));
        }

        let path = self.spool_path(conversation_id);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(%conversation_id, "replacing retained spool"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let mut file = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        let header = encode_record(&SpoolRecord::Start {
            conversation_id: conversation_id.to_string(),
        })?;
        file.write_all(&header)?;
        let bytes = header.len() as u64;

        let (progress, _) = watch::channel(Progress {
            bytes,
            ..Progress::default()
        });
        let entry = Arc::new(SpoolEntry {
            conversation_id: conversation_id.to_string(),
            path,
            progress,
            readers: AtomicUsize::new(0),
            last_activity: Mutex::new(Instant::now()),
        });
        entries.insert(conversation_id.to_string(), Arc::clone(&entry));
        trace!(%conversation_id, path = %entry.path.display(), "spool created");

        Ok(SpoolWriter {
            entry,
            file: tokio::fs::File::from_std(file),
            bytes,
            chunks: 0,
        })
    }

    /// Open a reader positioned at the start of the conversation's spool.
    ///
    /// Returns `None` when nothing is retained for the conversation.
    pub fn open_reader(&self, conversation_id: &str) -> Result<Option<SpoolReader>, StoreError> {
        let entries = self.lock_entries();
        if let Some(entry) = entries.get(conversation_id) {
            let file = match std::fs::File::open(&entry.path) {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            entry.readers.fetch_add(1, Ordering::AcqRel);
            entry.touch();
            return Ok(Some(SpoolReader::new(
                conversation_id,
                entry.path.clone(),
                tokio::fs::File::from_std(file),
                Some(Arc::clone(entry)),
            )));
        }
        drop(entries);

        // Spool left behind by an earlier process: replay what is on disk.
        let path = self.spool_path(conversation_id);
        match std::fs::File::open(&path) {
            Ok(file) => Ok(Some(SpoolReader::new(
                conversation_id,
                path,
                tokio::fs::File::from_std(file),
                None,
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a spool (live or finalized) exists for the conversation.
    pub fn contains(&self, conversation_id: &str) -> bool {
        self.lock_entries().contains_key(conversation_id)
            || self.spool_path(conversation_id).is_file()
    }

    /// Number of readers currently attached to the conversation's spool.
    pub fn reader_count(&self, conversation_id: &str) -> usize {
        self.lock_entries()
            .get(conversation_id)
            .map(|e| e.readers())
            .unwrap_or(0)
    }

    /// Delete finalized spools that have outlived `retention`.
    ///
    /// A spool is kept while a reader is attached, while it was read or
    /// written within `retention`, or while the directory advertises an
    /// active recording for the conversation. Files on disk with no entry in
    /// this process (left by a crashed process) are judged by modification
    /// time. Returns the removed conversation ids.
    pub fn sweep(&self, retention: Duration, directory: &dyn LocatorDirectory) -> Vec<String> {
        let now = Instant::now();
        let candidates: Vec<Arc<SpoolEntry>> = self
            .lock_entries()
            .values()
            .filter(|e| e.is_closed() && e.readers() == 0 && e.idle_for(now) >= retention)
            .cloned()
            .collect();

        let mut removed = Vec::new();
        for entry in candidates {
            if recording_advertised(directory, &entry.conversation_id) {
                continue;
            }
            let mut entries = self.lock_entries();
            let still_current = entries
                .get(&entry.conversation_id)
                .is_some_and(|current| Arc::ptr_eq(current, &entry));
            if !still_current || entry.readers() > 0 {
                continue;
            }
            entries.remove(&entry.conversation_id);
            drop(entries);
            remove_spool_file(&entry.path);
            removed.push(entry.conversation_id.clone());
        }

        removed.extend(self.remove_orphans(retention, Some(directory)));
        if !removed.is_empty() {
            info!(count = removed.len(), "swept expired spools");
        }
        removed
    }

    /// Startup cleanup: delete spool files older than `retention` that no
    /// entry in this process owns.
    pub fn remove_stale_files(&self, retention: Duration) -> usize {
        let removed = self.remove_orphans(retention, None).len();
        if removed > 0 {
            info!(count = removed, path = %self.dir.display(), "removed stale spool files");
        }
        removed
    }

    fn remove_orphans(
        &self,
        retention: Duration,
        directory: Option<&dyn LocatorDirectory>,
    ) -> Vec<String> {
        let mut removed = Vec::new();
        for (key, path) in paths::list_keyed_files(&self.dir, SPOOL_FILE_PREFIX, SPOOL_FILE_SUFFIX) {
            let Some(age) = paths::modified_age(&path) else {
                continue;
            };
            if age < retention {
                continue;
            }
            let id = match key {
                paths::FileKey::Id(id) => Some(id),
                paths::FileKey::Digest => read_spool_header(&path),
            };
            if let Some(id) = &id {
                if self.lock_entries().contains_key(id) {
                    continue;
                }
                if directory.is_some_and(|d| recording_advertised(d, id)) {
                    continue;
                }
            } else if self.owns_path(&path) {
                continue;
            }
            remove_spool_file(&path);
            removed.push(id.unwrap_or_else(|| path.display().to_string()));
        }
        removed
    }

    fn owns_path(&self, path: &Path) -> bool {
        self.lock_entries().values().any(|e| e.path == path)
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SpoolEntry>>> {
        // Entry bookkeeping stays consistent even if a holder panicked.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn encode_record(record: &SpoolRecord) -> std::io::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(record).map_err(std::io::Error::other)?;
    line.push(b'\n');
    Ok(line)
}

/// Conversation id named by a spool's `start` record.
fn read_spool_header(path: &Path) -> Option<String> {
    let file = std::fs::File::open(path).ok()?;
    let mut first = String::new();
    std::io::BufReader::new(file).read_line(&mut first).ok()?;
    match serde_json::from_str(first.trim_end()).ok()? {
        SpoolRecord::Start { conversation_id } => Some(conversation_id),
        _ => None,
    }
}

fn recording_advertised(directory: &dyn LocatorDirectory, conversation_id: &str) -> bool {
    match directory.exists(conversation_id) {
        Ok(exists) => exists,
        Err(e) => {
            // Keep the spool; a later sweep will retry.
            warn!(%conversation_id, error = %e, "locator lookup failed during sweep");
            true
        }
    }
}

fn remove_spool_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "failed to delete spool file");
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Exclusive append handle for one conversation's spool
#[derive(Debug)]
pub struct SpoolWriter {
    entry: Arc<SpoolEntry>,
    file: tokio::fs::File,
    bytes: u64,
    chunks: u64,
}

impl SpoolWriter {
    pub fn conversation_id(&self) -> &str {
        &self.entry.conversation_id
    }

    pub fn chunks_written(&self) -> u64 {
        self.chunks
    }

    /// Append one chunk. Empty chunks are ignored.
    pub async fn append(&mut self, chunk: &str) -> Result<(), StoreError> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.write_record(&SpoolRecord::Chunk {
            content: chunk.to_string(),
        })
        .await?;
        self.chunks += 1;
        trace!(conversation_id = %self.entry.conversation_id, chunks = self.chunks, "chunk appended");
        Ok(())
    }

    /// Write the trailer and close the spool.
    ///
    /// Readers are released even when the trailer cannot be written; they
    /// then report `status` from memory.
    pub async fn finalize(mut self, status: &FinalStatus) -> Result<(), StoreError> {
        let result = self.write_trailer(status).await;
        self.entry
            .progress
            .send_modify(|p| p.status = Some(status.clone()));
        debug!(
            conversation_id = %self.entry.conversation_id,
            state = %status.state,
            chunks = self.chunks,
            bytes = self.bytes,
            "spool finalized"
        );
        result
    }

    async fn write_trailer(&mut self, status: &FinalStatus) -> Result<(), StoreError> {
        self.write_record(&SpoolRecord::End(status.clone())).await?;
        self.file.sync_data().await?;
        Ok(())
    }

    async fn write_record(&mut self, record: &SpoolRecord) -> Result<(), StoreError> {
        let line = encode_record(record)?;
        self.file.write_all(&line).await?;
        self.file.flush().await?;

        self.bytes += line.len() as u64;
        let bytes = self.bytes;
        self.entry.progress.send_modify(|p| p.bytes = bytes);
        self.entry.touch();
        Ok(())
    }
}

#[cfg(test)]
impl SpoolWriter {
    /// Swap the spool handle for a read-only one so later writes fail.
    pub(crate) async fn fail_writes(&mut self) {
        self.file = tokio::fs::File::open(&self.entry.path)
            .await
            .expect("reopen spool read-only");
    }
}

impl Drop for SpoolWriter {
    fn drop(&mut self) {
        self.entry.progress.send_modify(|p| p.closed = true);
        self.entry.touch();
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Cursor over a spool, always starting at offset zero
#[derive(Debug)]
pub struct SpoolReader {
    conversation_id: String,
    path: PathBuf,
    file: tokio::fs::File,
    /// Present while the spool belongs to a writer in this process
    entry: Option<Arc<SpoolEntry>>,
    progress: Option<watch::Receiver<Progress>>,
    offset: u64,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    status: Option<FinalStatus>,
}

impl SpoolReader {
    fn new(
        conversation_id: &str,
        path: PathBuf,
        file: tokio::fs::File,
        entry: Option<Arc<SpoolEntry>>,
    ) -> Self {
        let progress = entry.as_ref().map(|e| e.progress.subscribe());
        Self {
            conversation_id: conversation_id.to_string(),
            path,
            file,
            entry,
            progress,
            offset: 0,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            status: None,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Final status, available once [`next`](Self::next) has returned `None`.
    pub fn status(&self) -> Option<&FinalStatus> {
        self.status.as_ref()
    }

    /// Next chunk in append order, waiting for the writer while it is live.
    ///
    /// Returns `None` once the recording has ended and every chunk was yielded.
    pub async fn next(&mut self) -> Result<Option<String>, StoreError> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Ok(Some(chunk));
            }
            if self.status.is_some() {
                return Ok(None);
            }

            let snapshot = self.progress.as_mut().map(|rx| rx.borrow_and_update().clone());
            let limit = snapshot.as_ref().map(|p| p.bytes);
            if self.read_available(limit).await? > 0 {
                self.drain_records()?;
                continue;
            }

            let closed = snapshot.as_ref().is_none_or(|p| p.closed);
            if closed {
                // Everything published has been consumed and no trailer was seen.
                let status = snapshot
                    .and_then(|p| p.status)
                    .unwrap_or_else(FinalStatus::interrupted);
                if !self.buffer.is_empty() {
                    warn!(path = %self.path.display(), "ignoring torn spool tail");
                    self.buffer.clear();
                }
                self.status = Some(status);
                continue;
            }

            let Some(rx) = self.progress.as_mut() else {
                continue;
            };
            if rx.changed().await.is_err() {
                // Sender gone with the entry; finish from what is on disk.
                self.progress = None;
            }
        }
    }

    /// Drain the reader into a vector of chunks plus the final status.
    pub async fn read_to_end(mut self) -> Result<(Vec<String>, FinalStatus), StoreError> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.next().await? {
            chunks.push(chunk);
        }
        let status = self.status.clone().unwrap_or_else(FinalStatus::interrupted);
        Ok((chunks, status))
    }

    async fn read_available(&mut self, limit: Option<u64>) -> Result<usize, StoreError> {
        let want = match limit {
            Some(limit) if limit <= self.offset => return Ok(0),
            Some(limit) => (limit - self.offset).min(READ_LIMIT),
            None => READ_LIMIT,
        };

        self.file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        (&mut self.file).take(want).read_to_end(&mut buf).await?;
        self.offset += buf.len() as u64;
        self.buffer.extend_from_slice(&buf);
        if let Some(entry) = &self.entry {
            entry.touch();
        }
        Ok(buf.len())
    }

    /// Parse complete lines out of `buffer`, leaving any partial line behind.
    fn drain_records(&mut self) -> Result<(), StoreError> {
        let pending = &mut self.pending;
        let status = &mut self.status;
        let mut corrupt = None;

        drain_lines(&mut self.buffer, |line| {
            if corrupt.is_some() || status.is_some() {
                return;
            }
            match serde_json::from_slice::<SpoolRecord>(line) {
                Ok(SpoolRecord::Start { .. }) => {}
                Ok(SpoolRecord::Chunk { content }) => pending.push_back(content),
                Ok(SpoolRecord::End(end)) => *status = Some(end),
                Err(e) => corrupt = Some(e.to_string()),
            }
        });

        match corrupt {
            Some(message) => Err(StoreError::Corrupt {
                path: self.path.clone(),
                message,
            }),
            None => Ok(()),
        }
    }
}

impl Drop for SpoolReader {
    fn drop(&mut self) {
        if let Some(entry) = &self.entry {
            entry.readers.fetch_sub(1, Ordering::AcqRel);
            entry.touch();
        }
    }
}

fn drain_lines(buffer: &mut Vec<u8>, mut on_line: impl FnMut(&[u8])) {
    let mut start = 0usize;
    for idx in 0..buffer.len() {
        if buffer[idx] != b'\n' {
            continue;
        }
        let line = buffer[start..idx].trim_ascii();
        start = idx + 1;
        if line.is_empty() {
            continue;
        }
        on_line(line);
    }
    if start > 0 {
        buffer.drain(..start);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NodeAddress;
    use crate::locator::{Locator, MemoryDirectory, NoopDirectory};
    use crate::session::RecordingState;
    use tempfile::TempDir;

    fn store() -> (TempDir, AppendStore) {
        let tmp = TempDir::new().unwrap();
        let store = AppendStore::open(tmp.path().join("spool")).unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn replay_after_finalize() {
        let (_tmp, store) = store();
        let mut writer = store.create("c1").unwrap();
        writer.append("Hello").await.unwrap();
        writer.append(" world").await.unwrap();
        writer.finalize(&FinalStatus::completed()).await.unwrap();

        let reader = store.open_reader("c1").unwrap().unwrap();
        let (chunks, status) = reader.read_to_end().await.unwrap();
        assert_eq!(chunks, vec!["Hello", " world"]);
        assert_eq!(status, FinalStatus::completed());
    }

    #[tokio::test]
    async fn empty_chunks_are_skipped() {
        let (_tmp, store) = store();
        let mut writer = store.create("c1").unwrap();
        writer.append("").await.unwrap();
        writer.append("a").await.unwrap();
        assert_eq!(writer.chunks_written(), 1);
        writer.finalize(&FinalStatus::completed()).await.unwrap();

        let (chunks, _) = store
            .open_reader("c1")
            .unwrap()
            .unwrap()
            .read_to_end()
            .await
            .unwrap();
        assert_eq!(chunks, vec!["a"]);
    }

    #[tokio::test]
    async fn chunks_with_newlines_survive() {
        let (_tmp, store) = store();
        let mut writer = store.create("c1").unwrap();
        writer.append("line one\nline two\n").await.unwrap();
        writer.append("{\"json\": true}").await.unwrap();
        writer.finalize(&FinalStatus::completed()).await.unwrap();

        let (chunks, _) = store
            .open_reader("c1")
            .unwrap()
            .unwrap()
            .read_to_end()
            .await
            .unwrap();
        assert_eq!(chunks, vec!["line one\nline two\n", "{\"json\": true}"]);
    }

    #[tokio::test]
    async fn missing_conversation_has_no_reader() {
        let (_tmp, store) = store();
        assert!(store.open_reader("nope").unwrap().is_none());
        assert!(!store.contains("nope"));
    }

    #[tokio::test]
    async fn live_reader_tails_until_finalize() {
        let (_tmp, store) = store();
        let mut writer = store.create("c1").unwrap();
        writer.append("one").await.unwrap();

        let mut reader = store.open_reader("c1").unwrap().unwrap();
        assert_eq!(reader.next().await.unwrap().as_deref(), Some("one"));

        let tail = tokio::spawn(async move {
            let mut rest = Vec::new();
            while let Some(chunk) = reader.next().await.unwrap() {
                rest.push(chunk);
            }
            (rest, reader.status().cloned())
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.append("two").await.unwrap();
        writer.append("three").await.unwrap();
        writer.finalize(&FinalStatus::cancelled()).await.unwrap();

        let (rest, status) = tail.await.unwrap();
        assert_eq!(rest, vec!["two", "three"]);
        assert_eq!(status.unwrap().state, RecordingState::Cancelled);
    }

    #[tokio::test]
    async fn concurrent_readers_see_same_sequence() {
        let (_tmp, store) = store();
        let mut writer = store.create("c1").unwrap();

        let early_a = store.open_reader("c1").unwrap().unwrap();
        let early_b = store.open_reader("c1").unwrap().unwrap();
        assert_eq!(store.reader_count("c1"), 2);
        let a = tokio::spawn(early_a.read_to_end());
        let b = tokio::spawn(early_b.read_to_end());

        let expected: Vec<String> = (0..50).map(|i| format!("chunk-{i} ")).collect();
        for chunk in &expected {
            writer.append(chunk).await.unwrap();
        }
        writer.finalize(&FinalStatus::completed()).await.unwrap();

        let late = store.open_reader("c1").unwrap().unwrap().read_to_end();
        let (late_chunks, _) = late.await.unwrap();
        let (a_chunks, a_status) = a.await.unwrap().unwrap();
        let (b_chunks, _) = b.await.unwrap().unwrap();

        assert_eq!(a_chunks, expected);
        assert_eq!(b_chunks, expected);
        assert_eq!(late_chunks, expected);
        assert_eq!(a_status, FinalStatus::completed());
        assert_eq!(store.reader_count("c1"), 0);
    }

    #[tokio::test]
    async fn dropped_writer_reports_interrupted() {
        let (_tmp, store) = store();
        let mut writer = store.create("c1").unwrap();
        writer.append("partial").await.unwrap();
        let reader = store.open_reader("c1").unwrap().unwrap();
        drop(writer);

        let (chunks, status) = reader.read_to_end().await.unwrap();
        assert_eq!(chunks, vec!["partial"]);
        assert_eq!(status, FinalStatus::interrupted());
    }

    #[tokio::test]
    async fn error_status_persists_message() {
        let (_tmp, store) = store();
        let mut writer = store.create("c1").unwrap();
        writer.append("x").await.unwrap();
        writer
            .finalize(&FinalStatus::error("model overloaded"))
            .await
            .unwrap();

        // A fresh store over the same directory only has the file on disk.
        let reopened = AppendStore::open(store.dir().to_path_buf()).unwrap();
        let (chunks, status) = reopened
            .open_reader("c1")
            .unwrap()
            .unwrap()
            .read_to_end()
            .await
            .unwrap();
        assert_eq!(chunks, vec!["x"]);
        assert_eq!(status.error_message.as_deref(), Some("model overloaded"));
    }

    #[tokio::test]
    async fn orphaned_spool_without_trailer_is_interrupted() {
        let (_tmp, store) = store();
        std::fs::write(
            store.spool_path("c1"),
            "{\"type\":\"chunk\",\"content\":\"a\"}\n{\"type\":\"chu",
        )
        .unwrap();

        let (chunks, status) = store
            .open_reader("c1")
            .unwrap()
            .unwrap()
            .read_to_end()
            .await
            .unwrap();
        assert_eq!(chunks, vec!["a"]);
        assert_eq!(status, FinalStatus::interrupted());
    }

    #[tokio::test]
    async fn corrupt_record_is_an_error() {
        let (_tmp, store) = store();
        std::fs::write(store.spool_path("c1"), "garbage\n").unwrap();
        let mut reader = store.open_reader("c1").unwrap().unwrap();
        assert!(matches!(reader.next().await, Err(StoreError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn second_writer_is_rejected_while_open() {
        let (_tmp, store) = store();
        let _writer = store.create("c1").unwrap();
        assert!(matches!(store.create("c1"), Err(StoreError::WriterBusy(_))));
    }

    #[tokio::test]
    async fn new_recording_replaces_retained_spool() {
        let (_tmp, store) = store();
        let mut first = store.create("c1").unwrap();
        first.append("old").await.unwrap();
        first.finalize(&FinalStatus::completed()).await.unwrap();
        let old_reader = store.open_reader("c1").unwrap().unwrap();

        let mut second = store.create("c1").unwrap();
        second.append("new").await.unwrap();
        second.finalize(&FinalStatus::completed()).await.unwrap();

        let (old, _) = old_reader.read_to_end().await.unwrap();
        assert_eq!(old, vec!["old"]);
        let (new, _) = store
            .open_reader("c1")
            .unwrap()
            .unwrap()
            .read_to_end()
            .await
            .unwrap();
        assert_eq!(new, vec!["new"]);
    }

    #[tokio::test]
    async fn sweep_removes_finalized_idle_spools() {
        let (_tmp, store) = store();
        let mut writer = store.create("done").unwrap();
        writer.append("x").await.unwrap();
        writer.finalize(&FinalStatus::completed()).await.unwrap();
        let _live = store.create("live").unwrap();

        let removed = store.sweep(Duration::ZERO, &NoopDirectory);
        assert_eq!(removed, vec!["done".to_string()]);
        assert!(!store.spool_path("done").exists());
        assert!(store.spool_path("live").exists());
        assert!(store.open_reader("done").unwrap().is_none());
    }

    #[tokio::test]
    async fn sweep_keeps_spools_within_retention() {
        let (_tmp, store) = store();
        let writer = store.create("c1").unwrap();
        writer.finalize(&FinalStatus::completed()).await.unwrap();
        assert!(store.sweep(Duration::from_secs(3600), &NoopDirectory).is_empty());
        assert!(store.contains("c1"));
    }

    #[tokio::test]
    async fn sweep_skips_spools_with_attached_readers() {
        let (_tmp, store) = store();
        let writer = store.create("c1").unwrap();
        writer.finalize(&FinalStatus::completed()).await.unwrap();

        let reader = store.open_reader("c1").unwrap().unwrap();
        assert!(store.sweep(Duration::ZERO, &NoopDirectory).is_empty());
        drop(reader);
        assert_eq!(store.sweep(Duration::ZERO, &NoopDirectory), vec!["c1".to_string()]);
    }

    #[tokio::test]
    async fn sweep_respects_active_locator() {
        let (_tmp, store) = store();
        let writer = store.create("c1").unwrap();
        writer.finalize(&FinalStatus::completed()).await.unwrap();

        let directory = MemoryDirectory::new();
        let node = NodeAddress::parse("other:1").unwrap();
        directory
            .upsert("c1", &Locator::recording(node), Duration::from_secs(60))
            .unwrap();
        assert!(store.sweep(Duration::ZERO, &directory).is_empty());

        directory.remove("c1").unwrap();
        assert_eq!(store.sweep(Duration::ZERO, &directory).len(), 1);
    }

    #[tokio::test]
    async fn sweep_removes_old_orphan_files() {
        let (_tmp, store) = store();
        let orphan = store.spool_path("crashed");
        let fresh = store.spool_path("fresh");
        std::fs::write(&orphan, "{\"type\":\"chunk\",\"content\":\"a\"}\n").unwrap();
        std::fs::write(&fresh, "{\"type\":\"chunk\",\"content\":\"a\"}\n").unwrap();
        let old = filetime::FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_mtime(&orphan, old).unwrap();

        let removed = store.sweep(Duration::from_secs(60), &NoopDirectory);
        assert_eq!(removed, vec!["crashed".to_string()]);
        assert!(!orphan.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn startup_cleanup_removes_stale_files() {
        let (_tmp, store) = store();
        let stale = store.spool_path("stale");
        std::fs::write(&stale, "").unwrap();
        filetime::set_file_mtime(&stale, filetime::FileTime::from_unix_time(1_000_000, 0))
            .unwrap();
        std::fs::write(store.dir().join("unrelated.txt"), "").unwrap();

        assert_eq!(store.remove_stale_files(Duration::from_secs(60)), 1);
        assert!(!stale.exists());
        assert!(store.dir().join("unrelated.txt").exists());
    }

    #[tokio::test]
    async fn long_conversation_ids_round_trip() {
        let (_tmp, store) = store();
        let long_id = "é".repeat(50);
        let other = "ü".repeat(50);
        let mut writer = store.create(&long_id).unwrap();
        writer.append("a").await.unwrap();
        writer.finalize(&FinalStatus::completed()).await.unwrap();
        let mut writer = store.create(&other).unwrap();
        writer.append("b").await.unwrap();
        writer.finalize(&FinalStatus::completed()).await.unwrap();

        let name = store.spool_path(&long_id);
        let name = name.file_name().unwrap().to_str().unwrap();
        assert!(name.len() < 255, "{name}");

        let (chunks, status) = store
            .open_reader(&long_id)
            .unwrap()
            .unwrap()
            .read_to_end()
            .await
            .unwrap();
        assert_eq!(chunks, vec!["a"]);
        assert_eq!(status, FinalStatus::completed());
        let (chunks, _) = store
            .open_reader(&other)
            .unwrap()
            .unwrap()
            .read_to_end()
            .await
            .unwrap();
        assert_eq!(chunks, vec!["b"]);
    }

    #[tokio::test]
    async fn digest_named_orphans_are_attributed_by_header() {
        let (_tmp, store) = store();
        let long_id = "x".repeat(300);
        let writer = store.create(&long_id).unwrap();
        writer.finalize(&FinalStatus::completed()).await.unwrap();
        let path = store.spool_path(&long_id);

        // A fresh process knows nothing of the spool except the file.
        let restarted = AppendStore::open(store.dir()).unwrap();
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(1_000_000, 0))
            .unwrap();

        let directory = MemoryDirectory::new();
        let node = NodeAddress::parse("other:1").unwrap();
        directory
            .upsert(&long_id, &Locator::recording(node), Duration::from_secs(60))
            .unwrap();
        assert!(restarted.sweep(Duration::from_secs(60), &directory).is_empty());
        assert!(path.exists());

        directory.remove(&long_id).unwrap();
        assert_eq!(
            restarted.sweep(Duration::from_secs(60), &directory),
            vec![long_id.clone()]
        );
        assert!(!path.exists());
    }

    #[test]
    fn drain_lines_keeps_partial_tail() {
        let mut buf = b"a\n\nb\npartial".to_vec();
        let mut lines = Vec::new();
        drain_lines(&mut buf, |l| lines.push(l.to_vec()));
        assert_eq!(lines, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(buf, b"partial".to_vec());
    }

    #[test]
    fn spool_record_format() {
        let start = SpoolRecord::Start {
            conversation_id: "c1".into(),
        };
        assert_eq!(
            serde_json::to_string(&start).unwrap(),
            r#"{"type":"start","conversation_id":"c1"}"#
        );
        let chunk = SpoolRecord::Chunk {
            content: "hi".into(),
        };
        assert_eq!(
            serde_json::to_string(&chunk).unwrap(),
            r#"{"type":"chunk","content":"hi"}"#
        );
        let end = SpoolRecord::End(FinalStatus::error("bad"));
        assert_eq!(
            serde_json::to_string(&end).unwrap(),
            r#"{"type":"end","state":"error","error_message":"bad"}"#
        );
    }
}
