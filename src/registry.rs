//! Recording registry - tracks the recordings this node owns
//!
//! Each active recording holds the spool writer, a state channel the
//! producer and server watch for cancellation, and a keepalive task that
//! refreshes the conversation's locator until the recording ends. When a
//! recording ends the locator is downgraded to a `retained` entry so other
//! nodes keep redirecting replays here for the retention window.

use crate::address::NodeAddress;
use crate::error::ResumerError;
use crate::locator::{Locator, LocatorDirectory};
use crate::session::{ABANDONED_MESSAGE, FinalStatus, RecordingState};
use crate::store::{AppendStore, SpoolWriter};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Default locator TTL
pub const DEFAULT_LOCATOR_TTL: Duration = Duration::from_secs(10);
/// Default locator refresh period
pub const DEFAULT_LOCATOR_REFRESH: Duration = Duration::from_secs(5);
/// Default retention of completed recordings
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 60);

/// Timing knobs for recordings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingOptions {
    /// TTL written with every locator upsert
    pub locator_ttl: Duration,
    /// How often an active recording refreshes its locator
    pub locator_refresh: Duration,
    /// How long a finished recording stays replayable
    pub retention: Duration,
}

impl Default for RecordingOptions {
    fn default() -> Self {
        Self {
            locator_ttl: DEFAULT_LOCATOR_TTL,
            locator_refresh: DEFAULT_LOCATOR_REFRESH,
            retention: DEFAULT_RETENTION,
        }
    }
}

/// Per-recording state shared by the producer handle, the registry and the keepalive task
#[derive(Debug)]
struct ActiveRecording {
    conversation_id: String,
    state: watch::Sender<RecordingState>,
    writer: tokio::sync::Mutex<Option<SpoolWriter>>,
    /// Final status, set together with the terminal state
    outcome: Mutex<Option<FinalStatus>>,
    /// Set once the locator was released; stops further refreshes
    released: Mutex<bool>,
}

impl ActiveRecording {
    /// Move from `active` to the terminal state of `status`.
    ///
    /// Only the first caller wins; later ones get `false`.
    fn claim(&self, status: &FinalStatus) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            // Stored before watchers are woken.
            *lock_outcome(&self.outcome) = Some(status.clone());
            *state = status.state;
            true
        })
    }

    /// Write the trailer once the producer's in-flight append is done.
    async fn finalize_spool(&self, status: &FinalStatus) -> Result<(), ResumerError> {
        let writer = self.writer.lock().await.take();
        match writer {
            Some(writer) => writer.finalize(status).await.map_err(ResumerError::from),
            None => Ok(()),
        }
    }
}

/// Registry of recordings owned by this node
pub struct RecordingRegistry {
    node: NodeAddress,
    store: Arc<AppendStore>,
    directory: Arc<dyn LocatorDirectory>,
    options: RecordingOptions,
    sessions: Mutex<HashMap<String, Arc<ActiveRecording>>>,
}

impl std::fmt::Debug for RecordingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingRegistry")
            .field("node", &self.node)
            .field("directory", &self.directory.name())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RecordingRegistry {
    pub fn new(
        node: NodeAddress,
        store: Arc<AppendStore>,
        directory: Arc<dyn LocatorDirectory>,
        options: RecordingOptions,
    ) -> Self {
        Self {
            node,
            store,
            directory,
            options,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn node(&self) -> &NodeAddress {
        &self.node
    }

    pub fn store(&self) -> &Arc<AppendStore> {
        &self.store
    }

    pub fn directory(&self) -> &Arc<dyn LocatorDirectory> {
        &self.directory
    }

    pub fn options(&self) -> &RecordingOptions {
        &self.options
    }

    /// Begin recording a conversation on this node.
    ///
    /// Opens a fresh spool, advertises this node in the locator directory
    /// and starts the keepalive task. Must be called within a Tokio runtime.
    pub fn start_recording(self: &Arc<Self>, conversation_id: &str) -> Result<Recording, ResumerError> {
        let shared = {
            let mut sessions = self.lock_sessions();
            if sessions.contains_key(conversation_id) {
                return Err(ResumerError::AlreadyRecording(conversation_id.to_string()));
            }
            let writer = self.store.create(conversation_id)?;
            let (state, _) = watch::channel(RecordingState::Active);
            let shared = Arc::new(ActiveRecording {
                conversation_id: conversation_id.to_string(),
                state,
                writer: tokio::sync::Mutex::new(Some(writer)),
                outcome: Mutex::new(None),
                released: Mutex::new(false),
            });
            sessions.insert(conversation_id.to_string(), Arc::clone(&shared));
            debug!("{} active recording(s)", sessions.len());
            shared
        };

        info!(%conversation_id, node = %self.node, "recording started");
        self.advertise(&shared);
        self.spawn_keepalive(Arc::clone(&shared));

        Ok(Recording {
            registry: Arc::clone(self),
            shared,
        })
    }

    /// Whether this node holds an active recording for the conversation.
    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.lock_sessions()
            .get(conversation_id)
            .is_some_and(|s| !s.state.borrow().is_terminal())
    }

    /// Conversation ids with an active recording on this node, sorted.
    pub fn active_recordings(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock_sessions()
            .values()
            .filter(|s| !s.state.borrow().is_terminal())
            .map(|s| s.conversation_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Current state of an active recording, if this node owns one.
    pub fn state(&self, conversation_id: &str) -> Option<RecordingState> {
        self.lock_sessions()
            .get(conversation_id)
            .map(|s| *s.state.borrow())
    }

    /// Ask the local recording to stop.
    ///
    /// Returns `true` when an active recording was found and moved to
    /// `cancelled`. The state flips and the locator is released before
    /// returning; the spool trailer is written in the background once any
    /// in-flight append finishes, which then releases readers.
    pub fn request_cancel(&self, conversation_id: &str) -> bool {
        let shared = self.lock_sessions().get(conversation_id).cloned();
        let Some(shared) = shared else {
            return false;
        };
        let status = FinalStatus::cancelled();
        if !shared.claim(&status) {
            return false;
        }
        self.release(&shared);
        info!(%conversation_id, "recording cancelled");

        tokio::spawn(async move {
            if let Err(e) = shared.finalize_spool(&status).await {
                warn!(
                    conversation_id = %shared.conversation_id,
                    error = %e,
                    "failed to finalize cancelled spool"
                );
            }
        });
        true
    }

    /// Move the recording to its terminal state, finalize the spool and
    /// release the locator. Returns `false` if it had already finished.
    async fn finish(&self, shared: &Arc<ActiveRecording>, status: FinalStatus) -> Result<bool, ResumerError> {
        if !shared.claim(&status) {
            return Ok(false);
        }
        let result = shared.finalize_spool(&status).await;
        self.release(shared);
        debug!(
            conversation_id = %shared.conversation_id,
            state = %status.state,
            "recording finished"
        );
        result.map(|()| true)
    }

    /// Forget the recording and downgrade its locator to a retained entry.
    fn release(&self, shared: &Arc<ActiveRecording>) {
        let conversation_id = &shared.conversation_id;
        {
            let mut sessions = self.lock_sessions();
            if sessions
                .get(conversation_id)
                .is_some_and(|current| Arc::ptr_eq(current, shared))
            {
                sessions.remove(conversation_id);
            }
        }

        let mut released = lock_flag(&shared.released);
        if *released {
            return;
        }
        *released = true;

        match self.directory.get(conversation_id) {
            Ok(Some(locator)) if locator.node == self.node => {
                let retained = Locator::retained(self.node.clone());
                if let Err(e) = self
                    .directory
                    .upsert(conversation_id, &retained, self.options.retention)
                {
                    warn!(%conversation_id, error = %e, "failed to downgrade locator");
                }
            }
            Ok(Some(locator)) => {
                // Another node started a newer recording; leave its entry alone.
                debug!(%conversation_id, owner = %locator.node, "locator owned elsewhere");
            }
            Ok(None) => {}
            Err(e) => warn!(%conversation_id, error = %e, "locator lookup failed on release"),
        }
    }

    fn advertise(&self, shared: &ActiveRecording) {
        let released = lock_flag(&shared.released);
        if *released {
            return;
        }
        let locator = Locator::recording(self.node.clone());
        if let Err(e) = self
            .directory
            .upsert(&shared.conversation_id, &locator, self.options.locator_ttl)
        {
            warn!(
                conversation_id = %shared.conversation_id,
                directory = self.directory.name(),
                error = %e,
                "failed to publish locator"
            );
        }
    }

    fn spawn_keepalive(self: &Arc<Self>, shared: Arc<ActiveRecording>) {
        let registry = Arc::clone(self);
        let refresh = self.options.locator_refresh.max(Duration::from_millis(10));
        let mut state_rx = shared.state.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(refresh) => {
                        trace!(conversation_id = %shared.conversation_id, "refreshing locator");
                        registry.advertise(&shared);
                    }
                    changed = state_rx.changed() => {
                        if changed.is_err() || state_rx.borrow().is_terminal() {
                            break;
                        }
                    }
                }
            }
            trace!(conversation_id = %shared.conversation_id, "keepalive stopped");
        });
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ActiveRecording>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn lock_flag(flag: &Mutex<bool>) -> std::sync::MutexGuard<'_, bool> {
    flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_outcome(outcome: &Mutex<Option<FinalStatus>>) -> std::sync::MutexGuard<'_, Option<FinalStatus>> {
    outcome.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Producer handle for one active recording.
///
/// Dropping the handle without calling [`complete`](Self::complete) or
/// [`fail`](Self::fail) ends the recording with an error.
pub struct Recording {
    registry: Arc<RecordingRegistry>,
    shared: Arc<ActiveRecording>,
}

impl std::fmt::Debug for Recording {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recording")
            .field("conversation_id", &self.shared.conversation_id)
            .field("state", &*self.shared.state.borrow())
            .finish()
    }
}

impl Recording {
    pub fn conversation_id(&self) -> &str {
        &self.shared.conversation_id
    }

    pub fn state(&self) -> RecordingState {
        *self.shared.state.borrow()
    }

    /// Watch the recording's state; leaves `Active` exactly once.
    pub fn subscribe(&self) -> watch::Receiver<RecordingState> {
        self.shared.state.subscribe()
    }

    /// Final status once the recording has ended, whoever ended it.
    pub fn outcome(&self) -> Option<FinalStatus> {
        lock_outcome(&self.shared.outcome).clone()
    }

    /// Append one chunk.
    ///
    /// Fails with [`ResumerError::Cancelled`] once a cancel was accepted. A
    /// spool write failure ends the recording with `error`.
    pub async fn record(&mut self, chunk: &str) -> Result<(), ResumerError> {
        let mut slot = self.shared.writer.lock().await;
        if self.shared.state.borrow().is_terminal() {
            return Err(self.ended_error());
        }
        let Some(writer) = slot.as_mut() else {
            return Err(self.ended_error());
        };
        let Err(e) = writer.append(chunk).await else {
            return Ok(());
        };
        drop(slot);

        warn!(conversation_id = %self.shared.conversation_id, error = %e, "spool append failed");
        let status = FinalStatus::error(e.to_string());
        if let Err(finalize) = self.registry.finish(&self.shared, status).await {
            debug!(error = %finalize, "finalize after append failure also failed");
        }
        Err(e.into())
    }

    /// Finish successfully.
    pub async fn complete(self) -> Result<(), ResumerError> {
        self.end(FinalStatus::completed()).await
    }

    /// Finish with an upstream error.
    pub async fn fail(self, message: &str) -> Result<(), ResumerError> {
        self.end(FinalStatus::error(message)).await
    }

    /// End the recording with `status` unless it already ended, and return
    /// the status it actually ended with.
    pub async fn settle(self, status: FinalStatus) -> FinalStatus {
        let fallback = status.clone();
        if let Err(e) = self.registry.finish(&self.shared, status).await {
            warn!(conversation_id = %self.shared.conversation_id, error = %e, "failed to finalize spool");
        }
        self.outcome().unwrap_or(fallback)
    }

    async fn end(self, status: FinalStatus) -> Result<(), ResumerError> {
        if self.registry.finish(&self.shared, status).await? {
            Ok(())
        } else {
            Err(self.ended_error())
        }
    }

    fn ended_error(&self) -> ResumerError {
        let id = self.shared.conversation_id.clone();
        match *self.shared.state.borrow() {
            RecordingState::Cancelled => ResumerError::Cancelled(id),
            _ => ResumerError::NotActive(id),
        }
    }
}

impl Drop for Recording {
    fn drop(&mut self) {
        if self.shared.state.borrow().is_terminal() {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let shared = Arc::clone(&self.shared);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let status = FinalStatus::error(ABANDONED_MESSAGE);
                    if let Ok(true) = registry.finish(&shared, status).await {
                        warn!(conversation_id = %shared.conversation_id, "recording abandoned");
                    }
                });
            }
            Err(_) => {
                // No runtime to finalize on; readers see an interrupted spool.
                if !shared.claim(&FinalStatus::error(ABANDONED_MESSAGE)) {
                    return;
                }
                if let Ok(mut slot) = shared.writer.try_lock() {
                    slot.take();
                }
                registry.release(&shared);
            }
        }
    }
}

#[cfg(test)]
impl Recording {
    /// Make every later spool write of this recording fail.
    pub(crate) async fn fail_spool_writes(&self) {
        if let Some(writer) = self.shared.writer.lock().await.as_mut() {
            writer.fail_writes().await;
        }
    }
}
