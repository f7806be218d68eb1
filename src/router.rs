//! Redirect router - decides whether this node serves a request
//!
//! Every conversation-scoped request is answered locally, redirected to the
//! node named in the locator directory, or reported as not found. Directory
//! failures are logged and treated as "no entry", which leaves the node
//! serving whatever it holds locally.

use crate::address::NodeAddress;
use crate::error::ResumerError;
use crate::locator::Locator;
use crate::registry::{Recording, RecordingRegistry};
use crate::store::SpoolReader;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of routing one request
#[derive(Debug)]
pub enum Routed<T> {
    /// Served by this node
    Local(T),
    /// Another node owns the conversation; retry there once
    Redirect(NodeAddress),
    /// Nothing to serve anywhere
    NotFound,
}

impl<T> Routed<T> {
    pub fn is_redirect(&self) -> bool {
        matches!(self, Self::Redirect(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    pub fn redirect_target(&self) -> Option<&NodeAddress> {
        match self {
            Self::Redirect(addr) => Some(addr),
            _ => None,
        }
    }

    pub fn local(self) -> Option<T> {
        match self {
            Self::Local(value) => Some(value),
            _ => None,
        }
    }
}

/// Which directory entries may trigger a redirect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lookup {
    /// Only nodes with an active recording
    Recording,
    /// Active recordings and retained ones
    Any,
}

/// Request router for one node
#[derive(Debug, Clone)]
pub struct Router {
    registry: Arc<RecordingRegistry>,
}

impl Router {
    pub fn new(registry: Arc<RecordingRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<RecordingRegistry> {
        &self.registry
    }

    pub fn node(&self) -> &NodeAddress {
        self.registry.node()
    }

    /// Route a Record call.
    ///
    /// Fails with [`ResumerError::AlreadyRecording`] when this node already
    /// records the conversation. A recording owned elsewhere redirects;
    /// otherwise a new local recording starts.
    pub fn record(&self, conversation_id: &str) -> Result<Routed<Recording>, ResumerError> {
        if self.registry.is_active(conversation_id) {
            return Err(ResumerError::AlreadyRecording(conversation_id.to_string()));
        }
        if let Some(owner) = self.remote_owner(conversation_id, Lookup::Recording) {
            debug!(%conversation_id, %owner, "record redirected");
            return Ok(Routed::Redirect(owner));
        }
        self.registry
            .start_recording(conversation_id)
            .map(Routed::Local)
    }

    /// Route a Replay call. Local readers always start at offset zero.
    pub fn replay(&self, conversation_id: &str) -> Result<Routed<SpoolReader>, ResumerError> {
        let store = self.registry.store();
        if self.registry.is_active(conversation_id)
            && let Some(reader) = store.open_reader(conversation_id)?
        {
            return Ok(Routed::Local(reader));
        }
        if let Some(owner) = self.remote_owner(conversation_id, Lookup::Any) {
            debug!(%conversation_id, %owner, "replay redirected");
            return Ok(Routed::Redirect(owner));
        }
        Ok(match store.open_reader(conversation_id)? {
            Some(reader) => Routed::Local(reader),
            None => Routed::NotFound,
        })
    }

    /// Route a Cancel call; `Local(accepted)` when answered here.
    ///
    /// Never waits on the producer of a local recording.
    pub fn cancel(&self, conversation_id: &str) -> Routed<bool> {
        if self.registry.is_active(conversation_id) {
            return Routed::Local(self.registry.request_cancel(conversation_id));
        }
        if let Some(owner) = self.remote_owner(conversation_id, Lookup::Recording) {
            debug!(%conversation_id, %owner, "cancel redirected");
            return Routed::Redirect(owner);
        }
        Routed::Local(false)
    }

    /// Subset of `conversation_ids` with an active recording anywhere in the
    /// cluster, in request order without duplicates.
    pub fn check_recordings(&self, conversation_ids: &[String]) -> Vec<String> {
        let directory = self.registry.directory();
        let mut seen = HashSet::new();
        conversation_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .filter(|id| {
                self.registry.is_active(id)
                    || directory.exists(id).unwrap_or_else(|e| {
                        warn!(conversation_id = %id, error = %e, "locator lookup failed");
                        false
                    })
            })
            .cloned()
            .collect()
    }

    /// Whether cross-node redirects are possible.
    pub fn is_enabled(&self) -> bool {
        self.registry.directory().available()
    }

    fn remote_owner(&self, conversation_id: &str, lookup: Lookup) -> Option<NodeAddress> {
        let locator: Locator = match self.registry.directory().get(conversation_id) {
            Ok(Some(locator)) => locator,
            Ok(None) => return None,
            Err(e) => {
                warn!(%conversation_id, error = %e, "locator lookup failed; serving locally");
                return None;
            }
        };
        if lookup == Lookup::Recording && !locator.is_recording() {
            return None;
        }
        if &locator.node == self.node() {
            // Stale pointer at ourselves: nothing to redirect to.
            return None;
        }
        Some(locator.node)
    }
}
