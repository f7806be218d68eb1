//! Error types for the resumer service

use crate::locator::DirectoryError;
use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by recording, replay and routing operations
#[derive(Error, Debug)]
pub enum ResumerError {
    #[error("conversation {0} is already being recorded on this node")]
    AlreadyRecording(String),
    #[error("recording for conversation {0} was cancelled")]
    Cancelled(String),
    #[error("recording for conversation {0} is no longer active")]
    NotActive(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ResumerError {
    /// True for errors caused by the producer racing a cancel request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}
