//! Recording state and final-status definitions

use serde::{Deserialize, Serialize};

/// Lifecycle state of one recorded response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    /// Producer is still streaming chunks
    #[default]
    Active,
    /// Producer finished normally
    Completed,
    /// A cancel request was accepted
    Cancelled,
    /// Upstream generation or the spool failed
    Error,
}

impl RecordingState {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for RecordingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a recording ended, as persisted in the spool trailer and reported to readers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalStatus {
    pub state: RecordingState,
    /// Only set when `state` is `Error`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl FinalStatus {
    pub fn completed() -> Self {
        Self {
            state: RecordingState::Completed,
            error_message: None,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            state: RecordingState::Cancelled,
            error_message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            state: RecordingState::Error,
            error_message: Some(message.into()),
        }
    }

    /// Status for a spool that ended without a trailer (writer crashed or was dropped).
    pub fn interrupted() -> Self {
        Self::error(INTERRUPTED_MESSAGE)
    }
}

/// Error message reported for recordings whose writer vanished without finalizing
pub const INTERRUPTED_MESSAGE: &str = "recording interrupted";

/// Error message used when a producer handle is dropped while still active
pub const ABANDONED_MESSAGE: &str = "recording abandoned";
