//! Playback error taxonomy
//!
//! `PlaybackError` is what surfaces on the state machine's `ERROR` state and
//! in `EngineEvent::LoadError`/`PlayError`. Each variant maps to a stable
//! numeric code so front-ends can branch without string matching.

use std::time::Duration;

use thiserror::Error;

use crate::state_machine::PlaybackState;

/// Errors produced by the playback core
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlaybackError {
    /// Stream acquisition failed before a duration was known
    #[error("Failed to load media: {0}")]
    Load(String),

    /// Playback failed after the stream had been acquired
    #[error("Playback failed: {0}")]
    Play(String),

    /// Heartbeat saw no progress past the hard buffer timeout
    #[error("Connection lost: no playback progress for {0:?}")]
    ConnectionLost(Duration),

    /// Transition not present in the state table
    #[error("Invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: PlaybackState,
        to: PlaybackState,
    },

    /// Cache polling hit its attempt ceiling
    #[error("Episode still not cached after {0} attempts")]
    CacheTimeout(u32),

    /// Backend could not execute a command
    #[error("Audio backend error: {0}")]
    Backend(String),

    /// Remote endpoint failure (cache status, prefetch)
    #[error("Network error: {0}")]
    Network(String),
}

impl PlaybackError {
    /// Numeric code stored on `PlaybackContext::error_code`
    pub fn code(&self) -> u16 {
        match self {
            PlaybackError::Load(_) => 1,
            PlaybackError::Play(_) => 2,
            PlaybackError::ConnectionLost(_) => 3,
            PlaybackError::InvalidTransition { .. } => 4,
            PlaybackError::CacheTimeout(_) => 5,
            PlaybackError::Backend(_) => 6,
            PlaybackError::Network(_) => 7,
        }
    }

    /// Whether the session may advance the queue on its own
    ///
    /// Only acquisition and mid-playback failures are recoverable this way.
    /// A lost connection needs the user to start again.
    pub fn allows_auto_advance(&self) -> bool {
        matches!(self, PlaybackError::Load(_) | PlaybackError::Play(_))
    }
}

impl From<reqwest::Error> for PlaybackError {
    fn from(e: reqwest::Error) -> Self {
        PlaybackError::Network(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PlaybackError>;
