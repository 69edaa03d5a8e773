//! Error types for session lifecycle and control-mode operations.

use thiserror::Error;

use crate::card::{BackendKind, CardId};

/// Errors surfaced by the registry, process handles and control sessions.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The subprocess could not be started.
    #[error("failed to start {program}: {reason}")]
    SpawnFailed { program: String, reason: String },

    /// The control-mode connection did not answer in time.
    #[error("tmux control mode did not respond within {0}ms")]
    HandshakeTimeout(u64),

    /// The pipe to tmux was severed.
    #[error("tmux connection closed")]
    ChannelClosed,

    /// A protocol line could not be understood. Recovered inside the parser.
    #[error("malformed control-mode line: {0}")]
    MalformedProtocolLine(String),

    /// tmux is not installed or not reachable.
    #[error("tmux is not available: {0}")]
    BackendUnavailable(String),

    /// No active session exists for the card.
    #[error("no active session for card {0}")]
    UnknownSession(CardId),

    /// The backend of an active session cannot change.
    #[error("card {card} is active on the {current} backend; close it before switching to {requested}")]
    BackendLocked {
        card: CardId,
        current: BackendKind,
        requested: BackendKind,
    },

    /// A tmux command reported failure.
    #[error("tmux command failed: {0}")]
    Multiplexer(String),
}

impl SessionError {
    /// Build a `SpawnFailed` with a readable reason for common IO failures.
    pub fn spawn_failed(program: impl Into<String>, err: &dyn std::fmt::Display) -> Self {
        let program = program.into();
        let raw = err.to_string();
        let reason = if raw.contains("No such file") || raw.contains("not found") {
            "executable not found".to_string()
        } else if raw.contains("Permission denied") {
            "permission denied".to_string()
        } else {
            raw
        };
        SessionError::SpawnFailed { program, reason }
    }

    /// Whether a caller may retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SessionError::HandshakeTimeout(_) | SessionError::ChannelClosed
        )
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
