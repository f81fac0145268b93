//! Error taxonomy for the synchronization core.

use std::time::Duration;

use crate::ids::SessionId;

/// Typed error hierarchy for the synchronization core.
///
/// Registry-layer failures (`Transport`, `Protocol`) normally never reach a
/// caller: they become dispatched events or log entries. The remaining
/// variants are returned from controller, pipeline and HTTP client calls.
#[derive(Clone, Debug, thiserror::Error)]
pub enum SyncError {
    /// Connection-level failure; terminal for the session.
    #[error("transport error: {0}")]
    Transport(String),
    /// Malformed or unparseable frame.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server has no record of the addressed session.
    #[error("session not found: {session_id}")]
    SessionNotFound {
        /// The rejected id.
        session_id: SessionId,
    },
    /// Server-reported failure delivered as `server_error_event`.
    #[error("server error: {0}")]
    Application(String),
    /// Persisting the document failed.
    #[error("save failed: {0}")]
    Save(String),
    /// Fetching the document or agent state failed.
    #[error("fetch failed: {0}")]
    Fetch(String),
    /// Any other non-success HTTP status.
    #[error("http error {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },
    /// The request did not complete within the configured timeout.
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    /// An operation was called in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Result type for synchronization operations.
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::SessionNotFound { .. } => "session_not_found",
            Self::Application(_) => "application",
            Self::Save(_) => "save",
            Self::Fetch(_) => "fetch",
            Self::Http { .. } => "http",
            Self::Timeout(_) => "timeout",
            Self::InvalidState(_) => "invalid_state",
        }
    }

    /// Whether the server rejected the session id.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound { .. })
    }

    /// The rejected session id, for `SessionNotFound`.
    pub fn missing_session(&self) -> Option<&SessionId> {
        match self {
            Self::SessionNotFound { session_id } => Some(session_id),
            _ => None,
        }
    }

    /// Classify a non-success HTTP status from a session-addressed request.
    ///
    /// A 404 on a request addressed to `session_id` means the server has no
    /// record of that session.
    pub fn from_status(status: u16, body: String, session_id: Option<&SessionId>) -> Self {
        match (status, session_id) {
            (404, Some(id)) => Self::SessionNotFound {
                session_id: id.clone(),
            },
            _ => Self::Http { status, body },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
