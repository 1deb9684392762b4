use aether_protocol::BlockId;
use aether_protocol::SessionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn terminal process: {pty_error}")]
    Spawn {
        #[source]
        pty_error: anyhow::Error,
    },
    #[error("transport is closed")]
    Closed,
    #[error("terminal I/O failed: {error}")]
    Io {
        #[source]
        error: std::io::Error,
    },
    #[error("invalid terminal geometry {rows}x{cols}")]
    InvalidGeometry { rows: u16, cols: u16 },
}

impl TransportError {
    pub(crate) fn spawn(error: anyhow::Error) -> Self {
        Self::Spawn { pty_error: error }
    }

    pub(crate) fn io(error: std::io::Error) -> Self {
        Self::Io { error }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// Operation attempted against a session that is no longer `Running`.
    /// Recoverable by opening a new session.
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown session id {session_id}")]
    NotFound { session_id: SessionId },
    #[error("failed to create session: {source}")]
    Create {
        #[source]
        source: SessionError,
    },
}

/// Contract violations inside the block history store. `NoSuchEntry` and
/// `AlreadyComplete` indicate a dispatcher bug when observed at runtime.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HistoryError {
    #[error("block {block_id} is still in progress")]
    BlockInProgress { block_id: BlockId },
    #[error("no such history entry {block_id}")]
    NoSuchEntry { block_id: BlockId },
    #[error("history entry {block_id} is already complete")]
    AlreadyComplete { block_id: BlockId },
}

#[derive(Debug, Error)]
pub enum SuggestError {
    #[error("suggestion provider unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("suggestion request timed out")]
    Timeout,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error("invalid prompt pattern: {error}")]
    PromptPattern {
        #[source]
        error: regex_lite::Error,
    },
    /// Degrades gracefully: suggestion failures never block command
    /// submission.
    #[error("suggestion unavailable: {reason}")]
    SuggestionUnavailable { reason: String },
}
