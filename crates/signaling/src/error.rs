//! Error types for the signaling core

use crate::session::SessionState;

/// Result type alias using the infrastructure [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Infrastructure errors: configuration, sockets, the hub task and the
/// pipeline adapter.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// WebSocket handshake or framing error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The state-owning hub task is gone
    #[error("Signaling hub unavailable: {0}")]
    HubUnavailable(String),

    /// The hub refused a new connection
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// The media pipeline failed to perform an operation
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_) | Error::ConfigParse(_))
    }
}

/// Broad classification of [`SignalingError`]s
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or unrecognized envelope shape
    Protocol,
    /// Operation invalid against current peer/session state
    Session,
    /// Delivery to a connection that is gone
    Transport,
}

/// Protocol-level errors.
///
/// Every variant is turned into an `error` envelope for the requester (or,
/// for transport failures, into a peer reap) at the router boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalingError {
    /// Missing or malformed envelope field
    #[error("Invalid message: {0}")]
    Validation(String),

    /// Session id already bound to a live session
    #[error("Session already exists: {0}")]
    DuplicateSession(String),

    /// Operation not allowed from the session's current state
    #[error("Invalid transition: cannot {operation} session {session_id} in state {state}")]
    InvalidTransition {
        session_id: String,
        operation: &'static str,
        state: SessionState,
    },

    /// Peer id not present in the registry
    #[error("Peer not found: {0}")]
    UnknownPeer(String),

    /// Session id never created (or already pruned)
    #[error("Session not found: {0}")]
    UnknownSession(String),

    /// Peer addressed a session it is not party to
    #[error("Peer {peer_id} is not part of session {session_id}")]
    NotInSession { peer_id: String, session_id: String },

    /// Target connection no longer accepts messages
    #[error("Peer {0} is no longer connected")]
    PeerGone(String),
}

impl SignalingError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            SignalingError::Validation(_) => ErrorKind::Protocol,
            SignalingError::PeerGone(_) => ErrorKind::Transport,
            SignalingError::DuplicateSession(_)
            | SignalingError::InvalidTransition { .. }
            | SignalingError::UnknownPeer(_)
            | SignalingError::UnknownSession(_)
            | SignalingError::NotInSession { .. } => ErrorKind::Session,
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        SignalingError::Validation(msg.into())
    }
}
