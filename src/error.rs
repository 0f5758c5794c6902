use thiserror::Error;

use crate::crypto::CryptoError;
use crate::handshake::HandshakeError;
use crate::session::state::SessionStateError;

/// Crate-wide error taxonomy.
///
/// `Validation` is raised synchronously before any network call. `Protocol`
/// covers inbound frames that cannot be understood; those are logged and
/// dropped by the session loop. `Authentication` is fatal to the session.
/// `Resource` is reported back to the counterpart in the `error` field of the
/// response frame.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication error: {0}")]
    Authentication(String),
    #[error("{0}")]
    Resource(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// True when the failure must end the process rather than trigger a reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Authentication(_) | Error::Config(_))
    }
}

impl From<HandshakeError> for Error {
    fn from(err: HandshakeError) -> Self {
        match err {
            HandshakeError::Transport(msg) => Error::Transport(msg),
            HandshakeError::Protocol(msg) => Error::Protocol(msg),
            HandshakeError::Authentication(msg) => Error::Authentication(msg),
            HandshakeError::Crypto(err) => Error::Authentication(err.to_string()),
        }
    }
}

impl From<CryptoError> for Error {
    fn from(err: CryptoError) -> Self {
        Error::Authentication(err.to_string())
    }
}

impl From<SessionStateError> for Error {
    fn from(err: SessionStateError) -> Self {
        Error::Protocol(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(err.to_string())
    }
}
