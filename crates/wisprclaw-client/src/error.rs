use wisprclaw_core::IdentityError;

/// Everything that can go wrong talking to the gateway.
///
/// [`Error::is_connection_level`] splits the variants into "could not reach
/// the agent" (worth one reconnect) and "the agent answered with an error"
/// (never retried, the gateway already processed the request).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid gateway url: {0}")]
    InvalidUrl(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("agent error: {0}")]
    Agent(String),
    #[error("malformed request: {0}")]
    Encode(String),
}

impl Error {
    /// True for failures of the connection itself rather than of the request.
    pub fn is_connection_level(&self) -> bool {
        match self {
            Self::InvalidUrl(_)
            | Self::Transport(_)
            | Self::Closed(_)
            | Self::Handshake(_)
            | Self::Cancelled => true,
            Self::Agent(_) | Self::Encode(_) => false,
        }
    }
}

impl From<IdentityError> for Error {
    fn from(e: IdentityError) -> Self {
        Self::Handshake(format!("signing failed: {e}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::Url(e) => Self::InvalidUrl(e.to_string()),
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                Self::Closed("socket already closed".to_string())
            }
            other => Self::Transport(other.to_string()),
        }
    }
}
