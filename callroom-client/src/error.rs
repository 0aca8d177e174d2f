use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Signaling channel failed or closed before the handshake finished
    #[error("Connection error: {0}")]
    Connection(String),

    /// A round trip exceeded its deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Server traffic referenced a transport that does not exist yet
    #[error("Protocol order violation: {0}")]
    ProtocolOrder(String),

    #[error("Capability negotiation failed: {0}")]
    Capability(String),

    /// Local media capture denied or unavailable
    #[error("Media capture error: {0}")]
    Resource(String),

    #[error("Subscription failed: {0}")]
    Subscription(String),

    #[error("Request '{method}' rejected by server: {reason}")]
    Rejected { method: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// The owning session attempt was torn down while the operation was in flight
    #[error("Session closed")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error must end the session.
    ///
    /// Subscription failures only reject the originating request, and
    /// `Closed` means the session is already gone.
    #[must_use]
    pub const fn is_session_fatal(&self) -> bool {
        !matches!(self, Self::Subscription(_) | Self::Closed)
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::Config(format!("invalid signaling url: {err}"))
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
