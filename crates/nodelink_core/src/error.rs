use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeLinkError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Gateway rejected connect: {0}")]
    AuthRejected(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("External command error: {0}")]
    ExternalCommand(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl NodeLinkError {
    /// Whether a caller-owned retry loop may try the handshake again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NodeLinkError::Transport(_) | NodeLinkError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, NodeLinkError>;
