//! Error types for presencecast

use thiserror::Error;

/// Main error type for transport and presence operations
#[derive(Error, Debug)]
pub enum TransportError {
    /// Engine session could not be created, bound or started
    #[error("Session error: {0}")]
    Session(String),

    /// The multicast engine failed; the dispatch loop cannot continue
    #[error("Engine error: {0}")]
    Engine(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error during JSON serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Payload compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// A chat stanza could not be parsed or written
    #[error("Stanza error: {0}")]
    Stanza(String),

    /// Configuration value is unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Port range string could not be parsed or is empty
    #[error("Invalid port range: {0}")]
    InvalidPortRange(String),

    /// Operation on a channel that has already been closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// No session with the given id is known to the engine
    #[error("Unknown session: {0}")]
    UnknownSession(u64),
}

/// Result type alias using TransportError
pub type TransportResult<T> = Result<T, TransportError>;
