//! Crate-wide error types
//!
//! Delivery over the bus is best-effort: transport-level failures close
//! the offending connection and are logged rather than surfaced. The
//! errors here are the ones callers can actually observe: startup
//! failures, registration asymmetry, codec problems and misuse of a bus
//! that is not running.

use crate::cluster::node::NodeAddress;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for event bus operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error (bind, connect, read, write)
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Startup failed; the underlying cause is attached
    #[error("startup failed: {0}")]
    Startup(#[source] Box<Error>),

    /// The bus is not in the RUNNING state
    #[error("event bus is not running")]
    NotRunning,

    /// A wire payload could not be decoded
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// No codec registered under the given name
    #[error("no codec registered for name '{0}'")]
    UnknownCodec(String),

    /// A codec with the same name is already registered
    #[error("codec '{0}' already registered")]
    DuplicateCodec(String),

    /// A registry operation against the replicated multi-map failed
    #[error("registry error: {0}")]
    Registry(String),

    /// Unregistering found no matching subscription entry
    #[error("sub not found: {address} -> {node}")]
    SubNotFound {
        /// Address whose registration was being withdrawn
        address: String,
        /// Node value that was expected in the registry
        node: NodeAddress,
    },

    /// The message carries no reply address to answer to
    #[error("message has no reply address")]
    NoReplyAddress,

    /// No reply arrived within the configured reply timeout
    #[error("no reply received within {0:?}")]
    ReplyTimeout(std::time::Duration),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Wrap an error as a startup failure, preserving the cause.
    pub fn startup(cause: Error) -> Self {
        Error::Startup(Box::new(cause))
    }
}
