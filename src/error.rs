use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

use crate::protocol::Transport;

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Invalid bind address: {0}")]
    InvalidBindAddress(String),

    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Failed to read config file {path}: {reason}")]
    FileRead { path: String, reason: String },

    #[error("Failed to parse config file {path}: {reason}")]
    FileParse { path: String, reason: String },
}

/// Errors surfaced by the listener core.
///
/// Only `Bind` (and lifecycle misuse) is fatal. `Socket` is logged and
/// isolated to one datagram or connection, while `MessageTooLarge` and
/// `ReplyDropped` come back to the query handler as plain values.
#[derive(Error, Debug, Clone)]
pub enum BeesError {
    #[error("Failed to bind {transport} socket on {addr}: {source}")]
    Bind {
        transport: Transport,
        addr: SocketAddr,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("{transport} socket error: {source}")]
    Socket {
        transport: Transport,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("Message too large: {len} bytes (max 65535)")]
    MessageTooLarge { len: usize },

    #[error("Reply dropped: connection or socket already closed")]
    ReplyDropped,

    #[error("Server is already running")]
    AlreadyRunning,

    #[error("Server has been stopped and cannot be restarted")]
    ServerStopped,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl BeesError {
    pub(crate) fn bind(transport: Transport, addr: SocketAddr, err: std::io::Error) -> Self {
        BeesError::Bind {
            transport,
            addr,
            source: Arc::new(err),
        }
    }

    pub(crate) fn socket(transport: Transport, err: std::io::Error) -> Self {
        BeesError::Socket {
            transport,
            source: Arc::new(err),
        }
    }

    /// True for the "port unavailable" class of failures, regardless of transport.
    pub fn is_bind_error(&self) -> bool {
        matches!(self, BeesError::Bind { .. })
    }
}

pub type Result<T> = std::result::Result<T, BeesError>;
