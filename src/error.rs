//! Error taxonomy shared by the wire codec, connection pool, registry and brokerage layers.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Errors surfaced anywhere in the brokerage/coordinator core.
///
/// Every variant carries the context a log line needs so call sites don't have to
/// look anything up a second time.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to bind to port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("operation timed out: {0}")]
    Elapsed(#[from] tokio::time::error::Elapsed),

    #[error("corrupt frame from {peer:?}: {reason}")]
    CorruptFrame {
        peer: Option<SocketAddr>,
        reason: String,
    },

    #[error("unknown message type {0}")]
    UnknownMessage(u8),

    #[error("filesystem unavailable at {path}: {source}")]
    FilesystemUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no brokerage configured (set FASTBUILD_COORDINATOR or FASTBUILD_BROKERAGE_PATH)")]
    NotConfigured,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
