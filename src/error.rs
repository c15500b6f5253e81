//! Error types and result alias.
//!
//! Startup-class errors (`CertificateLoad`, `Bind`) abort the process;
//! session-class errors (`UpstreamUnreachable`, `Relay`) close only the
//! session they occurred in.

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Proxy-specific errors.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Certificate or key file missing, unreadable, unparsable or mismatched.
    #[error("failed to load TLS material from {path}: {source}")]
    CertificateLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Listen address/port unavailable.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Upstream refused or timed out while establishing a session.
    #[error("upstream {addr} unreachable: {source}")]
    UpstreamUnreachable {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Mid-stream transport failure within a session.
    #[error("relay error: {0}")]
    Relay(#[from] std::io::Error),
}

/// Result type alias for `ProxyError`.
pub type Result<T> = std::result::Result<T, ProxyError>;
