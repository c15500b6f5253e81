//! TlsProxy - A dual-listener TLS-terminating reverse proxy
//!
//! Accepts TLS connections on a pair of listen ports (8443 and 443 by
//! default), decrypts them with a locally provisioned certificate/key
//! pair, and relays the plaintext byte-for-byte to the matching backend
//! ports (8000 and 80) on the same host. Each accepted connection is an
//! independent forwarding session; no state is shared between sessions
//! beyond the read-only configuration.

pub mod config;
pub mod error;
pub mod proxy;
pub mod tls;

pub use config::{PortPair, ProxyConfig, DEFAULT_PORT_PAIRS};
pub use error::{ProxyError, Result};
pub use proxy::{ListenerHandle, ProxyServer};
