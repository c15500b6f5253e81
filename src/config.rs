//! Proxy configuration
//! Built once at startup, read-only afterwards

use directories::BaseDirs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// The fixed listener/upstream port pairs of the reference deployment.
pub const DEFAULT_PORT_PAIRS: [PortPair; 2] = [
    PortPair {
        listen: 8443,
        upstream: 8000,
    },
    PortPair {
        listen: 443,
        upstream: 80,
    },
];

/// Default grace period for draining in-flight sessions on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// One listener: TLS is terminated on `listen` and plaintext is forwarded
/// to `upstream` on the same host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortPair {
    pub listen: u16,
    pub upstream: u16,
}

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the listeners bind to; also the upstream host.
    pub bind_addr: IpAddr,
    /// PEM-encoded certificate chain.
    pub cert_path: PathBuf,
    /// PEM-encoded private key matching the certificate.
    pub key_path: PathBuf,
    /// Ordered listener/upstream pairs, one listener each.
    pub port_pairs: Vec<PortPair>,
    /// How long in-flight sessions may drain after listeners stop.
    pub shutdown_grace: Duration,
}

impl ProxyConfig {
    /// Create a configuration for `bind_addr` with the default port pairs,
    /// reading `cert.pem` and `key.pem` from `config_dir`.
    pub fn new(bind_addr: IpAddr, config_dir: &std::path::Path) -> Self {
        Self {
            bind_addr,
            cert_path: config_dir.join("cert.pem"),
            key_path: config_dir.join("key.pem"),
            port_pairs: DEFAULT_PORT_PAIRS.to_vec(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Per-user configuration directory holding `cert.pem` and `key.pem`.
///
/// Returns `None` when no home directory can be determined.
pub fn default_config_dir() -> Option<PathBuf> {
    BaseDirs::new().map(|dirs| dirs.home_dir().join(".tlsproxy"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port_pairs() {
        assert_eq!(
            DEFAULT_PORT_PAIRS,
            [
                PortPair {
                    listen: 8443,
                    upstream: 8000
                },
                PortPair {
                    listen: 443,
                    upstream: 80
                },
            ]
        );
    }

    #[test]
    fn test_config_paths() {
        let config = ProxyConfig::new(
            "10.0.0.5".parse().unwrap(),
            std::path::Path::new("/home/user/.tlsproxy"),
        );
        assert_eq!(
            config.cert_path,
            PathBuf::from("/home/user/.tlsproxy/cert.pem")
        );
        assert_eq!(
            config.key_path,
            PathBuf::from("/home/user/.tlsproxy/key.pem")
        );
        assert_eq!(config.port_pairs, DEFAULT_PORT_PAIRS.to_vec());
    }
}
