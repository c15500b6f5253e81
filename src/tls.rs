//! TLS material loading
//! Reads the PEM certificate/key pair once at startup and builds the
//! acceptor shared by all listeners.

use crate::error::{ProxyError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Load `cert_path` and `key_path` and build a TLS acceptor.
///
/// Both files are read exactly once, with blocking I/O; this runs before
/// any socket exists. Missing, unreadable or unparsable files fail with
/// [`ProxyError::CertificateLoad`].
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::CertificateLoad {
            path: cert_path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, e),
        })?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Read a PEM certificate chain.
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| ProxyError::CertificateLoad {
        path: path.to_path_buf(),
        source: e,
    })?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<io::Result<_>>()
        .map_err(|e| ProxyError::CertificateLoad {
            path: path.to_path_buf(),
            source: e,
        })?;

    if certs.is_empty() {
        return Err(ProxyError::CertificateLoad {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, "no certificates found in file"),
        });
    }

    Ok(certs)
}

/// Read a PEM private key.
fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| ProxyError::CertificateLoad {
        path: path.to_path_buf(),
        source: e,
    })?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(file)).map_err(|e| {
        ProxyError::CertificateLoad {
            path: path.to_path_buf(),
            source: e,
        }
    })?;

    key.ok_or_else(|| ProxyError::CertificateLoad {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidData, "no private key found in file"),
    })
}
