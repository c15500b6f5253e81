//! Proxy server implementation
//! Terminates TLS on each configured listen port and relays plaintext
//! bytes to the matching upstream port on the bind host.

use crate::config::{PortPair, ProxyConfig};
use crate::error::{ProxyError, Result};
use crate::tls;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Relay copy buffer size.
const RELAY_BUF_SIZE: usize = 8192;

/// Sleep between retries after a failed accept.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Counts in-flight sessions so shutdown can wait for them to drain.
#[derive(Debug, Default)]
struct SessionGauge {
    active: AtomicUsize,
    idle: Notify,
}

impl SessionGauge {
    fn enter(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    fn exit(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Handle to one running listener.
///
/// Owns the accept loop: dropping the handle (or calling [`stop`]) closes
/// the listening socket. Sessions already accepted keep running either way.
///
/// [`stop`]: ListenerHandle::stop
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    pair: PortPair,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// The address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The configured port pair behind this listener.
    pub fn port_pair(&self) -> PortPair {
        self.pair
    }

    /// Stop accepting new connections. In-flight sessions drain on their own.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    acceptor: TlsAcceptor,
    sessions: Arc<SessionGauge>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("config", &self.config)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

impl ProxyServer {
    /// Create a new proxy server, loading the TLS material once.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let acceptor = tls::load_acceptor(&config.cert_path, &config.key_path)?;

        Ok(Self {
            config,
            acceptor,
            sessions: Arc::new(SessionGauge::default()),
        })
    }

    /// Bind one TLS listener per configured port pair, in order.
    ///
    /// Every listener's accept loop is running when this returns. Any bind
    /// failure is fatal: handles already created are dropped, which closes
    /// their sockets, so there is no partial startup.
    pub async fn start(&self) -> Result<Vec<ListenerHandle>> {
        let mut handles = Vec::with_capacity(self.config.port_pairs.len());

        for pair in &self.config.port_pairs {
            let addr = SocketAddr::new(self.config.bind_addr, pair.listen);
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| ProxyError::Bind { addr, source: e })?;
            let local_addr = listener
                .local_addr()
                .map_err(|e| ProxyError::Bind { addr, source: e })?;
            let upstream_addr = SocketAddr::new(self.config.bind_addr, pair.upstream);

            info!(
                "TLS listener on {} forwarding to {}",
                local_addr, upstream_addr
            );

            let acceptor = self.acceptor.clone();
            let sessions = Arc::clone(&self.sessions);
            let task = tokio::spawn(accept_loop(listener, acceptor, upstream_addr, sessions));

            handles.push(ListenerHandle {
                local_addr,
                pair: *pair,
                task,
            });
        }

        Ok(handles)
    }

    /// Number of sessions currently relaying.
    pub fn active_sessions(&self) -> usize {
        self.sessions.count()
    }

    /// Wait up to `grace` for in-flight sessions to drain.
    ///
    /// Returns `true` if all sessions completed within the grace period.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        tokio::time::timeout(grace, self.sessions.wait_idle())
            .await
            .is_ok()
    }
}

/// Accept connections and spawn a forwarding session for each.
async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    upstream_addr: SocketAddr,
    sessions: Arc<SessionGauge>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let acceptor = acceptor.clone();
                let sessions = Arc::clone(&sessions);

                sessions.enter();
                tokio::spawn(async move {
                    if let Err(e) = handle_session(stream, peer_addr, acceptor, upstream_addr).await
                    {
                        debug!("Session error from {}: {}", peer_addr, e);
                    }
                    sessions.exit();
                });
            }
            Err(e) => {
                error!("Accept error: {}", e);
                // Avoid a tight loop on persistent errors (e.g. EMFILE)
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Run one forwarding session: TLS handshake, upstream connect, relay.
///
/// Any failure here closes only this session; the sockets are dropped on
/// return and the client sees a transport-level close.
async fn handle_session(
    stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    upstream_addr: SocketAddr,
) -> Result<()> {
    let tls_stream = acceptor.accept(stream).await?;
    debug!("TLS handshake complete with {}", peer_addr);

    // The upstream connection is opened only once decryption is established.
    let upstream =
        TcpStream::connect(upstream_addr)
            .await
            .map_err(|e| ProxyError::UpstreamUnreachable {
                addr: upstream_addr,
                source: e,
            })?;

    let (to_upstream, to_client) = relay(tls_stream, upstream).await?;

    debug!(
        "Session with {} closed: {} bytes to upstream, {} bytes to client",
        peer_addr, to_upstream, to_client
    );

    Ok(())
}

/// Relay bytes between both streams until each direction reaches EOF.
///
/// EOF on one side propagates as a half-close: the peer's write half is
/// shut down while the opposite direction keeps flowing. An I/O error in
/// either direction returns immediately, dropping (and so closing) both
/// streams.
///
/// Returns (bytes client to upstream, bytes upstream to client).
async fn relay<C, U>(client: C, upstream: U) -> io::Result<(u64, u64)>
where
    C: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    tokio::try_join!(
        copy_half(&mut client_read, &mut upstream_write),
        copy_half(&mut upstream_read, &mut client_write),
    )
}

/// Copy one direction byte-for-byte, then shut down the write side.
async fn copy_half<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }

    writer.shutdown().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relay_byte_transparency() {
        let (mut client, client_far) = tokio::io::duplex(64);
        let (mut upstream, upstream_far) = tokio::io::duplex(64);

        let relay_task = tokio::spawn(relay(client_far, upstream_far));

        client.write_all(b"hello upstream").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        upstream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello upstream");

        upstream.write_all(b"hello client").await.unwrap();
        upstream.shutdown().await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello client");

        let (to_upstream, to_client) = relay_task.await.unwrap().unwrap();
        assert_eq!(to_upstream, 14);
        assert_eq!(to_client, 12);
    }

    #[tokio::test]
    async fn test_relay_half_close_keeps_reverse_direction_open() {
        let (mut client, client_far) = tokio::io::duplex(64);
        let (mut upstream, upstream_far) = tokio::io::duplex(64);

        let relay_task = tokio::spawn(relay(client_far, upstream_far));

        // Client finishes sending; upstream must see EOF.
        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut request = Vec::new();
        upstream.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");

        // The upstream->client direction stays open after the client's
        // half-close; a late reply must still arrive.
        upstream.write_all(b"late reply").await.unwrap();
        upstream.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"late reply");

        relay_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_relay_preserves_ordering_across_chunks() {
        let (mut client, client_far) = tokio::io::duplex(64);
        let (mut upstream, upstream_far) = tokio::io::duplex(64);

        let relay_task = tokio::spawn(relay(client_far, upstream_far));

        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            for chunk in payload.chunks(100) {
                client.write_all(chunk).await.unwrap();
            }
            client.shutdown().await.unwrap();
            client
        });

        let mut received = Vec::new();
        upstream.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);

        drop(upstream);
        drop(writer.await.unwrap());
        let _ = relay_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_gauge_waits_for_drain() {
        let gauge = Arc::new(SessionGauge::default());
        gauge.enter();
        gauge.enter();

        let waiter = {
            let gauge = Arc::clone(&gauge);
            tokio::spawn(async move { gauge.wait_idle().await })
        };

        gauge.exit();
        assert_eq!(gauge.count(), 1);
        assert!(!waiter.is_finished());

        gauge.exit();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_idle should resolve once all sessions exit")
            .unwrap();
    }

    #[tokio::test]
    async fn test_session_gauge_idle_immediately_when_empty() {
        let gauge = SessionGauge::default();
        tokio::time::timeout(Duration::from_secs(1), gauge.wait_idle())
            .await
            .expect("an empty gauge is already idle");
    }
}
