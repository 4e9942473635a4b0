//! TLS termination
//!
//! [`TlsListener`] feeds handshaken rustls streams into `axum::serve`, so
//! HTTPS slots run through the same serving path as plain ones.
//! Certificates are chosen per handshake by the
//! [`CertResolver`](crate::certs::CertResolver). Clients get a bounded
//! window to finish the handshake, and a failing accept loop backs off
//! instead of spinning, since one hot listener would otherwise starve the
//! other slots of the process.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::server::ResolvesServerCert;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// Deadline for a client to complete its TLS handshake. Slots share one
/// worker pool, so half-open handshakes must not linger.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Base pause after a failed `accept(2)`; doubles per consecutive failure.
const ACCEPT_BACKOFF_UNIT: Duration = Duration::from_millis(50);

/// Cap on the backoff doubling (50ms << 4 = 800ms).
const ACCEPT_BACKOFF_MAX_SHIFT: u32 = 4;

/// Build the rustls server configuration around a certificate resolver.
pub fn server_config(resolver: Arc<dyn ResolvesServerCert>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Arc::new(config)
}

/// TCP listener that yields only connections with a completed TLS
/// handshake.
pub struct TlsListener {
    tcp: TcpListener,
    tls: TlsAcceptor,
    /// Consecutive `accept(2)` failures, for backoff. Reset on success.
    accept_failures: u32,
}

impl TlsListener {
    pub fn new(tcp: TcpListener, config: Arc<ServerConfig>) -> Self {
        Self {
            tcp,
            tls: TlsAcceptor::from(config),
            accept_failures: 0,
        }
    }

    /// One accept attempt. `None` means this connection (or accept call)
    /// went nowhere and the caller should try again.
    async fn next_handshaken(&mut self) -> Option<(TlsStream<TcpStream>, SocketAddr)> {
        let (stream, peer) = match self.tcp.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                // Usually fd exhaustion or a dying interface; pause with
                // the rest of the accept loops unaffected.
                tracing::error!("accept failed on TLS listener: {err}");
                let shift = self.accept_failures.min(ACCEPT_BACKOFF_MAX_SHIFT);
                self.accept_failures = self.accept_failures.saturating_add(1);
                tokio::time::sleep(ACCEPT_BACKOFF_UNIT * (1u32 << shift)).await;
                return None;
            }
        };
        self.accept_failures = 0;

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.tls.accept(stream)).await {
            Ok(Ok(tls_stream)) => Some((tls_stream, peer)),
            Ok(Err(err)) => {
                tracing::warn!("TLS handshake with {peer} failed: {err}");
                None
            }
            Err(_) => {
                tracing::warn!("TLS handshake with {peer} exceeded {HANDSHAKE_TIMEOUT:?}");
                None
            }
        }
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            if let Some(conn) = self.next_handshaken().await {
                return conn;
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.tcp.local_addr()
    }
}

/// Connection metadata handed to axum's connect-info extractor. A local
/// newtype is required here because neither `axum`'s `Connected` trait nor
/// `std::net::SocketAddr` are defined in this crate, and [`TlsListener`]
/// is not a type axum itself knows how to derive connect info for.
#[derive(Clone, Copy, Debug)]
pub struct RemoteAddr(pub SocketAddr);

impl axum::extract::connect_info::Connected<axum::serve::IncomingStream<'_, TlsListener>> for RemoteAddr {
    fn connect_info(stream: axum::serve::IncomingStream<'_, TlsListener>) -> Self {
        RemoteAddr(*stream.remote_addr())
    }
}

impl axum::extract::connect_info::Connected<axum::serve::IncomingStream<'_, TcpListener>> for RemoteAddr {
    fn connect_info(stream: axum::serve::IncomingStream<'_, TcpListener>) -> Self {
        RemoteAddr(*stream.remote_addr())
    }
}
