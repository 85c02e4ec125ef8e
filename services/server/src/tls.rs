//! TLS termination for the relay listener.
//!
//! When both PEM files are present the server speaks `wss`; otherwise it falls
//! back to plaintext. Handshakes run in their own tasks so one slow client
//! never stalls the accept loop.

use axum::{extract::connect_info::Connected, serve::IncomingStream};
use rustls::{
    ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer},
};
use std::{
    fs::File,
    io::{self, BufReader},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_rustls::{TlsAcceptor, server::TlsStream};
use tracing::{debug, warn};

/// Upper bound on a single TLS handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Completed handshakes waiting for axum to pick them up.
const ACCEPT_BACKLOG: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no certificates found in {0:?}")]
    NoCertificates(PathBuf),
    #[error("no private key found in {0:?}")]
    NoPrivateKey(PathBuf),
    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Builds an acceptor from PEM files.
///
/// Returns `Ok(None)` when either file is missing, so the caller can serve
/// plaintext. Files that exist but cannot be used are an error.
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<Option<TlsAcceptor>, TlsError> {
    if !cert_path.is_file() || !key_path.is_file() {
        return Ok(None);
    }
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

/// An [`axum::serve::Listener`] that yields already-handshaken TLS streams.
pub struct TlsListener {
    local_addr: SocketAddr,
    ready: mpsc::Receiver<(TlsStream<TcpStream>, SocketAddr)>,
    accept_loop: JoinHandle<()>,
}

impl TlsListener {
    pub fn new(listener: TcpListener, acceptor: TlsAcceptor) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (tx, ready) = mpsc::channel(ACCEPT_BACKLOG);
        let accept_loop = tokio::spawn(accept_loop(listener, acceptor, tx));
        Ok(Self {
            local_addr,
            ready,
            accept_loop,
        })
    }
}

impl Drop for TlsListener {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    ready: mpsc::Sender<(TlsStream<TcpStream>, SocketAddr)>,
) {
    while !ready.is_closed() {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(error = %e, "Failed to accept TCP connection.");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let ready = ready.clone();
        tokio::spawn(async move {
            match timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    let _ = ready.send((tls, peer)).await;
                }
                Ok(Err(e)) => debug!(%peer, error = %e, "TLS handshake failed."),
                Err(_) => debug!(%peer, "TLS handshake timed out."),
            }
        });
    }
}

/// The client's address as seen by the listener.
///
/// Handlers extract it as `ConnectInfo<PeerAddr>`, which works the same over
/// the plain and the TLS listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

impl Connected<IncomingStream<'_, TcpListener>> for PeerAddr {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        PeerAddr(*stream.remote_addr())
    }
}

impl Connected<IncomingStream<'_, TlsListener>> for PeerAddr {
    fn connect_info(stream: IncomingStream<'_, TlsListener>) -> Self {
        PeerAddr(*stream.remote_addr())
    }
}

impl axum::serve::Listener for TlsListener {
    type Io = TlsStream<TcpStream>;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.ready.recv().await {
            Some(conn) => conn,
            // The accept loop only stops when the listener itself is dropped.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::serve::Listener;
    use rustls::{ClientConfig, RootCertStore, pki_types::ServerName};
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::TlsConnector;

    const CERT_PEM: &str = include_str!("../tests/fixtures/cert.pem");
    const KEY_PEM: &str = include_str!("../tests/fixtures/key.pem");

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn missing_material_means_plaintext() {
        let cert = write_temp(CERT_PEM);
        let missing = Path::new("/nonexistent/relay/key.pem");
        assert!(load_tls_acceptor(cert.path(), missing).unwrap().is_none());
        assert!(load_tls_acceptor(missing, cert.path()).unwrap().is_none());
    }

    #[test]
    fn present_but_unusable_material_is_an_error() {
        let empty = write_temp("");
        let key = write_temp(KEY_PEM);
        let Err(err) = load_tls_acceptor(empty.path(), key.path()) else {
            panic!("empty certificate file accepted");
        };
        assert!(matches!(err, TlsError::NoCertificates(_)));

        let cert = write_temp(CERT_PEM);
        let Err(err) = load_tls_acceptor(cert.path(), cert.path()) else {
            panic!("certificate accepted as a private key");
        };
        assert!(matches!(err, TlsError::NoPrivateKey(_)));
    }

    #[test]
    fn valid_material_builds_an_acceptor() {
        let cert = write_temp(CERT_PEM);
        let key = write_temp(KEY_PEM);
        assert!(load_tls_acceptor(cert.path(), key.path()).unwrap().is_some());
    }

    #[tokio::test]
    async fn listener_yields_handshaken_streams() {
        let cert = write_temp(CERT_PEM);
        let key = write_temp(KEY_PEM);
        let acceptor = load_tls_acceptor(cert.path(), key.path()).unwrap().unwrap();
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut listener = TlsListener::new(tcp, acceptor).unwrap();
        let addr = listener.local_addr().unwrap();

        // A client that never starts the handshake must not block the next one.
        let _idle = TcpStream::connect(addr).await.unwrap();

        let mut roots = RootCertStore::empty();
        for der in rustls_pemfile::certs(&mut CERT_PEM.as_bytes()) {
            roots.add(der.unwrap()).unwrap();
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let client_config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_config));

        let client = tokio::spawn(async move {
            let tcp = TcpStream::connect(addr).await.unwrap();
            let domain = ServerName::try_from("localhost").unwrap();
            let mut tls = connector.connect(domain, tcp).await.unwrap();
            tls.write_all(b"ping").await.unwrap();
            tls.flush().await.unwrap();
            tls
        });

        let (mut server_side, peer) = listener.accept().await;
        assert!(peer.ip().is_loopback());
        let mut buf = [0u8; 4];
        server_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        drop(client.await.unwrap());
    }
}
