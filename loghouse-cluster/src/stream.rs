//! Single-port stream layer.
//!
//! Consensus and record traffic share one TCP port per node. Outgoing
//! consensus connections write a one-byte tag before anything else; the
//! accept loop reads one byte from every inbound connection and routes tagged
//! streams to the consensus server. Any other first byte is the start of a
//! record client's HTTP/2 preface, so it is replayed into the stream and the
//! connection goes to the record server. Either direction is optionally
//! wrapped in TLS; the peer certificate's subject common name is surfaced to
//! the record service through tonic's connect-info.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, ServerConfig, ServerConnection};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Tag byte identifying an outgoing consensus connection.
pub const RAFT_RPC: u8 = 1;

/// Listener/dialer pair sharing one TCP port between consensus and record
/// traffic.
pub struct StreamLayer {
    server_tls: Option<TlsAcceptor>,
    peer_tls: Option<TlsConnector>,
}

impl StreamLayer {
    pub fn new(
        server_tls: Option<Arc<ServerConfig>>,
        peer_tls: Option<Arc<ClientConfig>>,
    ) -> Self {
        Self {
            server_tls: server_tls.map(TlsAcceptor::from),
            peer_tls: peer_tls.map(TlsConnector::from),
        }
    }

    /// Dials a consensus connection to a peer: TCP connect, write the tag
    /// byte, then optionally wrap the stream in a client-side TLS session.
    pub async fn dial(&self, addr: &str, timeout: Duration) -> io::Result<MuxStream> {
        let mut tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
        let remote_addr = tcp.peer_addr().ok();
        tcp.write_all(&[RAFT_RPC]).await?;
        let stream = PrefixedStream::new(tcp, None);
        match &self.peer_tls {
            Some(connector) => {
                let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
                let name = ServerName::try_from(host.to_string())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
                let tls = connector.connect(name, stream).await?;
                Ok(MuxStream {
                    io: MuxIo::TlsClient(Box::new(tls)),
                    remote_addr,
                    peer_subject: None,
                })
            }
            None => Ok(MuxStream {
                io: MuxIo::Plain(stream),
                remote_addr,
                peer_subject: None,
            }),
        }
    }

    /// Runs the accept loop, routing each inbound connection to the
    /// consensus or record channel by its first byte.
    pub fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        raft_tx: mpsc::Sender<MuxStream>,
        record_tx: mpsc::Sender<MuxStream>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let layer = Arc::clone(&self);
                let raft_tx = raft_tx.clone();
                let record_tx = record_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = layer.route(stream, peer, raft_tx, record_tx).await {
                        tracing::debug!(%peer, error = %e, "inbound connection dropped");
                    }
                });
            }
        })
    }

    async fn route(
        &self,
        mut tcp: TcpStream,
        peer: SocketAddr,
        raft_tx: mpsc::Sender<MuxStream>,
        record_tx: mpsc::Sender<MuxStream>,
    ) -> io::Result<()> {
        let mut tag = [0u8; 1];
        tcp.read_exact(&mut tag).await?;
        let is_raft = tag[0] == RAFT_RPC;
        // A record client's first byte belongs to its HTTP/2 preface; give
        // it back. The consensus tag is consumed.
        let replay = if is_raft { None } else { Some(tag[0]) };
        let stream = PrefixedStream::new(tcp, replay);

        let mux = match &self.server_tls {
            Some(acceptor) => {
                let tls = acceptor.accept(stream).await?;
                let peer_subject = peer_subject(tls.get_ref().1);
                MuxStream {
                    io: MuxIo::TlsServer(Box::new(tls)),
                    remote_addr: Some(peer),
                    peer_subject,
                }
            }
            None => MuxStream {
                io: MuxIo::Plain(stream),
                remote_addr: Some(peer),
                peer_subject: None,
            },
        };

        let tx = if is_raft { raft_tx } else { record_tx };
        tx.send(mux)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "server is shutting down"))
    }
}

/// Subject common name of the peer's leaf certificate, if it presented one.
fn peer_subject(conn: &ServerConnection) -> Option<String> {
    let certs = conn.peer_certificates()?;
    let leaf = certs.first()?;
    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref()).ok()?;
    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    name
}

/// A stream with an optional single replayed byte at the front.
pub struct PrefixedStream<S> {
    inner: S,
    prefix: Option<u8>,
}

impl<S> PrefixedStream<S> {
    fn new(inner: S, prefix: Option<u8>) -> Self {
        Self { inner, prefix }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(byte) = this.prefix.take() {
            buf.put_slice(&[byte]);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

enum MuxIo {
    Plain(PrefixedStream<TcpStream>),
    TlsClient(Box<tokio_rustls::client::TlsStream<PrefixedStream<TcpStream>>>),
    TlsServer(Box<tokio_rustls::server::TlsStream<PrefixedStream<TcpStream>>>),
}

/// A routed connection, possibly TLS-wrapped.
pub struct MuxStream {
    io: MuxIo,
    remote_addr: Option<SocketAddr>,
    peer_subject: Option<String>,
}

impl AsyncRead for MuxStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().io {
            MuxIo::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MuxIo::TlsClient(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            MuxIo::TlsServer(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MuxStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().io {
            MuxIo::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MuxIo::TlsClient(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            MuxIo::TlsServer(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().io {
            MuxIo::Plain(s) => Pin::new(s).poll_flush(cx),
            MuxIo::TlsClient(s) => Pin::new(s.as_mut()).poll_flush(cx),
            MuxIo::TlsServer(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().io {
            MuxIo::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MuxIo::TlsClient(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            MuxIo::TlsServer(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Connection metadata exposed to the record service. The peer subject is
/// the TLS client certificate's common name; absent on plaintext or
/// certificate-less connections.
#[derive(Debug, Clone)]
pub struct MuxConnectInfo {
    pub remote_addr: Option<SocketAddr>,
    pub peer_subject: Option<String>,
}

impl tonic::transport::server::Connected for MuxStream {
    type ConnectInfo = MuxConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        MuxConnectInfo {
            remote_addr: self.remote_addr,
            peer_subject: self.peer_subject.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_routes_by_first_byte() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let layer = Arc::new(StreamLayer::new(None, None));

        let (raft_tx, mut raft_rx) = mpsc::channel(4);
        let (record_tx, mut record_rx) = mpsc::channel(4);
        let handle = layer.clone().serve(listener, raft_tx, record_tx);

        // Consensus dial: tagged, lands on the raft channel, tag consumed.
        let mut out = layer
            .dial(&addr.to_string(), Duration::from_secs(1))
            .await
            .expect("dial");
        out.io_write(b"ping").await;
        let mut inbound = raft_rx.recv().await.expect("raft conn");
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");

        // Record client: untagged first byte is replayed.
        let mut plain = TcpStream::connect(addr).await.expect("connect");
        plain.write_all(b"PRI *").await.expect("write");
        let mut inbound = record_rx.recv().await.expect("record conn");
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"PRI *");

        handle.abort();
    }

    impl MuxStream {
        async fn io_write(&mut self, data: &[u8]) {
            self.write_all(data).await.expect("write");
            self.flush().await.expect("flush");
        }
    }
}
