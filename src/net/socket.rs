//! Tokio-backed [`Socket`] implementation.
//!
//! The core is synchronous; each connection gets an I/O driver task that
//! owns the TCP (or TLS) stream. The `Socket` handle the core holds sends
//! commands to the driver over a channel, and the driver posts inbound
//! bytes and lifecycle changes back to the serialized core.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::cert::PeerCertificate;
use crate::error::FederationError;
use crate::net::{CoreHandle, FederationMetrics};
use crate::session::SessionId;
use crate::transport::{Credentials, Socket};

/// Commands from the core to a connection driver.
pub(crate) enum SocketCmd {
    Write(Vec<u8>),
    SetSecure {
        credentials: Arc<Credentials>,
        is_server: bool,
        servername: Option<String>,
    },
    Close,
}

/// State the driver publishes for the synchronous `Socket` accessors.
pub(crate) struct SocketShared {
    secure: AtomicBool,
    authorized: AtomicBool,
    servername: Mutex<Option<String>>,
    authorization_error: Mutex<Option<String>>,
}

impl SocketShared {
    fn new() -> Self {
        Self {
            secure: AtomicBool::new(false),
            authorized: AtomicBool::new(false),
            servername: Mutex::new(None),
            authorization_error: Mutex::new(None),
        }
    }
}

/// `Socket` handle over a tokio connection driver.
pub struct TokioSocket {
    cmd: mpsc::UnboundedSender<SocketCmd>,
    shared: Arc<SocketShared>,
}

impl TokioSocket {
    /// Create a socket handle plus the driver-side channel and state.
    pub(crate) fn pair() -> (
        TokioSocket,
        mpsc::UnboundedReceiver<SocketCmd>,
        Arc<SocketShared>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SocketShared::new());
        (
            TokioSocket {
                cmd: cmd_tx,
                shared: Arc::clone(&shared),
            },
            cmd_rx,
            shared,
        )
    }
}

impl Socket for TokioSocket {
    fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), FederationError> {
        self.cmd
            .send(SocketCmd::Write(bytes.to_vec()))
            .map_err(|_| FederationError::NotConnected)
    }

    fn close(&mut self) {
        let _ = self.cmd.send(SocketCmd::Close);
    }

    fn set_secure(
        &mut self,
        credentials: &Arc<Credentials>,
        is_server: bool,
        servername: Option<&str>,
    ) -> Result<(), FederationError> {
        self.cmd
            .send(SocketCmd::SetSecure {
                credentials: Arc::clone(credentials),
                is_server,
                servername: servername.map(str::to_string),
            })
            .map_err(|_| FederationError::NotConnected)
    }

    fn renegotiate(&mut self, _request_cert: bool) -> Result<(), FederationError> {
        // rustls has no renegotiation; peer certificates are requested at
        // handshake time instead, so a missing one stays missing.
        Err(FederationError::tls(
            "TLS renegotiation is not supported by this transport",
        ))
    }

    fn is_secure(&self) -> bool {
        self.shared.secure.load(Ordering::Acquire)
    }

    fn authorized(&self) -> bool {
        self.shared.authorized.load(Ordering::Acquire)
    }

    fn authorization_error(&self) -> Option<String> {
        self.shared.authorization_error.lock().unwrap().clone()
    }

    fn servername(&self) -> Option<String> {
        self.shared.servername.lock().unwrap().clone()
    }

    fn peer_certificate(&self) -> Option<PeerCertificate> {
        // Identity extraction from raw DER is not wired up; EXTERNAL is
        // exercised through transports that can supply it, and real links
        // authenticate via dialback.
        None
    }
}

/// The connection's byte stream across its TLS lifecycle.
#[derive(Default)]
enum IoStream {
    #[default]
    Gone,
    Plain(TcpStream),
    Client(Box<tokio_rustls::client::TlsStream<TcpStream>>),
    Server(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Gone => Poll::Ready(Ok(())),
            IoStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            IoStream::Client(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            IoStream::Server(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            IoStream::Gone => Poll::Ready(Err(std::io::ErrorKind::NotConnected.into())),
            IoStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            IoStream::Client(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            IoStream::Server(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Gone => Poll::Ready(Ok(())),
            IoStream::Plain(s) => Pin::new(s).poll_flush(cx),
            IoStream::Client(s) => Pin::new(s.as_mut()).poll_flush(cx),
            IoStream::Server(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Gone => Poll::Ready(Ok(())),
            IoStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            IoStream::Client(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            IoStream::Server(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Drive one connection: pump inbound bytes into the core, apply core
/// commands, and report the close. Runs until either side gives up.
pub(crate) async fn drive(
    stream: TcpStream,
    mut cmd_rx: mpsc::UnboundedReceiver<SocketCmd>,
    shared: Arc<SocketShared>,
    core: CoreHandle,
    sid: SessionId,
    metrics: Arc<FederationMetrics>,
) {
    let mut io = IoStream::Plain(stream);
    let mut buf = [0u8; 8192];

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(SocketCmd::Close) => break,
                Some(SocketCmd::Write(bytes)) => {
                    if io.write_all(&bytes).await.is_err() || io.flush().await.is_err() {
                        break;
                    }
                }
                Some(SocketCmd::SetSecure { credentials, is_server, servername }) => {
                    match upgrade(&mut io, &credentials, is_server, servername.as_deref()).await {
                        Ok(()) => {
                            shared.secure.store(true, Ordering::Release);
                            record_handshake(&shared, &io, servername);
                            metrics.record_tls_established();
                            core.tls_established(sid);
                        }
                        Err(e) => {
                            warn!(session = %sid, error = %e, "TLS upgrade failed");
                            break;
                        }
                    }
                }
            },
            read = io.read(&mut buf) => match read {
                Ok(0) => {
                    debug!(session = %sid, "connection closed by peer");
                    break;
                }
                Ok(n) => core.feed(sid, buf[..n].to_vec()),
                Err(e) => {
                    debug!(session = %sid, error = %e, "read error");
                    break;
                }
            },
        }
    }

    let _ = io.shutdown().await;
    core.closed(sid);
}

/// Upgrade a plain stream to TLS and record the handshake outcome.
async fn upgrade(
    io: &mut IoStream,
    credentials: &Arc<Credentials>,
    is_server: bool,
    servername: Option<&str>,
) -> Result<(), FederationError> {
    let plain = match std::mem::take(io) {
        IoStream::Plain(s) => s,
        other => {
            *io = other;
            return Err(FederationError::tls("already using TLS"));
        }
    };

    if is_server {
        let acceptor = TlsAcceptor::from(credentials.server_config()?);
        let tls = acceptor
            .accept(plain)
            .await
            .map_err(|e| FederationError::tls(format!("accept: {}", e)))?;
        *io = IoStream::Server(Box::new(tls));
        Ok(())
    } else {
        let name = servername.ok_or_else(|| FederationError::tls("missing server name"))?;
        let connector = TlsConnector::from(credentials.client_config()?);
        let server_name = ServerName::try_from(name.to_string())
            .map_err(|e| FederationError::tls(format!("bad server name '{}': {}", name, e)))?;
        let tls = connector
            .connect(server_name, plain)
            .await
            .map_err(|e| FederationError::tls(format!("connect: {}", e)))?;
        *io = IoStream::Client(Box::new(tls));
        Ok(())
    }
}

/// Publish post-handshake facts for the synchronous accessors.
fn record_handshake(shared: &SocketShared, io: &IoStream, servername: Option<String>) {
    match io {
        IoStream::Server(tls) => {
            let (_, conn) = tls.get_ref();
            let presented = conn.peer_certificates().is_some();
            shared.authorized.store(presented, Ordering::Release);
            if !presented {
                *shared.authorization_error.lock().unwrap() =
                    Some("peer presented no certificate".to_string());
            }
            *shared.servername.lock().unwrap() = conn.server_name().map(str::to_string);
        }
        IoStream::Client(_) => {
            // webpki already validated the chain or the handshake failed.
            shared.authorized.store(true, Ordering::Release);
            *shared.servername.lock().unwrap() = servername;
        }
        _ => {}
    }
}
