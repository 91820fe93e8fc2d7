//! Production transport adapter: tokio TCP, tokio-rustls STARTTLS, and
//! hickory DNS SRV discovery.
//!
//! The core state machines are synchronous and single-owner; this module
//! supplies the serial queue they assume. A [`CoreHandle`] owns the
//! [`Router`] inside one task and drains typed calls, so every session
//! transition, map mutation, and queue operation runs on that task. Socket
//! I/O runs in per-connection driver tasks that only ever talk to the core
//! through the handle.

pub mod dns;
mod listener;
mod socket;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use dns::{DnsError, SrvResolver, SrvTarget, DEFAULT_S2S_PORT};
pub use listener::{FederationListener, FederationListenerConfig};
pub use socket::TokioSocket;

use crate::error::FederationError;
use crate::router::Router;
use crate::session::SessionId;
use crate::stanza::Stanza;
use crate::transport::{Connector, Socket};

/// Default timeout for one outbound connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Calls posted onto the core task.
enum CoreCall {
    Accept {
        socket: Box<dyn Socket>,
        reply: oneshot::Sender<SessionId>,
    },
    Feed {
        sid: SessionId,
        bytes: Vec<u8>,
    },
    Connected {
        sid: SessionId,
    },
    TlsEstablished {
        sid: SessionId,
    },
    Closed {
        sid: SessionId,
    },
    Send {
        stanza: Stanza,
    },
    End,
}

/// Handle onto the serialized core task.
///
/// Cloneable and cheap; every transport task and the embedding host go
/// through one of these.
#[derive(Clone)]
pub struct CoreHandle {
    tx: mpsc::UnboundedSender<CoreCall>,
}

impl CoreHandle {
    /// Spawn the core task around a router.
    pub fn spawn(mut router: Router) -> (CoreHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Some(call) = rx.recv().await {
                match call {
                    CoreCall::Accept { socket, reply } => {
                        let sid = router.accept(socket);
                        let _ = reply.send(sid);
                    }
                    CoreCall::Feed { sid, bytes } => router.feed(sid, &bytes),
                    CoreCall::Connected { sid } => router.connected(sid),
                    CoreCall::TlsEstablished { sid } => router.tls_established(sid),
                    CoreCall::Closed { sid } => router.closed(sid),
                    CoreCall::Send { stanza } => {
                        if let Err(e) = router.send(stanza) {
                            warn!(error = %e, "outbound stanza not routable");
                        }
                    }
                    CoreCall::End => {
                        router.end();
                        break;
                    }
                }
            }
            debug!("core task stopped");
        });

        (CoreHandle { tx }, task)
    }

    /// Register an accepted inbound transport; returns its session ID, or
    /// `None` when the core has shut down.
    pub async fn accept(&self, socket: Box<dyn Socket>) -> Option<SessionId> {
        let (reply, answer) = oneshot::channel();
        self.tx.send(CoreCall::Accept { socket, reply }).ok()?;
        answer.await.ok()
    }

    /// Post inbound bytes.
    pub fn feed(&self, sid: SessionId, bytes: Vec<u8>) {
        let _ = self.tx.send(CoreCall::Feed { sid, bytes });
    }

    /// Post an outbound-connection-established notification.
    pub fn connected(&self, sid: SessionId) {
        let _ = self.tx.send(CoreCall::Connected { sid });
    }

    /// Post a TLS-handshake-complete notification.
    pub fn tls_established(&self, sid: SessionId) {
        let _ = self.tx.send(CoreCall::TlsEstablished { sid });
    }

    /// Post a connection-closed notification.
    pub fn closed(&self, sid: SessionId) {
        let _ = self.tx.send(CoreCall::Closed { sid });
    }

    /// Submit an outbound stanza from the host application.
    pub fn send(&self, stanza: Stanza) {
        let _ = self.tx.send(CoreCall::Send { stanza });
    }

    /// Shut the core down, terminating every session.
    pub fn end(&self) {
        let _ = self.tx.send(CoreCall::End);
    }
}

/// Counters for federation connections.
#[derive(Debug, Default)]
pub struct FederationMetrics {
    connection_attempts: AtomicI64,
    active_connections: AtomicI64,
    tls_established: AtomicI64,
}

impl FederationMetrics {
    /// Create a zeroed metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an inbound or outbound connection attempt.
    pub fn record_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection entering service.
    pub fn record_connection_open(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection leaving service.
    pub fn record_connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a completed TLS handshake.
    pub fn record_tls_established(&self) {
        self.tls_established.fetch_add(1, Ordering::Relaxed);
    }

    /// Current active connections.
    pub fn active_connections(&self) -> i64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Total connection attempts.
    pub fn total_connection_attempts(&self) -> i64 {
        self.connection_attempts.load(Ordering::Relaxed)
    }

    /// Total completed TLS handshakes.
    pub fn total_tls_established(&self) -> i64 {
        self.tls_established.load(Ordering::Relaxed)
    }
}

/// [`Connector`] producing tokio-backed sockets.
///
/// `connect` returns immediately with a connecting socket; a spawned task
/// resolves SRV targets, dials them in order, and reports establishment or
/// failure through the core handle.
pub struct TokioConnector {
    core: CoreHandle,
    resolver: SrvResolver,
    runtime: tokio::runtime::Handle,
    connect_timeout: Duration,
    metrics: Arc<FederationMetrics>,
}

impl TokioConnector {
    /// Create a connector bound to the given core.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(core: CoreHandle, metrics: Arc<FederationMetrics>) -> Self {
        Self {
            core,
            resolver: SrvResolver::new(),
            runtime: tokio::runtime::Handle::current(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            metrics,
        }
    }

    /// Override the per-target connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Use a custom SRV resolver.
    pub fn with_resolver(mut self, resolver: SrvResolver) -> Self {
        self.resolver = resolver;
        self
    }
}

impl Connector for TokioConnector {
    fn connect(
        &mut self,
        domain: &str,
        session: SessionId,
    ) -> Result<Box<dyn Socket>, FederationError> {
        let (handle, cmd_rx, shared) = TokioSocket::pair();

        let core = self.core.clone();
        let resolver = self.resolver.clone();
        let domain = domain.to_string();
        let timeout = self.connect_timeout;
        let metrics = Arc::clone(&self.metrics);

        self.runtime.spawn(async move {
            metrics.record_connection_attempt();
            match establish(&resolver, &domain, timeout).await {
                Ok(stream) => {
                    info!(domain = %domain, session = %session, "outbound connection established");
                    metrics.record_connection_open();
                    core.connected(session);
                    socket::drive(stream, cmd_rx, shared, core, session, Arc::clone(&metrics))
                        .await;
                    metrics.record_connection_closed();
                }
                Err(e) => {
                    warn!(domain = %domain, session = %session, error = %e, "outbound connection failed");
                    core.closed(session);
                }
            }
        });

        Ok(Box::new(handle))
    }
}

/// Resolve and dial a federation domain, first target that answers wins.
async fn establish(
    resolver: &SrvResolver,
    domain: &str,
    timeout: Duration,
) -> Result<TcpStream, FederationError> {
    let targets = resolver.resolve(domain).await?;

    let mut last_error: Option<FederationError> = None;
    for target in targets {
        debug!(
            domain = %domain,
            host = %target.host,
            port = target.port,
            priority = target.priority,
            "dialing federation target"
        );

        let addrs = match resolver.host_addrs(&target.host, target.port).await {
            Ok(addrs) => addrs,
            Err(e) => {
                last_error = Some(e.into());
                continue;
            }
        };

        for addr in addrs {
            match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    debug!(addr = %addr, error = %e, "connect attempt failed");
                    last_error = Some(e.into());
                }
                Err(_) => {
                    debug!(addr = %addr, "connect attempt timed out");
                    last_error = Some(FederationError::stream(format!(
                        "connection to {} timed out",
                        addr
                    )));
                }
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| FederationError::stream(format!("no targets for {}", domain))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_counters() {
        let metrics = FederationMetrics::new();
        assert_eq!(metrics.active_connections(), 0);

        metrics.record_connection_attempt();
        metrics.record_connection_open();
        assert_eq!(metrics.total_connection_attempts(), 1);
        assert_eq!(metrics.active_connections(), 1);

        metrics.record_tls_established();
        assert_eq!(metrics.total_tls_established(), 1);

        metrics.record_connection_closed();
        assert_eq!(metrics.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_core_handle_shutdown() {
        let router = Router::new();
        let (core, task) = CoreHandle::spawn(router);
        core.end();
        task.await.unwrap();
    }
}
