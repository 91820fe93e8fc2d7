//! TCP listener for inbound federation connections.
//!
//! Accepts on port 5269, registers each connection with the core, and
//! spawns a driver task pumping bytes between the socket and the
//! serialized router.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::error::FederationError;
use crate::net::socket::TokioSocket;
use crate::net::{socket, CoreHandle, FederationMetrics};

/// Listener configuration.
#[derive(Debug, Clone)]
pub struct FederationListenerConfig {
    /// Address to bind for inbound S2S connections.
    pub addr: SocketAddr,
}

impl Default for FederationListenerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:5269".parse().expect("static bind address"),
        }
    }
}

/// Accept loop for inbound federation connections.
pub struct FederationListener {
    config: FederationListenerConfig,
    core: CoreHandle,
    metrics: Arc<FederationMetrics>,
}

impl FederationListener {
    /// Create a listener feeding the given core.
    pub fn new(
        config: FederationListenerConfig,
        core: CoreHandle,
        metrics: Arc<FederationMetrics>,
    ) -> Self {
        Self {
            config,
            core,
            metrics,
        }
    }

    /// The listener's metrics.
    pub fn metrics(&self) -> &Arc<FederationMetrics> {
        &self.metrics
    }

    /// Bind and accept until the task is aborted.
    pub async fn run(self) -> Result<(), FederationError> {
        let listener = TcpListener::bind(&self.config.addr).await?;
        info!(addr = %self.config.addr, "federation listener started");

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    self.metrics.record_connection_attempt();
                    let core = self.core.clone();
                    let metrics = Arc::clone(&self.metrics);

                    tokio::spawn(async move {
                        let (handle, cmd_rx, shared) = TokioSocket::pair();
                        let Some(sid) = core.accept(Box::new(handle)).await else {
                            return;
                        };

                        info!(peer = %peer_addr, session = %sid, "inbound federation connection");
                        metrics.record_connection_open();
                        socket::drive(stream, cmd_rx, shared, core, sid, Arc::clone(&metrics))
                            .await;
                        metrics.record_connection_closed();
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept federation connection");
                }
            }
        }
    }
}
