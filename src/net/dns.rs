//! DNS SRV discovery for federation targets (RFC 6120 Section 3.2).
//!
//! Resolution queries `_xmpp-server._tcp.{domain}` SRV records, orders them
//! by priority (ascending) then weight (descending), and falls back to the
//! bare domain on port 5269 when no usable SRV records exist.

use std::net::SocketAddr;
use std::sync::Arc;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::ProtoErrorKind;
use hickory_resolver::{ResolveError, ResolveErrorKind, Resolver};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Default XMPP S2S port.
pub const DEFAULT_S2S_PORT: u16 = 5269;

/// DNS resolution errors.
#[derive(Debug, Error)]
pub enum DnsError {
    /// The resolver itself failed.
    #[error("DNS resolver failure: {0}")]
    Resolver(#[from] ResolveError),

    /// No usable records for the domain.
    #[error("no DNS records for {0}")]
    NoRecords(String),

    /// The lookup failed.
    #[error("DNS lookup failed for {domain}: {message}")]
    Lookup {
        /// Domain being looked up
        domain: String,
        /// Failure detail
        message: String,
    },
}

/// One resolved connection target, in SRV order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    /// Host name to connect to.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// SRV priority (lower wins).
    pub priority: u16,
    /// SRV weight (higher wins within one priority).
    pub weight: u16,
}

impl SrvTarget {
    /// Fallback target: the bare domain on the default port.
    pub fn fallback(host: String) -> Self {
        Self {
            host,
            port: DEFAULT_S2S_PORT,
            priority: 0,
            weight: 0,
        }
    }
}

type TokioResolver = Resolver<TokioConnectionProvider>;

/// SRV resolver for `_xmpp-server._tcp` discovery.
#[derive(Clone)]
pub struct SrvResolver {
    resolver: Arc<TokioResolver>,
}

impl SrvResolver {
    /// Create a resolver with default configuration.
    pub fn new() -> Self {
        let resolver = Resolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        )
        .build();
        Self {
            resolver: Arc::new(resolver),
        }
    }

    /// Create a resolver with custom configuration.
    pub fn with_config(config: ResolverConfig, opts: ResolverOpts) -> Self {
        let resolver = Resolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(opts)
            .build();
        Self {
            resolver: Arc::new(resolver),
        }
    }

    /// Resolve connection targets for a federation domain.
    #[instrument(skip(self), name = "s2s.dns.resolve")]
    pub async fn resolve(&self, domain: &str) -> Result<Vec<SrvTarget>, DnsError> {
        let srv_name = format!("_xmpp-server._tcp.{}", domain);

        let records = match self.resolver.srv_lookup(&srv_name).await {
            Ok(response) => {
                let mut targets: Vec<SrvTarget> = response
                    .iter()
                    .filter_map(|srv| {
                        let target = srv.target().to_utf8();
                        // A root target means "no service at this domain".
                        if target == "." || target.is_empty() {
                            return None;
                        }
                        Some(SrvTarget {
                            host: target.trim_end_matches('.').to_string(),
                            port: srv.port(),
                            priority: srv.priority(),
                            weight: srv.weight(),
                        })
                    })
                    .collect();
                sort_targets(&mut targets);
                targets
            }
            Err(e) if is_no_records(&e) => Vec::new(),
            Err(e) => {
                warn!(domain = %domain, error = %e, "SRV lookup failed, trying fallback");
                Vec::new()
            }
        };

        if !records.is_empty() {
            debug!(domain = %domain, count = records.len(), "resolved SRV targets");
            return Ok(records);
        }

        // No SRV service: the domain itself on 5269, if it resolves at all.
        match self.resolver.lookup_ip(domain).await {
            Ok(response) if response.iter().next().is_some() => {
                debug!(domain = %domain, "using A/AAAA fallback target");
                Ok(vec![SrvTarget::fallback(domain.to_string())])
            }
            Ok(_) => Err(DnsError::NoRecords(domain.to_string())),
            Err(e) => Err(DnsError::Lookup {
                domain: domain.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Resolve a target host to socket addresses for connect attempts.
    #[instrument(skip(self), name = "s2s.dns.addrs")]
    pub async fn host_addrs(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, DnsError> {
        let response = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| DnsError::Lookup {
                domain: host.to_string(),
                message: e.to_string(),
            })?;

        let addrs: Vec<SocketAddr> = response.iter().map(|ip| SocketAddr::new(ip, port)).collect();
        if addrs.is_empty() {
            return Err(DnsError::NoRecords(host.to_string()));
        }
        Ok(addrs)
    }
}

impl Default for SrvResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// Priority ascending, weight descending within one priority.
fn sort_targets(targets: &mut [SrvTarget]) {
    targets.sort_by(|a, b| match a.priority.cmp(&b.priority) {
        std::cmp::Ordering::Equal => b.weight.cmp(&a.weight),
        other => other,
    });
}

/// NoRecordsFound hides inside the proto error in hickory 0.25.
fn is_no_records(error: &ResolveError) -> bool {
    if let ResolveErrorKind::Proto(proto) = error.kind() {
        matches!(proto.kind(), ProtoErrorKind::NoRecordsFound { .. })
    } else {
        false
    }
}
