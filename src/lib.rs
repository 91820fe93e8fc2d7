//! # plover-xmpp
//!
//! Server-to-server (S2S) federation core for the Plover XMPP server.
//!
//! This crate mediates XML-stanza exchange between locally hosted domains
//! and remote servers on the public federation, per RFC 6120 and XEP-0220:
//!
//! - incoming and outgoing S2S stream state machines (STARTTLS, SASL
//!   EXTERNAL via certificate identity, Server Dialback)
//! - a per-hosted-domain [`DomainContext`] that pools outgoing streams,
//!   demultiplexes inbound ones, queues stanzas during authentication, and
//!   filters verified traffic before handing it to the host
//! - the three-party dialback handshake, including the authoritative side
//! - a [`Router`] mapping hosted domains to their contexts
//!
//! The core is transport-agnostic: sessions drive a small
//! [`Socket`](transport::Socket) capability set and all I/O lives in the
//! [`net`] adapter (tokio + rustls + hickory DNS). Each context is
//! single-owner — the adapter serializes all callbacks for a router onto
//! one task, so the state machines need no internal locking.
//!
//! Stanza delivery to local users, C2S, and application-level routing
//! (MUC, pubsub, rosters) are the embedding server's concern; the host
//! installs a stanza listener per context and receives everything that
//! passes the inbound filter, including error bounces for undeliverable
//! outbound stanzas.

pub mod cert;
pub mod context;
pub mod dialback;
pub mod frame;
pub mod net;
pub mod router;
pub mod session;
pub mod stanza;
pub mod transport;

mod error;

pub use context::{ContextConfig, DomainContext, StanzaListener};
pub use error::{FederationError, StanzaErrorCondition, StreamErrorCondition};
pub use frame::{ns, Frame, FrameReader, StreamFeatures, StreamHeader};
pub use router::Router;
pub use session::{
    AuthMethod, IncomingSession, OutgoingSession, SessionEvent, SessionId, SessionState,
};
pub use stanza::{normalize_domain, Stanza};
pub use transport::{Connector, Credentials, Socket};
