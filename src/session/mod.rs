//! Federation session state machines.
//!
//! A session covers one direction of an S2S link. The two machines share a
//! lifecycle ([`SessionState`]) and a closed set of events ([`SessionEvent`])
//! consumed by the owning [`crate::context::DomainContext`]; there is no
//! open-ended listener registration.

pub mod incoming;
pub mod outgoing;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use incoming::IncomingSession;
pub use outgoing::OutgoingSession;

use crate::error::FederationError;
use crate::stanza::Stanza;

/// Opaque identifier for one session within a router.
///
/// Sessions refer to each other and to transport callbacks through IDs
/// rather than references; the owning context holds the only reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s2s-{}", self.0)
    }
}

/// Shared session ID allocator.
///
/// A router hands one allocator to every context it hosts so IDs stay
/// unique across contexts and transport callbacks can be dispatched without
/// knowing which context owns the session.
#[derive(Clone)]
pub struct SessionIds(Arc<AtomicU64>);

impl SessionIds {
    /// Create a fresh allocator.
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }

    /// Allocate the next ID.
    pub fn next(&self) -> SessionId {
        SessionId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SessionIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Lifecycle of a session.
///
/// `Authed` implies the stream handshake completed; the transition into it
/// is monotonic — a failed session closes instead of reverting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport opening, no stream handshake yet
    Connecting,
    /// Stream headers exchanged
    Connected,
    /// Peer domain verified; normal stanzas flow
    Authed,
    /// Session terminated
    Closed,
}

impl SessionState {
    /// Whether the opening stream handshake has completed.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Authed)
    }

    /// Whether the peer's claimed domain is verified.
    pub fn is_authed(&self) -> bool {
        matches!(self, Self::Authed)
    }
}

/// How a session authenticated (or proposes to authenticate).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Inbound SASL EXTERNAL via certificate identity
    Sasl,
    /// Outbound SASL EXTERNAL
    External,
    /// Server Dialback (XEP-0220)
    Dialback,
}

impl AuthMethod {
    /// Short name for logging.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sasl => "SASL",
            Self::External => "external",
            Self::Dialback => "dialback",
        }
    }
}

/// Events a session surfaces to its owning context.
///
/// Each variant has exactly one consumer; the context reacts and, where
/// needed, calls back into the session to emit the next frames.
#[derive(Debug)]
pub enum SessionEvent {
    /// A stream header was received (initial or after a restart)
    StreamStart,
    /// An authorized stanza arrived and awaits filtering
    Stanza(Stanza),
    /// The session proposes (outgoing) or completed (incoming)
    /// authentication with the given method
    Auth(AuthMethod),
    /// The session became fully authenticated; its queue has drained
    Online,
    /// The inbound peer asked to be verified via dialback
    DialbackRequest {
        /// Claimed originating domain
        from: String,
        /// Receiving domain (should be ours)
        to: String,
        /// The key to verify
        key: String,
    },
    /// The inbound peer asked us, as the authoritative server, to confirm
    /// a key we may have minted
    DialbackVerifyRequest {
        /// The domain asking
        from: String,
        /// The domain asked (should be ours)
        to: String,
        /// The stream ID the key was minted for
        id: String,
        /// The key under examination
        key: String,
    },
    /// The authoritative server answered one of our `db:verify` requests
    DialbackVerified {
        /// The authoritative domain
        from: String,
        /// Our domain
        to: String,
        /// The inbound stream ID the answer is about
        id: String,
        /// Whether the key checked out
        valid: bool,
    },
    /// The session terminated
    Closed,
    /// The session hit a protocol or transport error
    Error(FederationError),
}
