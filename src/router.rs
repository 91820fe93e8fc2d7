//! Hosted-domain multiplexer.
//!
//! A `Router` owns one [`DomainContext`] per hosted domain and fans
//! transport callbacks out to whichever context owns the session. Freshly
//! accepted inbound transports are held until their stream header arrives;
//! the header's `to` attribute picks the context (or earns the peer a
//! `host-unknown` stream error).

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::context::DomainContext;
use crate::error::{FederationError, StreamErrorCondition};
use crate::frame::{self, Frame, FrameReader, STREAM_CLOSE};
use crate::session::{SessionId, SessionIds};
use crate::stanza::{normalize_domain, Stanza};
use crate::transport::Socket;

/// An accepted transport whose stream header has not arrived yet.
struct PendingInbound {
    socket: Box<dyn Socket>,
    reader: FrameReader,
    /// Raw bytes seen so far, replayed into the adopting context.
    raw: Vec<u8>,
}

/// Maps hosted domains to their contexts and dispatches transport events.
pub struct Router {
    ids: SessionIds,
    contexts: HashMap<String, DomainContext>,
    pending: HashMap<SessionId, PendingInbound>,
}

impl Router {
    /// Create an empty router.
    pub fn new() -> Self {
        Self {
            ids: SessionIds::new(),
            contexts: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Host a domain. The context joins the router's session ID space.
    pub fn add_domain(&mut self, mut context: DomainContext) {
        context.set_ids(self.ids.clone());
        self.contexts.insert(context.domain().to_string(), context);
    }

    /// The context for a hosted domain.
    pub fn context(&self, domain: &str) -> Option<&DomainContext> {
        self.contexts.get(domain)
    }

    /// Mutable access to the context for a hosted domain.
    pub fn context_mut(&mut self, domain: &str) -> Option<&mut DomainContext> {
        self.contexts.get_mut(domain)
    }

    /// Hosted domains, in no particular order.
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.contexts.keys().map(String::as_str)
    }

    /// Admit an accepted inbound transport.
    ///
    /// The session stays unattached until its stream header names a hosted
    /// domain; nothing is written to the peer before then.
    pub fn accept(&mut self, socket: Box<dyn Socket>) -> SessionId {
        let sid = self.ids.next();
        self.pending.insert(
            sid,
            PendingInbound {
                socket,
                reader: FrameReader::new(),
                raw: Vec::new(),
            },
        );
        debug!(session = %sid, "inbound transport accepted");
        sid
    }

    /// Feed transport bytes to the session that owns them.
    pub fn feed(&mut self, sid: SessionId, bytes: &[u8]) {
        if self.pending.contains_key(&sid) {
            self.feed_pending(sid, bytes);
            return;
        }
        for context in self.contexts.values_mut() {
            if context.owns(sid) {
                context.feed(sid, bytes);
                return;
            }
        }
        debug!(session = %sid, "bytes for an unknown session");
    }

    fn feed_pending(&mut self, sid: SessionId, bytes: &[u8]) {
        let Some(pending) = self.pending.get_mut(&sid) else {
            return;
        };
        pending.raw.extend_from_slice(bytes);
        pending.reader.feed(bytes);

        match pending.reader.next_frame() {
            Ok(None) => {}
            Ok(Some(Frame::StreamStart(header))) => {
                let Some(mut pending) = self.pending.remove(&sid) else {
                    return;
                };

                let target = header
                    .to
                    .as_deref()
                    .and_then(|t| normalize_domain(t).ok());
                let Some(target) = target else {
                    warn!(session = %sid, "inbound stream without a usable 'to'");
                    refuse(
                        &mut pending.socket,
                        StreamErrorCondition::ImproperAddressing,
                    );
                    return;
                };

                match self.contexts.get_mut(&target) {
                    Some(context) => {
                        debug!(session = %sid, domain = %target, "inbound stream adopted");
                        context.accept_with_id(sid, pending.socket);
                        // Replay so the session sees the header itself,
                        // then advertise features.
                        context.feed(sid, &pending.raw);
                        context.request_features(sid);
                    }
                    None => {
                        warn!(session = %sid, domain = %target, "stream for an unhosted domain");
                        refuse(&mut pending.socket, StreamErrorCondition::HostUnknown);
                    }
                }
            }
            Ok(Some(_)) | Err(_) => {
                warn!(session = %sid, "garbage before stream header");
                if let Some(mut pending) = self.pending.remove(&sid) {
                    refuse(&mut pending.socket, StreamErrorCondition::NotWellFormed);
                }
            }
        }
    }

    /// Transport callback: an outgoing connection is established.
    pub fn connected(&mut self, sid: SessionId) {
        for context in self.contexts.values_mut() {
            if context.owns(sid) {
                context.session_connected(sid);
                return;
            }
        }
    }

    /// Transport callback: a TLS handshake completed.
    pub fn tls_established(&mut self, sid: SessionId) {
        for context in self.contexts.values_mut() {
            if context.owns(sid) {
                context.tls_established(sid);
                return;
            }
        }
    }

    /// Transport callback: a TLS renegotiation completed.
    pub fn renegotiated(&mut self, sid: SessionId) {
        for context in self.contexts.values_mut() {
            if context.owns(sid) {
                context.renegotiated(sid);
                return;
            }
        }
    }

    /// Transport callback: a connection closed.
    pub fn closed(&mut self, sid: SessionId) {
        if self.pending.remove(&sid).is_some() {
            return;
        }
        for context in self.contexts.values_mut() {
            if context.owns(sid) {
                context.session_closed(sid);
                return;
            }
        }
    }

    /// Route an outbound stanza through the context hosting its origin.
    pub fn send(&mut self, stanza: Stanza) -> Result<(), FederationError> {
        let origin = stanza
            .from_domain()
            .ok_or_else(|| FederationError::stream("outbound stanza has no origin domain"))?;

        match self.contexts.get_mut(&origin) {
            Some(context) => {
                context.send(stanza);
                Ok(())
            }
            None => Err(FederationError::stream(format!(
                "domain '{}' is not hosted here",
                origin
            ))),
        }
    }

    /// Terminate every context and pending transport.
    pub fn end(&mut self) {
        for (_, mut pending) in self.pending.drain() {
            pending.socket.close();
        }
        for context in self.contexts.values_mut() {
            context.end();
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Refuse a not-yet-adopted transport with a stream error.
fn refuse(socket: &mut Box<dyn Socket>, condition: StreamErrorCondition) {
    let _ = socket.send_bytes(frame::stream_error(condition).as_bytes());
    let _ = socket.send_bytes(STREAM_CLOSE.as_bytes());
    socket.close();
}
