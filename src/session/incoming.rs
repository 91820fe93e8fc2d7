//! Peer-initiated S2S session state machine.
//!
//! Negotiation path: stream header exchange, feature advertisement,
//! STARTTLS upgrade, then either SASL EXTERNAL (certificate identity) or
//! Server Dialback. The session only parses and emits frames; verification
//! decisions and map admission belong to the owning `DomainContext`.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::cert;
use crate::error::{FederationError, StreamErrorCondition};
use crate::frame::{self, Frame, FrameReader, StreamHeader, STREAM_CLOSE};
use crate::session::{AuthMethod, SessionEvent, SessionId, SessionState};
use crate::stanza::Stanza;
use crate::transport::{Credentials, Socket};

/// State machine for a stream opened by a remote server towards us.
pub struct IncomingSession {
    id: SessionId,
    local_domain: String,
    socket: Box<dyn Socket>,
    reader: FrameReader,
    state: SessionState,
    stream_id: String,
    stream_attrs: StreamHeader,
    /// Headers seen so far; restarts (post-TLS, post-SASL) resend features.
    headers_seen: u32,
    secure_domain: bool,
    credentials: Option<Arc<Credentials>>,
    /// Verified peer domain once authenticated.
    peer_domain: Option<String>,
    /// A renegotiation is in flight for an EXTERNAL attempt.
    awaiting_renegotiation: bool,
    stream_closed_sent: bool,
}

impl IncomingSession {
    /// Create a session for a freshly accepted transport.
    ///
    /// No bytes are written here; the peer speaks first, and features are
    /// only sent on an explicit [`IncomingSession::send_features`] call.
    pub fn new(
        id: SessionId,
        local_domain: String,
        socket: Box<dyn Socket>,
        credentials: Option<Arc<Credentials>>,
        secure_domain: bool,
    ) -> Self {
        Self {
            id,
            local_domain,
            socket,
            reader: FrameReader::new(),
            state: SessionState::Connecting,
            stream_id: Uuid::new_v4().to_string(),
            stream_attrs: StreamHeader::default(),
            headers_seen: 0,
            secure_domain,
            credentials,
            peer_domain: None,
            awaiting_renegotiation: false,
            stream_closed_sent: false,
        }
    }

    /// This session's ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The server-chosen stream ID for the current stream.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Attributes of the peer's most recent stream header.
    pub fn stream_attrs(&self) -> &StreamHeader {
        &self.stream_attrs
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Verified peer domain, once authenticated.
    pub fn peer_domain(&self) -> Option<&str> {
        self.peer_domain.as_deref()
    }

    /// Feed transport bytes; returns the events they caused.
    pub fn feed_bytes(&mut self, data: &[u8]) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.state == SessionState::Closed {
            return events;
        }

        self.reader.feed(data);
        loop {
            match self.reader.next_frame() {
                Ok(Some(frame)) => self.handle_frame(frame, &mut events),
                Ok(None) => break,
                Err(e) => {
                    warn!(session = %self.id, error = %e, "inbound stream not well-formed");
                    self.stream_error_and_close(StreamErrorCondition::NotWellFormed);
                    events.push(SessionEvent::Error(e));
                    events.push(SessionEvent::Closed);
                    break;
                }
            }
            if self.state == SessionState::Closed {
                break;
            }
        }
        events
    }

    fn handle_frame(&mut self, frame: Frame, events: &mut Vec<SessionEvent>) {
        match frame {
            Frame::StreamStart(header) => self.handle_stream_start(header, events),
            Frame::StartTls => {
                self.handle_tls_negotiation();
            }
            Frame::SaslAuth { mechanism, .. } => self.handle_sasl_auth(mechanism, events),
            Frame::DialbackResult {
                from,
                to,
                result_type,
                key,
            } => {
                if result_type.is_some() {
                    warn!(session = %self.id, "dialback answer on an inbound stream");
                    return;
                }
                match key {
                    Some(key) => events.push(SessionEvent::DialbackRequest { from, to, key }),
                    None => {
                        self.stream_error_and_close(StreamErrorCondition::NotWellFormed);
                        events.push(SessionEvent::Closed);
                    }
                }
            }
            Frame::DialbackVerify {
                from,
                to,
                id,
                verify_type,
                key,
            } => {
                if verify_type.is_some() {
                    warn!(session = %self.id, "verify answer on an inbound stream");
                    return;
                }
                match key {
                    Some(key) => {
                        events.push(SessionEvent::DialbackVerifyRequest { from, to, id, key })
                    }
                    None => {
                        self.stream_error_and_close(StreamErrorCondition::NotWellFormed);
                        events.push(SessionEvent::Closed);
                    }
                }
            }
            Frame::Stanza(stanza) => {
                if self.state.is_authed() {
                    events.push(SessionEvent::Stanza(stanza));
                } else {
                    debug!(session = %self.id, name = %stanza.name(), "stanza before authentication");
                    self.stream_error_and_close(StreamErrorCondition::NotAuthorized);
                    events.push(SessionEvent::Closed);
                }
            }
            Frame::StreamEnd => {
                debug!(session = %self.id, "peer closed the stream");
                self.close_stream();
                self.end();
                events.push(SessionEvent::Closed);
            }
            Frame::StreamError { condition } => {
                warn!(session = %self.id, condition = %condition, "peer reported stream error");
                self.end();
                events.push(SessionEvent::Error(FederationError::stream(condition)));
                events.push(SessionEvent::Closed);
            }
            Frame::Features(_)
            | Frame::TlsProceed
            | Frame::TlsFailure
            | Frame::SaslSuccess
            | Frame::SaslFailure { .. } => {
                warn!(session = %self.id, "initiator-only frame on an inbound stream");
            }
        }
    }

    fn handle_stream_start(&mut self, header: StreamHeader, events: &mut Vec<SessionEvent>) {
        self.stream_attrs = header;
        self.stream_id = Uuid::new_v4().to_string();

        let response = frame::stream_header(
            &self.local_domain,
            self.stream_attrs.from.as_deref(),
            Some(&self.stream_id),
        );
        if self.send_raw(response.as_bytes()).is_err() {
            self.end();
            events.push(SessionEvent::Closed);
            return;
        }

        if self.state == SessionState::Connecting {
            self.state = SessionState::Connected;
        }

        debug!(
            session = %self.id,
            from = ?self.stream_attrs.from,
            stream_id = %self.stream_id,
            restart = self.headers_seen > 0,
            "inbound stream opened"
        );

        events.push(SessionEvent::StreamStart);

        // Restarted streams (post-TLS, post-SASL) get features right away;
        // the very first stream waits for an explicit request.
        if self.headers_seen > 0 {
            if let Err(e) = self.send_features() {
                warn!(session = %self.id, error = %e, "failed to resend features");
            }
        }
        self.headers_seen += 1;
    }

    /// Advertise stream features.
    ///
    /// `EXTERNAL` is offered only when the operator marked the domain
    /// secure, TLS is up, and the peer has not authenticated yet. The empty
    /// element is still sent — it tells the peer to proceed with dialback.
    pub fn send_features(&mut self) -> Result<(), FederationError> {
        let offer_external =
            self.secure_domain && self.socket.is_secure() && !self.state.is_authed();
        let features = if offer_external {
            frame::stream_features(&["EXTERNAL"])
        } else {
            frame::stream_features(&[])
        };
        self.send_raw(features.as_bytes())
    }

    /// Handle a `<starttls/>` request: reply `<proceed/>` and hand the
    /// socket to the TLS layer. Returns whether the upgrade was accepted.
    pub fn handle_tls_negotiation(&mut self) -> bool {
        let Some(credentials) = self.credentials.clone() else {
            warn!(session = %self.id, "STARTTLS without credentials");
            let _ = self.send_raw(frame::tls_failure().as_bytes());
            self.close_stream();
            self.end();
            return false;
        };

        if self.send_raw(frame::proceed().as_bytes()).is_err() {
            self.end();
            return false;
        }

        if let Err(e) = self.socket.set_secure(&credentials, true, None) {
            warn!(session = %self.id, error = %e, "TLS upgrade failed to start");
            self.end();
            return false;
        }
        true
    }

    /// Transport callback: the TLS handshake completed.
    ///
    /// The stream restarts — parser reset, new header expected; features
    /// are resent when it arrives.
    pub fn tls_established(&mut self) {
        debug!(session = %self.id, "inbound TLS established");
        self.reader.reset();
    }

    fn handle_sasl_auth(&mut self, mechanism: Option<String>, events: &mut Vec<SessionEvent>) {
        let acceptable =
            self.socket.is_secure() && matches!(mechanism.as_deref(), Some("EXTERNAL"));
        if !acceptable {
            debug!(session = %self.id, ?mechanism, "rejecting SASL auth");
            self.send_not_authorized_and_close();
            events.push(SessionEvent::Closed);
            return;
        }

        // No certificate yet means the peer connected without one; ask for
        // it through a renegotiation and resume when the transport reports
        // completion.
        let cert_missing = self
            .socket
            .peer_certificate()
            .map_or(true, |c| c.is_empty());
        if cert_missing {
            self.awaiting_renegotiation = true;
            if let Err(e) = self.socket.renegotiate(true) {
                warn!(session = %self.id, error = %e, "renegotiation unavailable");
                self.awaiting_renegotiation = false;
                self.send_not_authorized_and_close();
                events.push(SessionEvent::Closed);
            }
            return;
        }

        self.verify_certificate(events);
    }

    /// Transport callback: a renegotiation completed.
    pub fn renegotiated(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        if self.awaiting_renegotiation {
            self.awaiting_renegotiation = false;
            self.verify_certificate(&mut events);
        }
        events
    }

    /// Check the peer certificate against the TLS-layer verdict and the
    /// RFC 6125 identity rules, then hand the outcome to the context.
    pub fn verify_certificate(&mut self, events: &mut Vec<SessionEvent>) {
        if !self.socket.authorized() {
            debug!(
                session = %self.id,
                reason = ?self.socket.authorization_error(),
                "peer certificate not authorized"
            );
            self.send_not_authorized_and_close();
            events.push(SessionEvent::Closed);
            return;
        }

        let matched = match (self.socket.peer_certificate(), self.socket.servername()) {
            (Some(cert), Some(name)) => cert::matches_identity(&cert, &name),
            _ => false,
        };
        if !matched {
            debug!(session = %self.id, "peer certificate identity mismatch");
            self.send_not_authorized_and_close();
            events.push(SessionEvent::Closed);
            return;
        }

        events.push(SessionEvent::Auth(AuthMethod::Sasl));
    }

    /// Accept the EXTERNAL authentication: `<success/>` first, then the
    /// stream restart. The order is part of the wire contract.
    pub fn on_sasl_success(&mut self) {
        let _ = self.send_raw(frame::sasl_success().as_bytes());
        self.stream_start();
    }

    /// Begin a fresh stream on the same transport.
    fn stream_start(&mut self) {
        self.reader.reset();
    }

    /// Mark the stream as verified for the given peer domain.
    pub fn mark_authenticated(&mut self, domain: &str) {
        if self.state == SessionState::Closed {
            return;
        }
        self.peer_domain = Some(domain.to_string());
        self.state = SessionState::Authed;
        debug!(session = %self.id, peer = %domain, "inbound stream authenticated");
    }

    /// Refuse authentication: SASL failure, stream close tag, transport
    /// close — strictly in that order.
    pub fn send_not_authorized_and_close(&mut self) {
        let _ = self.send_raw(frame::sasl_failure_not_authorized().as_bytes());
        self.close_stream();
        self.end();
    }

    /// Send a fatal stream error and close. Fire-and-forget.
    pub fn stream_error_and_close(&mut self, condition: StreamErrorCondition) {
        let _ = self.send_raw(frame::stream_error(condition).as_bytes());
        self.close_stream();
        self.end();
    }

    /// Answer a `<db:result>` request on this stream.
    pub fn send_result_response(&mut self, from: &str, to: &str, valid: bool) {
        let response =
            crate::dialback::build_result_response(from, to, crate::dialback::Verdict::from_bool(valid));
        let _ = self.send_raw(response.as_bytes());
    }

    /// Answer a `<db:verify>` request on this stream.
    pub fn send_verify_response(&mut self, from: &str, to: &str, id: &str, valid: bool) {
        let response = crate::dialback::build_verify_response(
            from,
            to,
            id,
            crate::dialback::Verdict::from_bool(valid),
        );
        let _ = self.send_raw(response.as_bytes());
    }

    /// Send a stanza to the peer. Only authenticated streams carry stanzas.
    pub fn send(&mut self, stanza: &Stanza) -> Result<(), FederationError> {
        if !self.state.is_authed() {
            return Err(FederationError::NotConnected);
        }
        self.send_raw(stanza.to_xml().as_bytes())
    }

    /// Send raw bytes to the peer.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<(), FederationError> {
        if self.state == SessionState::Closed {
            return Err(FederationError::NotConnected);
        }
        self.socket.send_bytes(bytes)
    }

    fn close_stream(&mut self) {
        if !self.stream_closed_sent && self.state != SessionState::Closed {
            self.stream_closed_sent = true;
            let _ = self.socket.send_bytes(STREAM_CLOSE.as_bytes());
        }
    }

    /// Close the transport. Idempotent.
    pub fn end(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Closed;
            self.socket.close();
        }
    }
}
