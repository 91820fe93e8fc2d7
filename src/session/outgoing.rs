//! Locally-initiated S2S session state machine.
//!
//! Connection flow: transport connect, stream header exchange, feature
//! selection (STARTTLS first, then SASL EXTERNAL, then dialback), then
//! stanza traffic. Stanzas submitted before authentication queue in FIFO
//! order and drain to the wire the moment the session goes online; a close
//! before that hands the queue back to the context for error bounces.

use std::collections::VecDeque;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, info, warn};

use crate::error::{FederationError, StreamErrorCondition};
use crate::frame::{self, Frame, FrameReader, StreamHeader, STREAM_CLOSE};
use crate::session::{AuthMethod, SessionEvent, SessionId, SessionState};
use crate::stanza::Stanza;
use crate::transport::{Credentials, Socket};

/// State machine for a stream we opened towards a remote server.
pub struct OutgoingSession {
    id: SessionId,
    local_domain: String,
    remote_domain: String,
    socket: Box<dyn Socket>,
    reader: FrameReader,
    state: SessionState,
    stream_attrs: StreamHeader,
    /// Key sent in our `db:result`, kept for authoritative verification.
    db_key: Option<String>,
    /// Stanzas awaiting authentication, drained FIFO on online.
    queue: VecDeque<Stanza>,
    /// Raw frames awaiting the stream handshake, drained on connect.
    pending_raw: Vec<Vec<u8>>,
    credentials: Option<Arc<Credentials>>,
    /// The next stream header completes a post-SASL restart.
    online_on_next_header: bool,
    stream_closed_sent: bool,
}

impl OutgoingSession {
    /// Create a session over a connecting transport.
    ///
    /// Nothing is written until the transport reports establishment via
    /// [`OutgoingSession::transport_connected`].
    pub fn new(
        id: SessionId,
        local_domain: String,
        remote_domain: String,
        socket: Box<dyn Socket>,
        credentials: Option<Arc<Credentials>>,
    ) -> Self {
        Self {
            id,
            local_domain,
            remote_domain,
            socket,
            reader: FrameReader::new(),
            state: SessionState::Connecting,
            stream_attrs: StreamHeader::default(),
            db_key: None,
            queue: VecDeque::new(),
            pending_raw: Vec::new(),
            credentials,
            online_on_next_header: false,
            stream_closed_sent: false,
        }
    }

    /// This session's ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The remote domain this session serves.
    pub fn remote_domain(&self) -> &str {
        &self.remote_domain
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The stream ID assigned by the remote (receiving) server.
    pub fn stream_id(&self) -> Option<&str> {
        self.stream_attrs.id.as_deref()
    }

    /// The dialback key this session sent, if dialback was initiated.
    pub fn db_key(&self) -> Option<&str> {
        self.db_key.as_deref()
    }

    /// Number of stanzas waiting for authentication.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Transport callback: the TCP connection is up; open the stream.
    pub fn transport_connected(&mut self) {
        debug!(session = %self.id, remote = %self.remote_domain, "outgoing transport connected");
        let header = frame::stream_header(&self.local_domain, Some(&self.remote_domain), None);
        if self.socket.send_bytes(header.as_bytes()).is_err() {
            self.end();
        }
    }

    /// Transport callback: STARTTLS handshake completed; restart the stream.
    pub fn tls_established(&mut self) {
        debug!(session = %self.id, remote = %self.remote_domain, "outgoing TLS established");
        self.reader.reset();
        let header = frame::stream_header(&self.local_domain, Some(&self.remote_domain), None);
        if self.socket.send_bytes(header.as_bytes()).is_err() {
            self.end();
        }
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
                    warn!(session = %self.id, error = %e, "outgoing stream not well-formed");
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
            Frame::StreamStart(header) => {
                self.stream_attrs = header;
                if self.state == SessionState::Connecting {
                    self.state = SessionState::Connected;
                    let pending = std::mem::take(&mut self.pending_raw);
                    for bytes in pending {
                        if self.socket.send_bytes(&bytes).is_err() {
                            self.end();
                            events.push(SessionEvent::Closed);
                            return;
                        }
                    }
                }
                events.push(SessionEvent::StreamStart);
                if self.online_on_next_header {
                    self.online_on_next_header = false;
                    self.go_online(events);
                }
            }
            Frame::Features(features) => {
                // Priority order: TLS upgrade, certificate auth, dialback.
                if features.starttls && !self.socket.is_secure() && self.credentials.is_some() {
                    if self.send_raw(frame::starttls().as_bytes()).is_err() {
                        self.end();
                        events.push(SessionEvent::Closed);
                    }
                } else if features.offers_external()
                    && self.socket.is_secure()
                    && self.credentials.is_some()
                {
                    events.push(SessionEvent::Auth(AuthMethod::External));
                } else {
                    events.push(SessionEvent::Auth(AuthMethod::Dialback));
                }
            }
            Frame::TlsProceed => {
                let Some(credentials) = self.credentials.clone() else {
                    self.end();
                    events.push(SessionEvent::Closed);
                    return;
                };
                let servername = self.remote_domain.clone();
                if let Err(e) = self
                    .socket
                    .set_secure(&credentials, false, Some(&servername))
                {
                    warn!(session = %self.id, error = %e, "TLS upgrade failed to start");
                    self.end();
                    events.push(SessionEvent::Closed);
                }
            }
            Frame::TlsFailure => {
                warn!(session = %self.id, remote = %self.remote_domain, "peer refused STARTTLS");
                self.end();
                events.push(SessionEvent::Closed);
            }
            Frame::SaslSuccess => {
                debug!(session = %self.id, "EXTERNAL accepted, restarting stream");
                self.online_on_next_header = true;
                self.reader.reset();
                let header =
                    frame::stream_header(&self.local_domain, Some(&self.remote_domain), None);
                if self.socket.send_bytes(header.as_bytes()).is_err() {
                    self.end();
                    events.push(SessionEvent::Closed);
                }
            }
            Frame::SaslFailure { condition } => {
                warn!(session = %self.id, condition = %condition, "EXTERNAL refused");
                self.end();
                events.push(SessionEvent::Closed);
            }
            Frame::DialbackResult {
                from,
                to,
                result_type,
                ..
            } => match result_type.as_deref() {
                Some("valid") => {
                    if from != self.remote_domain || to != self.local_domain {
                        warn!(
                            session = %self.id,
                            from = %from,
                            to = %to,
                            "dialback answer domain mismatch"
                        );
                        return;
                    }
                    info!(session = %self.id, remote = %self.remote_domain, "dialback verified");
                    self.go_online(events);
                }
                Some(_) => {
                    warn!(session = %self.id, remote = %self.remote_domain, "dialback refused");
                    self.end();
                    events.push(SessionEvent::Error(FederationError::auth_failed(
                        "dialback verification failed",
                    )));
                    events.push(SessionEvent::Closed);
                }
                None => {
                    warn!(session = %self.id, "dialback request on an outgoing stream");
                }
            },
            Frame::DialbackVerify {
                from,
                to,
                id,
                verify_type,
                ..
            } => match verify_type.as_deref() {
                Some(t) => events.push(SessionEvent::DialbackVerified {
                    from,
                    to,
                    id,
                    valid: t == "valid",
                }),
                None => {
                    warn!(session = %self.id, "verify request on an outgoing stream");
                }
            },
            Frame::Stanza(stanza) => {
                // Outgoing federation streams are unidirectional for
                // stanzas; the peer routes replies over its own stream.
                warn!(session = %self.id, name = %stanza.name(), "stanza on an outgoing stream");
            }
            Frame::StreamEnd => {
                debug!(session = %self.id, remote = %self.remote_domain, "peer closed the stream");
                self.end();
                events.push(SessionEvent::Closed);
            }
            Frame::StreamError { condition } => {
                warn!(session = %self.id, condition = %condition, "peer reported stream error");
                self.end();
                events.push(SessionEvent::Error(FederationError::stream(condition)));
                events.push(SessionEvent::Closed);
            }
            Frame::StartTls | Frame::SaslAuth { .. } => {
                warn!(session = %self.id, "receiver-only frame on an outgoing stream");
            }
        }
    }

    fn go_online(&mut self, events: &mut Vec<SessionEvent>) {
        if self.state == SessionState::Closed || self.state.is_authed() {
            return;
        }
        self.state = SessionState::Authed;

        let queued = std::mem::take(&mut self.queue);
        for stanza in queued {
            if self.socket.send_bytes(stanza.to_xml().as_bytes()).is_err() {
                self.end();
                events.push(SessionEvent::Closed);
                return;
            }
        }

        events.push(SessionEvent::Online);
    }

    /// Begin Server Dialback with the given key.
    pub fn start_dialback(&mut self, key: String) {
        debug!(session = %self.id, remote = %self.remote_domain, "sending dialback key");
        let result =
            crate::dialback::build_result(&self.local_domain, &self.remote_domain, &key);
        self.db_key = Some(key);
        if self.send_raw(result.as_bytes()).is_err() {
            self.end();
        }
    }

    /// Begin SASL EXTERNAL; the authorization identity is our domain.
    pub fn send_external_auth(&mut self) {
        let authzid = BASE64.encode(self.local_domain.as_bytes());
        let auth = frame::sasl_auth("EXTERNAL", &authzid);
        if self.send_raw(auth.as_bytes()).is_err() {
            self.end();
        }
    }

    /// Whether a presented (stream ID, key) pair matches this session.
    ///
    /// This is the authoritative half of dialback: only the session that
    /// minted the key can confirm it.
    pub fn verify_matches(&self, id: &str, key: &str) -> bool {
        self.stream_attrs.id.as_deref() == Some(id) && self.db_key.as_deref() == Some(key)
    }

    /// Submit a stanza: wire it when online, queue it otherwise.
    pub fn send(&mut self, stanza: Stanza) {
        if self.state.is_authed() {
            if self.socket.send_bytes(stanza.to_xml().as_bytes()).is_err() {
                self.end();
            }
        } else {
            self.queue.push_back(stanza);
        }
    }

    /// Send a raw frame, waiting only for the stream handshake — dialback
    /// subprotocol frames must flow before authentication.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<(), FederationError> {
        match self.state {
            SessionState::Closed => Err(FederationError::NotConnected),
            SessionState::Connecting => {
                self.pending_raw.push(bytes.to_vec());
                Ok(())
            }
            _ => self.socket.send_bytes(bytes),
        }
    }

    /// Take the pre-auth queue, leaving it empty. Used by the context to
    /// bounce stanzas when the session dies before authenticating.
    pub fn take_queue(&mut self) -> VecDeque<Stanza> {
        std::mem::take(&mut self.queue)
    }

    /// Send a fatal stream error and close. Fire-and-forget.
    pub fn stream_error_and_close(&mut self, condition: StreamErrorCondition) {
        let _ = self.socket.send_bytes(frame::stream_error(condition).as_bytes());
        self.end();
    }

    /// Close the stream and transport. Idempotent.
    pub fn end(&mut self) {
        if self.state != SessionState::Closed {
            if !self.stream_closed_sent {
                self.stream_closed_sent = true;
                let _ = self.socket.send_bytes(STREAM_CLOSE.as_bytes());
            }
            self.state = SessionState::Closed;
            self.socket.close();
        }
    }
}
