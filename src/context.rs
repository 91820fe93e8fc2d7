//! Per-hosted-domain federation coordinator.
//!
//! One `DomainContext` exists per local domain for the lifetime of the
//! process. It owns every inbound and outbound session for that domain,
//! routes outbound stanzas (creating outgoing sessions lazily and queueing
//! while they authenticate), demultiplexes inbound traffic through the
//! stanza filter, and orchestrates both halves of the dialback handshake.
//!
//! All methods take `&mut self`: the transport adapter serializes every
//! callback for one context onto a single queue, so no internal locking is
//! needed and no map is touched from two places at once.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::dialback::DialbackKey;
use crate::error::{FederationError, StanzaErrorCondition, StreamErrorCondition};
use crate::session::{
    AuthMethod, IncomingSession, OutgoingSession, SessionEvent, SessionId, SessionIds,
};
use crate::stanza::{normalize_domain, Stanza};
use crate::transport::{Connector, Credentials, Socket};

use std::sync::Arc;

/// Configuration recognized by a context.
pub struct ContextConfig {
    /// TLS material; enables the STARTTLS offer and EXTERNAL.
    pub credentials: Option<Arc<Credentials>>,
    /// Operator policy: permit SASL EXTERNAL advertisement once TLS is up.
    pub secure_domain: bool,
    /// HMAC secret for dialback keys; a random per-process secret is
    /// generated when absent.
    pub dialback_secret: Option<Vec<u8>>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            credentials: None,
            secure_domain: false,
            dialback_secret: None,
        }
    }
}

/// Callback invoked for every stanza that passes the inbound filter.
pub type StanzaListener = Box<dyn FnMut(Stanza) + Send>;

/// An authoritative dialback check waiting for its outgoing session to
/// come online.
///
/// The asking domain and the domain whose outgoing session holds the key
/// are the same party in dialback, so one field covers both.
struct PendingCheck {
    /// Remote domain that asked and whose session must confirm the key.
    domain: String,
    /// Stream ID the key claims to belong to.
    id: String,
    /// The key under examination.
    key: String,
    /// Inbound session awaiting the `<db:verify>` answer.
    reply_sid: SessionId,
}

/// Per-hosted-domain registry and dispatcher.
pub struct DomainContext {
    domain: String,
    credentials: Option<Arc<Credentials>>,
    secure_domain: bool,
    dialback: DialbackKey,
    ids: SessionIds,
    connector: Box<dyn Connector>,
    /// All inbound sessions, verified or not.
    inbound: HashMap<SessionId, IncomingSession>,
    /// Verified inbound sessions by peer domain. At most one per domain;
    /// a newly verified stream conflicts the old one out.
    s2s_in: HashMap<String, SessionId>,
    /// Outbound sessions by remote domain. At most one per domain.
    s2s_out: HashMap<String, OutgoingSession>,
    /// Session-ID index over `s2s_out` for transport dispatch.
    out_domains: HashMap<SessionId, String>,
    /// Authoritative checks suspended until an outgoing session is up.
    pending_checks: Vec<PendingCheck>,
    /// Inbound sessions awaiting a `db:verify` answer, keyed by
    /// (peer domain, inbound stream ID).
    verify_waiters: HashMap<(String, String), SessionId>,
    stanza_listener: Option<StanzaListener>,
}

impl DomainContext {
    /// Create a context for one hosted domain.
    pub fn new(
        domain: &str,
        config: ContextConfig,
        connector: Box<dyn Connector>,
    ) -> Result<Self, FederationError> {
        let domain = normalize_domain(domain)?;
        let dialback = match config.dialback_secret {
            Some(secret) => DialbackKey::new(secret),
            None => DialbackKey::random(),
        };

        info!(domain = %domain, secure_domain = config.secure_domain, "domain context created");

        Ok(Self {
            domain,
            credentials: config.credentials,
            secure_domain: config.secure_domain,
            dialback,
            ids: SessionIds::new(),
            connector,
            inbound: HashMap::new(),
            s2s_in: HashMap::new(),
            s2s_out: HashMap::new(),
            out_domains: HashMap::new(),
            pending_checks: Vec::new(),
            verify_waiters: HashMap::new(),
            stanza_listener: None,
        })
    }

    /// The hosted domain this context serves.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Install TLS credentials.
    pub fn set_credentials(&mut self, credentials: Arc<Credentials>) {
        self.credentials = Some(credentials);
    }

    /// Install the host's stanza listener.
    pub fn set_stanza_listener(&mut self, listener: impl FnMut(Stanza) + Send + 'static) {
        self.stanza_listener = Some(Box::new(listener));
    }

    /// Share a router-wide session ID allocator.
    pub(crate) fn set_ids(&mut self, ids: SessionIds) {
        self.ids = ids;
    }

    /// Whether the given session belongs to this context.
    pub fn owns(&self, sid: SessionId) -> bool {
        self.inbound.contains_key(&sid) || self.out_domains.contains_key(&sid)
    }

    /// Number of verified inbound streams.
    pub fn inbound_count(&self) -> usize {
        self.s2s_in.len()
    }

    /// Number of outbound streams (any state).
    pub fn outbound_count(&self) -> usize {
        self.s2s_out.len()
    }

    /// Verified inbound session ID for a peer domain, if any.
    pub fn in_stream(&self, domain: &str) -> Option<SessionId> {
        self.s2s_in.get(domain).copied()
    }

    /// Outbound session ID for a remote domain, if any.
    pub fn out_stream(&self, domain: &str) -> Option<SessionId> {
        self.s2s_out.get(domain).map(|s| s.id())
    }

    // -----------------------------------------------------------------
    // Transport-facing surface
    // -----------------------------------------------------------------

    /// Admit a freshly accepted transport as an inbound session.
    pub fn accept(&mut self, socket: Box<dyn Socket>) -> SessionId {
        let sid = self.ids.next();
        self.accept_with_id(sid, socket);
        sid
    }

    /// Admit an accepted transport under a pre-allocated session ID.
    ///
    /// Used by the router after it has read the stream header to pick the
    /// context. No frames are written here; in particular, features wait
    /// for [`DomainContext::request_features`].
    pub fn accept_with_id(&mut self, sid: SessionId, socket: Box<dyn Socket>) {
        let session = IncomingSession::new(
            sid,
            self.domain.clone(),
            socket,
            self.credentials.clone(),
            self.secure_domain,
        );
        debug!(domain = %self.domain, session = %sid, "inbound session admitted");
        self.inbound.insert(sid, session);
    }

    /// Ask an inbound session to advertise its stream features.
    pub fn request_features(&mut self, sid: SessionId) {
        if let Some(session) = self.inbound.get_mut(&sid) {
            if let Err(e) = session.send_features() {
                warn!(session = %sid, error = %e, "failed to send features");
            }
        }
    }

    /// Feed transport bytes to the session that owns them.
    pub fn feed(&mut self, sid: SessionId, bytes: &[u8]) {
        if let Some(session) = self.inbound.get_mut(&sid) {
            let events = session.feed_bytes(bytes);
            self.handle_incoming_events(sid, events);
        } else if let Some(domain) = self.out_domains.get(&sid).cloned() {
            let events = match self.s2s_out.get_mut(&domain) {
                Some(session) => session.feed_bytes(bytes),
                None => return,
            };
            self.handle_outgoing_events(&domain, events);
        }
    }

    /// Transport callback: an outgoing TCP connection is established.
    pub fn session_connected(&mut self, sid: SessionId) {
        if let Some(domain) = self.out_domains.get(&sid).cloned() {
            if let Some(session) = self.s2s_out.get_mut(&domain) {
                session.transport_connected();
            }
        }
    }

    /// Transport callback: a TLS handshake completed.
    pub fn tls_established(&mut self, sid: SessionId) {
        if let Some(session) = self.inbound.get_mut(&sid) {
            session.tls_established();
        } else if let Some(domain) = self.out_domains.get(&sid).cloned() {
            if let Some(session) = self.s2s_out.get_mut(&domain) {
                session.tls_established();
            }
        }
    }

    /// Transport callback: a TLS renegotiation completed.
    pub fn renegotiated(&mut self, sid: SessionId) {
        if let Some(session) = self.inbound.get_mut(&sid) {
            let events = session.renegotiated();
            self.handle_incoming_events(sid, events);
        }
    }

    /// Transport callback: the underlying connection closed.
    pub fn session_closed(&mut self, sid: SessionId) {
        if self.inbound.contains_key(&sid) {
            self.cleanup_incoming(sid);
        } else if let Some(domain) = self.out_domains.get(&sid).cloned() {
            self.cleanup_outgoing(&domain);
        }
    }

    // -----------------------------------------------------------------
    // Host-facing surface
    // -----------------------------------------------------------------

    /// Route an outbound stanza.
    ///
    /// Stanzas without a destination bounce straight back as
    /// `jid-malformed`; everything else goes to the outgoing session for
    /// the destination domain, queueing while it authenticates.
    pub fn send(&mut self, stanza: Stanza) {
        let Some(to) = stanza.to().map(str::to_string) else {
            if let Some(bounce) = stanza.error_bounce(StanzaErrorCondition::JidMalformed) {
                self.receive(bounce);
            }
            return;
        };

        let Some(dest) = normalize_domain_of_jid(&to) else {
            if let Some(bounce) = stanza.error_bounce(StanzaErrorCondition::JidMalformed) {
                self.receive(bounce);
            }
            return;
        };

        match self.get_or_open_out(&dest) {
            Ok(session) => session.send(stanza),
            Err(e) => {
                warn!(domain = %dest, error = %e, "cannot reach remote domain");
                if let Some(bounce) =
                    stanza.error_bounce(StanzaErrorCondition::RemoteServerNotFound)
                {
                    self.receive(bounce);
                }
            }
        }
    }

    /// Send a raw frame towards a remote domain.
    ///
    /// Dialback subprotocol frames use this path: it waits only for the
    /// stream handshake, never for authentication.
    pub fn send_raw(&mut self, bytes: &[u8], dest: &str) -> Result<(), FederationError> {
        let session = self.get_or_open_out(dest)?;
        session.send_raw(bytes)
    }

    /// Admit a verified inbound stream for a peer domain.
    ///
    /// Enforces inbound uniqueness: an existing stream for the same domain
    /// is terminated with a `conflict` stream error before replacement.
    pub fn add_in_stream(&mut self, src_domain: &str, sid: SessionId) {
        if let Some(old_sid) = self.s2s_in.get(src_domain).copied() {
            if old_sid != sid {
                info!(domain = %src_domain, old = %old_sid, new = %sid, "replacing inbound stream");
                if let Some(old) = self.inbound.get_mut(&old_sid) {
                    old.stream_error_and_close(StreamErrorCondition::Conflict);
                }
                self.inbound.remove(&old_sid);
            }
        }

        self.s2s_in.insert(src_domain.to_string(), sid);
        if let Some(session) = self.inbound.get_mut(&sid) {
            session.mark_authenticated(src_domain);
        }
    }

    /// Authoritative dialback check: does our outgoing session to `domain`
    /// carry this (stream ID, key) pair?
    ///
    /// Returns `None` while the outgoing session exists but has not
    /// finished its handshake — the caller re-arms through the session's
    /// `online` (or fails it on close). No session at all means `false`.
    pub fn verify_dialback(&self, domain: &str, id: &str, key: &str) -> Option<bool> {
        match self.s2s_out.get(domain) {
            None => Some(false),
            Some(session) if session.state().is_connected() => {
                Some(session.verify_matches(id, key))
            }
            Some(_) => None,
        }
    }

    /// Start the verify round-trip for an inbound dialback request: reach
    /// the claimed domain over an outgoing stream and ask it to confirm
    /// the key it supposedly minted for `in_sid`'s stream.
    pub fn verify_incoming(&mut self, from_domain: &str, in_sid: SessionId, db_key: &str) {
        let Some(in_stream_id) = self
            .inbound
            .get(&in_sid)
            .map(|s| s.stream_id().to_string())
        else {
            return;
        };

        let verify =
            crate::dialback::build_verify(&self.domain, from_domain, &in_stream_id, db_key);

        debug!(
            domain = %self.domain,
            peer = %from_domain,
            stream_id = %in_stream_id,
            "requesting dialback verification"
        );

        self.verify_waiters
            .insert((from_domain.to_string(), in_stream_id), in_sid);

        if let Err(e) = self.send_raw(verify.as_bytes(), from_domain) {
            warn!(peer = %from_domain, error = %e, "verify round-trip failed to start");
            self.fail_verify_waiters(from_domain);
        }
    }

    /// Terminate every session in both maps.
    pub fn end(&mut self) {
        info!(domain = %self.domain, "terminating all federation sessions");
        for session in self.inbound.values_mut() {
            session.end();
        }
        self.inbound.clear();
        self.s2s_in.clear();
        for session in self.s2s_out.values_mut() {
            session.end();
        }
        self.s2s_out.clear();
        self.out_domains.clear();
        self.pending_checks.clear();
        self.verify_waiters.clear();
    }

    /// Hand a stanza to the host's listener.
    fn receive(&mut self, stanza: Stanza) {
        if let Some(listener) = self.stanza_listener.as_mut() {
            listener(stanza);
        } else {
            debug!(domain = %self.domain, name = %stanza.name(), "no stanza listener installed");
        }
    }

    // -----------------------------------------------------------------
    // Event dispatch
    // -----------------------------------------------------------------

    fn handle_incoming_events(&mut self, sid: SessionId, events: Vec<SessionEvent>) {
        for event in events {
            match event {
                SessionEvent::StreamStart => {
                    debug!(session = %sid, "inbound stream (re)started");
                }
                SessionEvent::Auth(AuthMethod::Sasl) => self.admit_sasl_stream(sid),
                SessionEvent::Auth(method) => {
                    warn!(session = %sid, method = method.as_str(), "unexpected auth on inbound");
                }
                SessionEvent::DialbackRequest { from, to, key } => {
                    self.handle_dialback_request(sid, &from, &to, &key);
                }
                SessionEvent::DialbackVerifyRequest { from, to, id, key } => {
                    self.handle_verify_request(sid, &from, &to, &id, &key);
                }
                SessionEvent::Stanza(stanza) => self.filter_inbound(sid, stanza),
                SessionEvent::Closed => self.cleanup_incoming(sid),
                SessionEvent::Error(e) => {
                    warn!(session = %sid, error = %e, "inbound session error");
                }
                SessionEvent::Online | SessionEvent::DialbackVerified { .. } => {}
            }
        }
    }

    /// An inbound stream passed the certificate identity check; admit it
    /// for the domain its header claims.
    fn admit_sasl_stream(&mut self, sid: SessionId) {
        let claimed = self
            .inbound
            .get(&sid)
            .and_then(|s| s.stream_attrs().from.clone())
            .and_then(|d| normalize_domain(&d).ok());

        match claimed {
            Some(peer) => {
                info!(peer = %peer, session = %sid, "inbound stream authenticated via EXTERNAL");
                if let Some(session) = self.inbound.get_mut(&sid) {
                    session.on_sasl_success();
                }
                self.add_in_stream(&peer, sid);
            }
            None => {
                if let Some(session) = self.inbound.get_mut(&sid) {
                    session.send_not_authorized_and_close();
                }
                self.cleanup_incoming(sid);
            }
        }
    }

    fn handle_dialback_request(&mut self, sid: SessionId, from: &str, to: &str, key: &str) {
        let Ok(to) = normalize_domain(to) else {
            self.close_incoming(sid, StreamErrorCondition::ImproperAddressing);
            return;
        };
        if to != self.domain {
            self.close_incoming(sid, StreamErrorCondition::HostUnknown);
            return;
        }
        let Ok(from) = normalize_domain(from) else {
            self.close_incoming(sid, StreamErrorCondition::ImproperAddressing);
            return;
        };

        self.verify_incoming(&from, sid, key);
    }

    fn handle_verify_request(&mut self, sid: SessionId, from: &str, to: &str, id: &str, key: &str) {
        let Ok(peer) = normalize_domain(from) else {
            self.close_incoming(sid, StreamErrorCondition::ImproperAddressing);
            return;
        };
        if normalize_domain(to).ok().as_deref() != Some(self.domain.as_str()) {
            self.close_incoming(sid, StreamErrorCondition::HostUnknown);
            return;
        }

        match self.verify_dialback(&peer, id, key) {
            Some(valid) => {
                let local = self.domain.clone();
                if let Some(session) = self.inbound.get_mut(&sid) {
                    session.send_verify_response(&local, &peer, id, valid);
                }
            }
            None => {
                // The outgoing session is still handshaking; the check
                // re-arms when it comes online and fails if it closes.
                debug!(peer = %peer, id = %id, "suspending dialback check");
                self.pending_checks.push(PendingCheck {
                    domain: peer,
                    id: id.to_string(),
                    key: key.to_string(),
                    reply_sid: sid,
                });
            }
        }
    }

    /// Apply the inbound stanza filter and deliver survivors.
    fn filter_inbound(&mut self, sid: SessionId, stanza: Stanza) {
        if !stanza.is_routable() {
            debug!(session = %sid, name = %stanza.name(), "dropping non-routable stanza");
            return;
        }

        let peer_domain = self
            .inbound
            .get(&sid)
            .and_then(|s| s.peer_domain().map(str::to_string));
        let Some(peer_domain) = peer_domain else {
            self.close_incoming(sid, StreamErrorCondition::NotAuthorized);
            return;
        };

        if stanza.from().is_none() || stanza.to().is_none() {
            self.close_incoming(sid, StreamErrorCondition::ImproperAddressing);
            return;
        }

        // A stream verified for domain D may only originate stanzas from D.
        match stanza.from_domain() {
            Some(from) if from == peer_domain => {}
            _ => {
                warn!(session = %sid, peer = %peer_domain, "spoofed from domain on inbound stream");
                self.close_incoming(sid, StreamErrorCondition::InvalidFrom);
                return;
            }
        }

        match stanza.to_domain() {
            Some(to) if to == self.domain => {}
            _ => {
                self.close_incoming(sid, StreamErrorCondition::ImproperAddressing);
                return;
            }
        }

        self.receive(stanza);
    }

    fn handle_outgoing_events(&mut self, domain: &str, events: Vec<SessionEvent>) {
        for event in events {
            match event {
                SessionEvent::StreamStart => {
                    debug!(domain = %domain, "outgoing stream (re)started");
                }
                SessionEvent::Auth(AuthMethod::Dialback) => self.start_dialback(domain),
                SessionEvent::Auth(AuthMethod::External) => {
                    if let Some(session) = self.s2s_out.get_mut(domain) {
                        session.send_external_auth();
                    }
                }
                SessionEvent::Auth(AuthMethod::Sasl) => {
                    warn!(domain = %domain, "unexpected auth method on outgoing");
                }
                SessionEvent::Online => {
                    info!(domain = %domain, "outgoing stream online");
                    self.run_pending_checks(domain);
                }
                SessionEvent::DialbackVerified {
                    from, id, valid, ..
                } => {
                    self.finish_verify(&from, &id, valid);
                }
                SessionEvent::Closed => self.cleanup_outgoing(domain),
                SessionEvent::Error(e) => {
                    warn!(domain = %domain, error = %e, "outgoing session error");
                }
                SessionEvent::Stanza(_)
                | SessionEvent::DialbackRequest { .. }
                | SessionEvent::DialbackVerifyRequest { .. } => {}
            }
        }
    }

    /// Derive and send the dialback key for an outgoing session.
    fn start_dialback(&mut self, domain: &str) {
        let Some(session) = self.s2s_out.get_mut(domain) else {
            return;
        };
        let Some(stream_id) = session.stream_id().map(str::to_string) else {
            warn!(domain = %domain, "no stream ID for dialback");
            session.stream_error_and_close(StreamErrorCondition::UndefinedCondition);
            self.cleanup_outgoing(domain);
            return;
        };

        let key = self.dialback.generate(&self.domain, domain, &stream_id);
        session.start_dialback(key);
    }

    /// Re-run authoritative checks that were waiting on this session.
    fn run_pending_checks(&mut self, domain: &str) {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_checks)
            .into_iter()
            .partition(|c| c.domain == domain);
        self.pending_checks = waiting;

        for check in ready {
            let valid = self
                .s2s_out
                .get(domain)
                .map_or(false, |s| s.verify_matches(&check.id, &check.key));
            let local = self.domain.clone();
            if let Some(session) = self.inbound.get_mut(&check.reply_sid) {
                session.send_verify_response(&local, &check.domain, &check.id, valid);
            }
        }
    }

    /// The authoritative server answered a `db:verify`; relay the verdict
    /// to the waiting inbound stream and admit or close it.
    fn finish_verify(&mut self, peer: &str, id: &str, valid: bool) {
        let Ok(peer) = normalize_domain(peer) else {
            return;
        };
        let Some(in_sid) = self.verify_waiters.remove(&(peer.clone(), id.to_string())) else {
            debug!(peer = %peer, id = %id, "verify answer without a waiter");
            return;
        };

        let local = self.domain.clone();
        if valid {
            if let Some(session) = self.inbound.get_mut(&in_sid) {
                session.send_result_response(&local, &peer, true);
            }
            info!(peer = %peer, session = %in_sid, "inbound stream authenticated via dialback");
            self.add_in_stream(&peer, in_sid);
        } else {
            warn!(peer = %peer, session = %in_sid, "dialback verification failed");
            if let Some(session) = self.inbound.get_mut(&in_sid) {
                session.send_result_response(&local, &peer, false);
                session.end();
            }
            self.cleanup_incoming(in_sid);
        }
    }

    // -----------------------------------------------------------------
    // Session bookkeeping
    // -----------------------------------------------------------------

    /// Fetch or lazily create the outgoing session for a remote domain.
    fn get_or_open_out(
        &mut self,
        domain: &str,
    ) -> Result<&mut OutgoingSession, FederationError> {
        assert!(
            !domain.is_empty(),
            "outgoing stream requested for an empty domain"
        );

        use std::collections::hash_map::Entry;
        match self.s2s_out.entry(domain.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let sid = self.ids.next();
                let socket = self.connector.connect(domain, sid)?;
                debug!(domain = %domain, session = %sid, "opening outgoing stream");
                let session = OutgoingSession::new(
                    sid,
                    self.domain.clone(),
                    domain.to_string(),
                    socket,
                    self.credentials.clone(),
                );
                self.out_domains.insert(sid, domain.to_string());
                Ok(entry.insert(session))
            }
        }
    }

    fn close_incoming(&mut self, sid: SessionId, condition: StreamErrorCondition) {
        if let Some(session) = self.inbound.get_mut(&sid) {
            session.stream_error_and_close(condition);
        }
        self.cleanup_incoming(sid);
    }

    fn cleanup_incoming(&mut self, sid: SessionId) {
        if let Some(mut session) = self.inbound.remove(&sid) {
            session.end();
        }
        self.s2s_in.retain(|_, entry| *entry != sid);
        self.pending_checks.retain(|c| c.reply_sid != sid);
        self.verify_waiters.retain(|_, entry| *entry != sid);
    }

    /// Tear down an outgoing session: bounce its queue, fail suspended
    /// checks, and close inbound streams still waiting on it.
    fn cleanup_outgoing(&mut self, domain: &str) {
        let Some(mut session) = self.s2s_out.remove(domain) else {
            return;
        };
        self.out_domains.remove(&session.id());

        let was_authed = session.state().is_authed();
        let queue = session.take_queue();
        session.end();

        debug!(
            domain = %domain,
            was_authed,
            bounced = queue.len(),
            "outgoing stream closed"
        );

        for stanza in queue {
            if let Some(bounce) = stanza.error_bounce(StanzaErrorCondition::RemoteServerNotFound) {
                self.receive(bounce);
            }
        }

        // Authoritative checks suspended on this session fail closed.
        let (failed, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_checks)
            .into_iter()
            .partition(|c| c.domain == domain);
        self.pending_checks = waiting;
        for check in failed {
            let local = self.domain.clone();
            if let Some(in_session) = self.inbound.get_mut(&check.reply_sid) {
                in_session.send_verify_response(&local, &check.domain, &check.id, false);
            }
        }

        self.fail_verify_waiters(domain);
    }

    /// Close inbound streams whose verify round-trip went through the
    /// given (now dead) remote domain.
    fn fail_verify_waiters(&mut self, domain: &str) {
        let stale: Vec<(String, String)> = self
            .verify_waiters
            .keys()
            .filter(|(d, _)| d == domain)
            .cloned()
            .collect();

        for key in stale {
            if let Some(in_sid) = self.verify_waiters.remove(&key) {
                let local = self.domain.clone();
                if let Some(session) = self.inbound.get_mut(&in_sid) {
                    session.send_result_response(&local, domain, false);
                    session.end();
                }
                self.cleanup_incoming(in_sid);
            }
        }
    }
}

/// Normalized domain of a JID string, if it parses.
fn normalize_domain_of_jid(jid: &str) -> Option<String> {
    jid::Jid::new(jid)
        .ok()
        .map(|j| j.domain().as_str().to_string())
}
