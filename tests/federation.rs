//! Federation core integration tests.
//!
//! These drive the session state machines and the domain coordinator over
//! the stub transport in `common/`: feature gating, certificate identity,
//! STARTTLS and SASL EXTERNAL negotiation, both halves of the dialback
//! handshake, queue discipline, and the inbound stanza filter.
//!
//! Run with: `cargo test --test federation`

mod common;

use std::sync::{Arc, Mutex};

use common::{
    init_tracing, is_closed, test_credentials, write_frames, written, ConnectionLog, StubConnector,
    StubHandle, StubSocket,
};
use plover_xmpp::cert::PeerCertificate;
use plover_xmpp::dialback::DialbackKey;
use plover_xmpp::session::SessionIds;
use plover_xmpp::{
    AuthMethod, ContextConfig, DomainContext, IncomingSession, OutgoingSession, SessionEvent,
    SessionId, Stanza,
};

const LOCAL: &str = "local.example";

fn context(secure_domain: bool, secret: &[u8]) -> (DomainContext, Arc<Mutex<Vec<Stanza>>>, ConnectionLog)
{
    init_tracing();
    let (connector, log) = StubConnector::new();
    let mut ctx = DomainContext::new(
        LOCAL,
        ContextConfig {
            credentials: Some(test_credentials()),
            secure_domain,
            dialback_secret: Some(secret.to_vec()),
        },
        Box::new(connector),
    )
    .unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    ctx.set_stanza_listener(move |stanza| sink.lock().unwrap().push(stanza));

    (ctx, received, log)
}

fn message(from: &str, to: &str, id: &str) -> Stanza {
    Stanza::parse(&format!(
        "<message xmlns='jabber:server' from='{}' to='{}' id='{}'><body>hello</body></message>",
        from, to, id
    ))
    .unwrap()
}

fn peer_header(from: &str, to: &str) -> String {
    format!(
        "<stream:stream xmlns='jabber:server' \
         xmlns:stream='http://etherx.jabber.org/streams' \
         xmlns:db='jabber:server:dialback' \
         from='{}' to='{}' version='1.0'>",
        from, to
    )
}

fn remote_header(from: &str, id: &str) -> String {
    format!(
        "<stream:stream xmlns='jabber:server' \
         xmlns:stream='http://etherx.jabber.org/streams' \
         xmlns:db='jabber:server:dialback' \
         from='{}' id='{}' version='1.0'>",
        from, id
    )
}

/// Stream ID our side chose, read back from the written header.
fn sent_stream_id(handle: &StubHandle) -> String {
    let header = write_frames(handle)
        .into_iter()
        .find(|w| w.contains("<stream:stream"))
        .expect("no header written");
    let start = header.find(" id='").expect("header has no id") + 5;
    let end = header[start..].find('\'').unwrap();
    header[start..start + end].to_string()
}

fn incoming_session(
    secure_domain: bool,
    socket: StubSocket,
) -> (IncomingSession, SessionId) {
    init_tracing();
    let ids = SessionIds::new();
    let sid = ids.next();
    let session = IncomingSession::new(
        sid,
        LOCAL.to_string(),
        Box::new(socket),
        Some(test_credentials()),
        secure_domain,
    );
    (session, sid)
}

// ===========================================================================
// Feature gating
// ===========================================================================

#[test]
fn features_advertise_external_only_on_secure_streams() {
    let (socket, handle) = StubSocket::secure(true, "peer.example", None);
    let (mut session, _) = incoming_session(true, socket);

    session.send_features().unwrap();

    assert_eq!(
        written(&handle),
        "<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
         <mechanism>EXTERNAL</mechanism></mechanisms></stream:features>"
    );
}

#[test]
fn features_are_empty_without_secure_domain_policy() {
    let (socket, handle) = StubSocket::secure(true, "peer.example", None);
    let (mut session, _) = incoming_session(false, socket);

    session.send_features().unwrap();

    assert_eq!(written(&handle), "<stream:features/>");
}

#[test]
fn features_are_empty_before_tls() {
    let (socket, handle) = StubSocket::new();
    let (mut session, _) = incoming_session(true, socket);

    session.send_features().unwrap();

    assert_eq!(written(&handle), "<stream:features/>");
}

#[test]
fn features_are_empty_once_authenticated() {
    let (socket, handle) = StubSocket::secure(true, "peer.example", None);
    let (mut session, _) = incoming_session(true, socket);
    session.mark_authenticated("peer.example");

    session.send_features().unwrap();

    assert_eq!(written(&handle), "<stream:features/>");
}

// ===========================================================================
// Certificate identity (RFC 6125)
// ===========================================================================

fn auth_events(events: &[SessionEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, SessionEvent::Auth(AuthMethod::Sasl)))
        .count()
}

#[test]
fn cn_mismatch_is_not_authorized() {
    let cert = PeerCertificate {
        subject_cn: Some("example.com".to_string()),
        san_dns: vec![],
    };
    let (socket, handle) = StubSocket::secure(true, "xmpp.example.com", Some(cert));
    let (mut session, _) = incoming_session(true, socket);

    let mut events = Vec::new();
    session.verify_certificate(&mut events);

    assert_eq!(auth_events(&events), 0);
    let frames = write_frames(&handle);
    assert!(frames[0].contains("<not-authorized/>"));
    assert_eq!(frames[1], "</stream:stream>");
    assert!(is_closed(&handle));
}

#[test]
fn wildcard_does_not_cover_bare_domain() {
    let cert = PeerCertificate {
        subject_cn: Some("*.example.com".to_string()),
        san_dns: vec![],
    };
    let (socket, handle) = StubSocket::secure(true, "example.com", Some(cert));
    let (mut session, _) = incoming_session(true, socket);

    let mut events = Vec::new();
    session.verify_certificate(&mut events);

    assert_eq!(auth_events(&events), 0);
    assert!(is_closed(&handle));
}

#[test]
fn san_match_authenticates() {
    let cert = PeerCertificate {
        subject_cn: Some("*.example.com".to_string()),
        san_dns: vec!["example.com".to_string()],
    };
    let (socket, handle) = StubSocket::secure(true, "example.com", Some(cert));
    let (mut session, _) = incoming_session(true, socket);

    let mut events = Vec::new();
    session.verify_certificate(&mut events);

    assert_eq!(auth_events(&events), 1);
    assert!(!is_closed(&handle));
    assert!(!written(&handle).contains("not-authorized"));
}

#[test]
fn unauthorized_socket_is_rejected_before_identity_check() {
    let cert = PeerCertificate {
        subject_cn: Some("example.com".to_string()),
        san_dns: vec!["example.com".to_string()],
    };
    let (socket, handle) = StubSocket::secure(false, "example.com", Some(cert));
    let (mut session, _) = incoming_session(true, socket);

    let mut events = Vec::new();
    session.verify_certificate(&mut events);

    assert_eq!(auth_events(&events), 0);
    assert!(is_closed(&handle));
}

// ===========================================================================
// SASL EXTERNAL and renegotiation
// ===========================================================================

const EXTERNAL_AUTH: &str =
    "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='EXTERNAL'>bG9jYWwuZXhhbXBsZQ==</auth>";

#[test]
fn empty_certificate_triggers_renegotiation_before_verify() {
    let (socket, handle) = StubSocket::secure(true, "peer.example", None);
    let (mut session, _) = incoming_session(true, socket);
    session.feed_bytes(peer_header("peer.example", LOCAL).as_bytes());

    let events = session.feed_bytes(EXTERNAL_AUTH.as_bytes());

    // Renegotiation requested, verification deferred.
    assert_eq!(handle.lock().unwrap().renegotiate_calls, vec![true]);
    assert_eq!(auth_events(&events), 0);
    assert!(!is_closed(&handle));

    // The transport completes the renegotiation with a usable certificate.
    handle.lock().unwrap().peer_cert = Some(PeerCertificate {
        subject_cn: None,
        san_dns: vec!["peer.example".to_string()],
    });
    let events = session.renegotiated();
    assert_eq!(auth_events(&events), 1);
}

#[test]
fn populated_certificate_skips_renegotiation() {
    let cert = PeerCertificate {
        subject_cn: Some("peer.example".to_string()),
        san_dns: vec![],
    };
    let (socket, handle) = StubSocket::secure(true, "peer.example", Some(cert));
    let (mut session, _) = incoming_session(true, socket);
    session.feed_bytes(peer_header("peer.example", LOCAL).as_bytes());

    let events = session.feed_bytes(EXTERNAL_AUTH.as_bytes());

    assert!(handle.lock().unwrap().renegotiate_calls.is_empty());
    assert_eq!(auth_events(&events), 1);
}

#[test]
fn auth_on_cleartext_stream_is_refused() {
    let (socket, handle) = StubSocket::new();
    let (mut session, _) = incoming_session(true, socket);
    session.feed_bytes(peer_header("peer.example", LOCAL).as_bytes());

    let events = session.feed_bytes(EXTERNAL_AUTH.as_bytes());

    assert_eq!(auth_events(&events), 0);
    assert!(written(&handle).contains("<not-authorized/>"));
    assert!(is_closed(&handle));
}

#[test]
fn failed_renegotiation_is_refused() {
    let (socket, handle) = StubSocket::secure(true, "peer.example", None);
    handle.lock().unwrap().fail_renegotiate = true;
    let (mut session, _) = incoming_session(true, socket);
    session.feed_bytes(peer_header("peer.example", LOCAL).as_bytes());

    session.feed_bytes(EXTERNAL_AUTH.as_bytes());

    assert!(written(&handle).contains("<not-authorized/>"));
    assert!(is_closed(&handle));
}

#[test]
fn sasl_success_precedes_stream_restart() {
    let (socket, handle) = StubSocket::secure(true, "peer.example", None);
    let (mut session, _) = incoming_session(true, socket);
    session.feed_bytes(peer_header("peer.example", LOCAL).as_bytes());

    session.on_sasl_success();

    let frames = write_frames(&handle);
    // Header response first, then success; nothing else yet.
    assert_eq!(frames.len(), 2);
    assert!(frames[1].contains("<success"));

    // The restart took: a fresh header is accepted and answered.
    session.feed_bytes(peer_header("peer.example", LOCAL).as_bytes());
    let frames = write_frames(&handle);
    assert!(frames[2].contains("<stream:stream"));
}

#[test]
fn not_authorized_close_ordering() {
    let (socket, handle) = StubSocket::secure(true, "peer.example", None);
    let (mut session, _) = incoming_session(true, socket);

    session.send_not_authorized_and_close();

    let frames = write_frames(&handle);
    assert_eq!(frames.len(), 2);
    assert_eq!(
        frames[0],
        "<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>"
    );
    assert_eq!(frames[1], "</stream:stream>");
    assert!(is_closed(&handle));
}

// ===========================================================================
// STARTTLS
// ===========================================================================

#[test]
fn starttls_proceeds_and_hands_off_the_socket() {
    let (socket, handle) = StubSocket::new();
    let (mut session, _) = incoming_session(false, socket);
    session.feed_bytes(peer_header("peer.example", LOCAL).as_bytes());

    let accepted = session.handle_tls_negotiation();

    assert!(accepted);
    assert!(written(&handle).contains("<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>"));
    // Server-side upgrade, no SNI target of our own.
    assert_eq!(
        handle.lock().unwrap().set_secure_calls,
        vec![(true, None)]
    );
}

#[test]
fn no_features_are_sent_on_accept() {
    let (mut ctx, _, _) = context(true, b"secret");
    let (socket, handle) = StubSocket::new();

    ctx.accept(Box::new(socket));

    assert!(handle.lock().unwrap().writes.is_empty());
}

// ===========================================================================
// Outgoing session: queue discipline and dialback
// ===========================================================================

#[test]
fn outgoing_dialback_end_to_end_with_fifo_queue() {
    let secret = b"outgoing-secret";
    let (mut ctx, _, log) = context(false, secret);

    ctx.send(message("alice@local.example", "bob@far.example", "m1"));
    ctx.send(message("alice@local.example", "bob@far.example", "m2"));

    let (sid, handle) = {
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1, "one outgoing session per remote domain");
        assert_eq!(log[0].domain, "far.example");
        (log[0].session, Arc::clone(&log[0].handle))
    };

    // Transport comes up; we open the stream.
    ctx.session_connected(sid);
    assert!(written(&handle).contains("to='far.example'"));

    // The receiving server answers with its header and empty features.
    ctx.feed(sid, remote_header("far.example", "SID-1").as_bytes());
    ctx.feed(sid, b"<stream:features/>");

    // Dialback begins with the derived key; stanzas stay queued.
    let expected_key = DialbackKey::new(secret).generate(LOCAL, "far.example", "SID-1");
    let wire = written(&handle);
    assert!(wire.contains(&expected_key));
    assert!(!wire.contains("m1"), "stanzas must not flow before auth");

    // Verification succeeds; the queue drains in FIFO order.
    ctx.feed(
        sid,
        b"<db:result from='far.example' to='local.example' type='valid'/>",
    );
    let wire = written(&handle);
    let m1 = wire.find("m1").expect("first stanza on the wire");
    let m2 = wire.find("m2").expect("second stanza on the wire");
    assert!(m1 < m2, "queue drains in enqueue order");
}

#[test]
fn queued_stanzas_bounce_when_the_session_dies_unverified() {
    let (mut ctx, received, log) = context(false, b"secret");

    ctx.send(message("alice@local.example", "bob@far.example", "m1"));
    ctx.send(message("alice@local.example", "bob@far.example", "m2"));
    ctx.send(message("alice@local.example", "bob@far.example", "m3"));
    // Errors never bounce; this one must vanish silently.
    ctx.send(
        Stanza::parse(
            "<message xmlns='jabber:server' type='error' \
             from='alice@local.example' to='bob@far.example' id='e1'/>",
        )
        .unwrap(),
    );

    let sid = log.lock().unwrap()[0].session;
    ctx.session_closed(sid);

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 3);
    for (bounce, id) in received.iter().zip(["m1", "m2", "m3"]) {
        assert_eq!(bounce.stanza_type(), Some("error"));
        assert_eq!(bounce.to(), Some("alice@local.example"));
        assert_eq!(bounce.from(), Some("bob@far.example"));
        assert_eq!(bounce.id(), Some(id));
        assert!(bounce.to_xml().contains("remote-server-not-found"));
    }

    assert_eq!(ctx.outbound_count(), 0);
}

#[test]
fn outgoing_starttls_then_external() {
    init_tracing();
    let ids = SessionIds::new();
    let (socket, handle) = StubSocket::new();
    let mut session = OutgoingSession::new(
        ids.next(),
        LOCAL.to_string(),
        "far.example".to_string(),
        Box::new(socket),
        Some(test_credentials()),
    );

    session.send(message("alice@local.example", "bob@far.example", "m1"));
    assert_eq!(session.queued(), 1);

    session.transport_connected();
    session.feed_bytes(remote_header("far.example", "S1").as_bytes());

    // STARTTLS wins over everything else.
    session.feed_bytes(
        b"<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:features>",
    );
    assert!(written(&handle).contains("<starttls"));
    session.feed_bytes(b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
    assert_eq!(
        handle.lock().unwrap().set_secure_calls,
        vec![(false, Some("far.example".to_string()))]
    );

    // Handshake completes; the stream restarts over TLS.
    handle.lock().unwrap().secure = true;
    session.tls_established();
    session.feed_bytes(remote_header("far.example", "S2").as_bytes());

    // EXTERNAL is offered and taken; the authzid is our domain.
    let events = session.feed_bytes(
        b"<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
          <mechanism>EXTERNAL</mechanism></mechanisms></stream:features>",
    );
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::Auth(AuthMethod::External))));
    session.send_external_auth();
    assert!(written(&handle).contains("bG9jYWwuZXhhbXBsZQ=="));

    // Success restarts the stream once more; the next header is online.
    session.feed_bytes(b"<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>");
    let events = session.feed_bytes(remote_header("far.example", "S3").as_bytes());
    assert!(events.iter().any(|e| matches!(e, SessionEvent::Online)));
    assert!(session.state().is_authed());
    assert!(session.state().is_connected());
    assert_eq!(session.queued(), 0);
    assert!(written(&handle).contains("m1"));
}

#[test]
fn dialback_refusal_closes_the_session() {
    init_tracing();
    let ids = SessionIds::new();
    let (socket, handle) = StubSocket::new();
    let mut session = OutgoingSession::new(
        ids.next(),
        LOCAL.to_string(),
        "far.example".to_string(),
        Box::new(socket),
        None,
    );

    session.transport_connected();
    session.feed_bytes(remote_header("far.example", "S1").as_bytes());
    session.feed_bytes(b"<stream:features/>");
    session.start_dialback("some-key".to_string());

    let events = session.feed_bytes(
        b"<db:result from='far.example' to='local.example' type='invalid'/>",
    );

    assert!(events.iter().any(|e| matches!(e, SessionEvent::Closed)));
    assert!(!session.state().is_authed());
    assert!(is_closed(&handle));
}

// ===========================================================================
// Incoming dialback: the receiving server's verify round-trip
// ===========================================================================

#[test]
fn inbound_dialback_verify_round_trip() {
    let (mut ctx, received, log) = context(false, b"receiver-secret");

    // Peer connects and opens a stream towards us.
    let (socket, in_handle) = StubSocket::new();
    let sid_in = ctx.accept(Box::new(socket));
    ctx.feed(sid_in, peer_header("a.example", LOCAL).as_bytes());
    ctx.request_features(sid_in);
    assert!(written(&in_handle).contains("<stream:features/>"));
    let in_stream_id = sent_stream_id(&in_handle);

    // It asks to be verified for a.example.
    ctx.feed(
        sid_in,
        b"<db:result from='a.example' to='local.example'>PEERKEY</db:result>",
    );

    // That opens (or reuses) an outgoing stream back to a.example.
    let (sid_out, out_handle) = {
        let log = log.lock().unwrap();
        assert_eq!(log[0].domain, "a.example");
        (log[0].session, Arc::clone(&log[0].handle))
    };

    // The verify request waits for the stream handshake, then flows.
    ctx.session_connected(sid_out);
    ctx.feed(sid_out, remote_header("a.example", "AID").as_bytes());
    let wire = written(&out_handle);
    assert!(wire.contains("<db:verify"));
    assert!(wire.contains(&format!("id='{}'", in_stream_id)));
    assert!(wire.contains("PEERKEY"));

    // The authoritative server confirms; we admit the inbound stream.
    ctx.feed(
        sid_out,
        format!(
            "<db:verify from='a.example' to='local.example' id='{}' type='valid'/>",
            in_stream_id
        )
        .as_bytes(),
    );

    assert!(written(&in_handle).contains("type='valid'"));
    assert_eq!(ctx.in_stream("a.example"), Some(sid_in));

    // Verified traffic reaches the host listener.
    ctx.feed(
        sid_in,
        b"<message from='u@a.example' to='v@local.example' id='in1'><body>hi</body></message>",
    );
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id(), Some("in1"));
}

#[test]
fn inbound_dialback_invalid_verdict_closes_the_stream() {
    let (mut ctx, received, log) = context(false, b"receiver-secret");

    let (socket, in_handle) = StubSocket::new();
    let sid_in = ctx.accept(Box::new(socket));
    ctx.feed(sid_in, peer_header("a.example", LOCAL).as_bytes());
    ctx.request_features(sid_in);
    let in_stream_id = sent_stream_id(&in_handle);

    ctx.feed(
        sid_in,
        b"<db:result from='a.example' to='local.example'>FORGED</db:result>",
    );

    let sid_out = log.lock().unwrap()[0].session;
    ctx.session_connected(sid_out);
    ctx.feed(sid_out, remote_header("a.example", "AID").as_bytes());
    ctx.feed(
        sid_out,
        format!(
            "<db:verify from='a.example' to='local.example' id='{}' type='invalid'/>",
            in_stream_id
        )
        .as_bytes(),
    );

    assert!(written(&in_handle).contains("type='invalid'"));
    assert!(is_closed(&in_handle));
    assert_eq!(ctx.in_stream("a.example"), None);
    assert!(received.lock().unwrap().is_empty());
}

// ===========================================================================
// Authoritative dialback: answering db:verify
// ===========================================================================

#[test]
fn authoritative_check_suspends_until_online() {
    let secret = b"authoritative-secret";
    let (mut ctx, _, log) = context(false, secret);

    // Our own dialback towards b.example is still connecting.
    ctx.send(message("alice@local.example", "bob@b.example", "m1"));
    let (sid_out, _out_handle) = {
        let log = log.lock().unwrap();
        (log[0].session, Arc::clone(&log[0].handle))
    };

    // b.example reaches back over a fresh inbound stream and asks about a
    // key we have not even sent yet.
    let (socket, in_handle) = StubSocket::new();
    let sid_in = ctx.accept(Box::new(socket));
    ctx.feed(sid_in, peer_header("b.example", LOCAL).as_bytes());

    let key = DialbackKey::new(secret).generate(LOCAL, "b.example", "XYZ");
    ctx.feed(
        sid_in,
        format!(
            "<db:verify from='b.example' to='local.example' id='XYZ'>{}</db:verify>",
            key
        )
        .as_bytes(),
    );

    // No spurious verdict while the outgoing session handshakes.
    assert!(!written(&in_handle).contains("type="));

    // The outgoing stream completes and goes online; the suspended check
    // re-runs and the verdict is valid.
    ctx.session_connected(sid_out);
    ctx.feed(sid_out, remote_header("b.example", "XYZ").as_bytes());
    ctx.feed(sid_out, b"<stream:features/>");
    ctx.feed(
        sid_out,
        b"<db:result from='b.example' to='local.example' type='valid'/>",
    );

    let wire = written(&in_handle);
    assert!(wire.contains("<db:verify"));
    assert!(wire.contains("id='XYZ'"));
    assert!(wire.contains("type='valid'"));
}

#[test]
fn authoritative_check_fails_when_the_session_closes() {
    let (mut ctx, _, log) = context(false, b"authoritative-secret");

    ctx.send(message("alice@local.example", "bob@b.example", "m1"));
    let sid_out = log.lock().unwrap()[0].session;

    let (socket, in_handle) = StubSocket::new();
    let sid_in = ctx.accept(Box::new(socket));
    ctx.feed(sid_in, peer_header("b.example", LOCAL).as_bytes());
    ctx.feed(
        sid_in,
        b"<db:verify from='b.example' to='local.example' id='XYZ'>whatever</db:verify>",
    );
    assert!(!written(&in_handle).contains("type="));

    // The outgoing transport dies before verification.
    ctx.session_closed(sid_out);

    assert!(written(&in_handle).contains("type='invalid'"));
}

#[test]
fn authoritative_check_without_session_is_invalid() {
    let (mut ctx, _, _) = context(false, b"authoritative-secret");

    let (socket, in_handle) = StubSocket::new();
    let sid_in = ctx.accept(Box::new(socket));
    ctx.feed(sid_in, peer_header("b.example", LOCAL).as_bytes());
    ctx.feed(
        sid_in,
        b"<db:verify from='b.example' to='local.example' id='XYZ'>whatever</db:verify>",
    );

    assert!(written(&in_handle).contains("type='invalid'"));
}

#[test]
fn mismatched_key_is_invalid() {
    let (mut ctx, _, log) = context(false, b"authoritative-secret");

    ctx.send(message("alice@local.example", "bob@b.example", "m1"));
    let sid_out = log.lock().unwrap()[0].session;
    ctx.session_connected(sid_out);
    ctx.feed(sid_out, remote_header("b.example", "XYZ").as_bytes());
    ctx.feed(sid_out, b"<stream:features/>");
    ctx.feed(
        sid_out,
        b"<db:result from='b.example' to='local.example' type='valid'/>",
    );

    let (socket, in_handle) = StubSocket::new();
    let sid_in = ctx.accept(Box::new(socket));
    ctx.feed(sid_in, peer_header("b.example", LOCAL).as_bytes());
    ctx.feed(
        sid_in,
        b"<db:verify from='b.example' to='local.example' id='XYZ'>not-the-key</db:verify>",
    );

    assert!(written(&in_handle).contains("type='invalid'"));
}

// ===========================================================================
// Inbound filtering and uniqueness
// ===========================================================================

#[test]
fn spoofed_from_domain_is_rejected_with_invalid_from() {
    let (mut ctx, received, _) = context(false, b"secret");

    let (socket, handle) = StubSocket::new();
    let sid = ctx.accept(Box::new(socket));
    ctx.feed(sid, peer_header("peer.example", LOCAL).as_bytes());
    ctx.add_in_stream("peer.example", sid);

    ctx.feed(
        sid,
        b"<message from='mallory@evil.example' to='v@local.example' id='x'/>",
    );

    assert!(written(&handle).contains("<invalid-from"));
    assert!(is_closed(&handle));
    assert_eq!(ctx.in_stream("peer.example"), None);
    assert!(received.lock().unwrap().is_empty());
}

#[test]
fn stanza_addressed_past_us_is_improper() {
    let (mut ctx, received, _) = context(false, b"secret");

    let (socket, handle) = StubSocket::new();
    let sid = ctx.accept(Box::new(socket));
    ctx.feed(sid, peer_header("peer.example", LOCAL).as_bytes());
    ctx.add_in_stream("peer.example", sid);

    ctx.feed(
        sid,
        b"<message from='u@peer.example' to='v@elsewhere.example' id='x'/>",
    );

    assert!(written(&handle).contains("<improper-addressing"));
    assert!(is_closed(&handle));
    assert!(received.lock().unwrap().is_empty());
}

#[test]
fn stanza_without_addressing_is_improper() {
    let (mut ctx, received, _) = context(false, b"secret");

    let (socket, handle) = StubSocket::new();
    let sid = ctx.accept(Box::new(socket));
    ctx.feed(sid, peer_header("peer.example", LOCAL).as_bytes());
    ctx.add_in_stream("peer.example", sid);

    ctx.feed(sid, b"<message id='x'><body>lost</body></message>");

    assert!(written(&handle).contains("<improper-addressing"));
    assert!(received.lock().unwrap().is_empty());
}

#[test]
fn stanza_before_authentication_is_not_authorized() {
    let (mut ctx, received, _) = context(false, b"secret");

    let (socket, handle) = StubSocket::new();
    let sid = ctx.accept(Box::new(socket));
    ctx.feed(sid, peer_header("peer.example", LOCAL).as_bytes());

    ctx.feed(sid, b"<message from='u@peer.example' to='v@local.example' id='x'/>");

    assert!(written(&handle).contains("<not-authorized"));
    assert!(is_closed(&handle));
    assert!(received.lock().unwrap().is_empty());
}

#[test]
fn second_verified_stream_conflicts_the_first() {
    let (mut ctx, _, _) = context(false, b"secret");

    let (first, first_handle) = StubSocket::new();
    let sid1 = ctx.accept(Box::new(first));
    ctx.feed(sid1, peer_header("peer.example", LOCAL).as_bytes());
    ctx.add_in_stream("peer.example", sid1);
    assert_eq!(ctx.in_stream("peer.example"), Some(sid1));

    let (second, second_handle) = StubSocket::new();
    let sid2 = ctx.accept(Box::new(second));
    ctx.feed(sid2, peer_header("peer.example", LOCAL).as_bytes());
    ctx.add_in_stream("peer.example", sid2);

    assert!(written(&first_handle).contains("<conflict"));
    assert!(is_closed(&first_handle));
    assert_eq!(ctx.in_stream("peer.example"), Some(sid2));
    assert!(!is_closed(&second_handle));
}

// ===========================================================================
// Incoming SASL EXTERNAL through the context
// ===========================================================================

#[test]
fn incoming_external_authenticates_and_admits_the_stream() {
    let (mut ctx, received, _) = context(true, b"secret");

    let cert = PeerCertificate {
        subject_cn: None,
        san_dns: vec!["peer.example".to_string()],
    };
    let (socket, handle) = StubSocket::secure(true, "peer.example", Some(cert));
    let sid = ctx.accept(Box::new(socket));

    ctx.feed(sid, peer_header("peer.example", LOCAL).as_bytes());
    ctx.request_features(sid);
    assert!(written(&handle).contains("<mechanism>EXTERNAL</mechanism>"));

    ctx.feed(sid, EXTERNAL_AUTH.as_bytes());

    // Success precedes the restart; the stream is admitted for the peer.
    let wire = written(&handle);
    assert!(wire.contains("<success"));
    assert_eq!(ctx.in_stream("peer.example"), Some(sid));

    // The peer restarts its stream and gets empty features back.
    ctx.feed(sid, peer_header("peer.example", LOCAL).as_bytes());
    let frames = write_frames(&handle);
    assert_eq!(frames.last().unwrap(), "<stream:features/>");

    // Stanzas now reach the listener.
    ctx.feed(
        sid,
        b"<message from='u@peer.example' to='v@local.example' id='ok'/>",
    );
    assert_eq!(received.lock().unwrap().len(), 1);
}

// ===========================================================================
// Context shutdown
// ===========================================================================

#[test]
fn end_terminates_every_session() {
    let (mut ctx, _, log) = context(false, b"secret");

    ctx.send(message("alice@local.example", "bob@far.example", "m1"));
    let (socket, in_handle) = StubSocket::new();
    let sid = ctx.accept(Box::new(socket));
    ctx.feed(sid, peer_header("peer.example", LOCAL).as_bytes());
    ctx.add_in_stream("peer.example", sid);

    ctx.end();

    assert!(is_closed(&in_handle));
    assert!(is_closed(&log.lock().unwrap()[0].handle));
    assert_eq!(ctx.inbound_count(), 0);
    assert_eq!(ctx.outbound_count(), 0);
}
