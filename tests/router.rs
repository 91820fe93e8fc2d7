//! Router demultiplexing tests.
//!
//! The router holds freshly accepted transports until the stream header's
//! `to` attribute names a hosted domain, then hands them to that domain's
//! context; streams for unhosted domains are refused with `host-unknown`.
//!
//! Run with: `cargo test --test router`

mod common;

use common::{init_tracing, is_closed, written, StubConnector, StubSocket};
use plover_xmpp::{ContextConfig, DomainContext, Router, Stanza};

fn two_domain_router() -> Router {
    init_tracing();
    let mut router = Router::new();
    for domain in ["a.example", "b.example"] {
        let (connector, _) = StubConnector::new();
        let ctx =
            DomainContext::new(domain, ContextConfig::default(), Box::new(connector)).unwrap();
        router.add_domain(ctx);
    }
    router
}

fn header(from: &str, to: &str) -> String {
    format!(
        "<stream:stream xmlns='jabber:server' \
         xmlns:stream='http://etherx.jabber.org/streams' \
         xmlns:db='jabber:server:dialback' \
         from='{}' to='{}' version='1.0'>",
        from, to
    )
}

#[test]
fn header_to_attribute_picks_the_context() {
    let mut router = two_domain_router();

    let (socket, handle) = StubSocket::new();
    let sid = router.accept(Box::new(socket));
    // Nothing is written while the session is unattached.
    assert!(handle.lock().unwrap().writes.is_empty());

    router.feed(sid, header("peer.example", "b.example").as_bytes());

    assert!(router.context("b.example").unwrap().owns(sid));
    assert!(!router.context("a.example").unwrap().owns(sid));

    // The adopting context answered the header and advertised features.
    let wire = written(&handle);
    assert!(wire.contains("from='b.example'"));
    assert!(wire.contains("<stream:features/>"));
}

#[test]
fn split_header_waits_for_more_bytes() {
    let mut router = two_domain_router();

    let (socket, handle) = StubSocket::new();
    let sid = router.accept(Box::new(socket));

    let header = header("peer.example", "a.example");
    let (left, right) = header.split_at(40);
    router.feed(sid, left.as_bytes());
    assert!(handle.lock().unwrap().writes.is_empty());

    router.feed(sid, right.as_bytes());
    assert!(router.context("a.example").unwrap().owns(sid));
}

#[test]
fn unhosted_domain_is_refused() {
    let mut router = two_domain_router();

    let (socket, handle) = StubSocket::new();
    let sid = router.accept(Box::new(socket));
    router.feed(sid, header("peer.example", "nowhere.example").as_bytes());

    let wire = written(&handle);
    assert!(wire.contains("<host-unknown"));
    assert!(wire.ends_with("</stream:stream>"));
    assert!(is_closed(&handle));
    assert!(!router.context("a.example").unwrap().owns(sid));
    assert!(!router.context("b.example").unwrap().owns(sid));
}

#[test]
fn header_without_to_is_improper() {
    let mut router = two_domain_router();

    let (socket, handle) = StubSocket::new();
    let sid = router.accept(Box::new(socket));
    router.feed(
        sid,
        b"<stream:stream xmlns='jabber:server' from='peer.example' version='1.0'>",
    );

    assert!(written(&handle).contains("<improper-addressing"));
    assert!(is_closed(&handle));
}

#[test]
fn outbound_stanzas_route_by_origin_domain() {
    let mut router = two_domain_router();

    let stanza = Stanza::parse(
        "<message xmlns='jabber:server' from='alice@a.example' to='bob@far.example' id='r1'/>",
    )
    .unwrap();
    assert!(router.send(stanza).is_ok());

    // One outgoing session now exists in a.example's context.
    assert_eq!(router.context("a.example").unwrap().outbound_count(), 1);
    assert_eq!(router.context("b.example").unwrap().outbound_count(), 0);
}

#[test]
fn stanzas_from_unhosted_domains_are_errors() {
    let mut router = two_domain_router();

    let stanza = Stanza::parse(
        "<message xmlns='jabber:server' from='alice@elsewhere.example' to='bob@far.example'/>",
    )
    .unwrap();
    assert!(router.send(stanza).is_err());

    let unaddressed = Stanza::parse("<message xmlns='jabber:server' to='bob@far.example'/>")
        .unwrap();
    assert!(router.send(unaddressed).is_err());
}

#[test]
fn closing_a_pending_transport_forgets_it() {
    let mut router = two_domain_router();

    let (socket, _handle) = StubSocket::new();
    let sid = router.accept(Box::new(socket));
    router.closed(sid);

    // Late bytes for the dead session are ignored.
    router.feed(sid, header("peer.example", "a.example").as_bytes());
    assert!(!router.context("a.example").unwrap().owns(sid));
}

#[test]
fn end_closes_pending_transports() {
    let mut router = two_domain_router();

    let (socket, handle) = StubSocket::new();
    let _sid = router.accept(Box::new(socket));
    router.end();

    assert!(is_closed(&handle));
}
