//! Stream-level frame codec for `jabber:server` streams.
//!
//! XMPP uses one long-lived XML document per stream direction, so decoding
//! has to be incremental: bytes arrive in arbitrary chunks and frames are
//! surfaced as soon as they are complete. The reader below scans the raw
//! buffer for complete top-level elements and only hands payload stanzas to
//! a full XML parser, which keeps the hot path allocation-light and keeps
//! the stream header (intentionally unclosed XML) out of the tree parser.

use minidom::Element;

use crate::error::{FederationError, StreamErrorCondition};
use crate::stanza::Stanza;

/// Namespace URIs used on federation streams.
pub mod ns {
    /// XMPP server-to-server namespace
    pub const JABBER_SERVER: &str = "jabber:server";
    /// XMPP streams namespace
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    /// STARTTLS namespace
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    /// SASL namespace
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    /// Stanza error namespace
    pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
    /// Stream error namespace
    pub const STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
    /// Server Dialback namespace (XEP-0220)
    pub const DIALBACK: &str = "jabber:server:dialback";
}

/// Closing tag of the stream document.
pub const STREAM_CLOSE: &str = "</stream:stream>";

/// Parsed attributes of a peer's `<stream:stream>` header.
#[derive(Debug, Clone, Default)]
pub struct StreamHeader {
    /// The `to` attribute (target domain)
    pub to: Option<String>,
    /// The `from` attribute (source domain)
    pub from: Option<String>,
    /// The `id` attribute (stream ID, chosen by the receiving side)
    pub id: Option<String>,
    /// The `version` attribute
    pub version: Option<String>,
}

impl StreamHeader {
    /// Parse a header from the raw opening tag.
    ///
    /// The tag is intentionally unclosed XML, so attributes are extracted
    /// from the raw text rather than through the tree parser.
    fn from_tag(tag: &str) -> Self {
        Self {
            to: extract_attribute(tag, "to"),
            from: extract_attribute(tag, "from"),
            id: extract_attribute(tag, "id"),
            version: extract_attribute(tag, "version"),
        }
    }
}

/// Features advertised in a `<stream:features>` element.
#[derive(Debug, Clone, Default)]
pub struct StreamFeatures {
    /// STARTTLS offered
    pub starttls: bool,
    /// SASL mechanisms offered
    pub mechanisms: Vec<String>,
    /// Server Dialback errors supported
    pub dialback: bool,
}

impl StreamFeatures {
    /// Whether SASL EXTERNAL is among the advertised mechanisms.
    pub fn offers_external(&self) -> bool {
        self.mechanisms.iter().any(|m| m == "EXTERNAL")
    }
}

/// A decoded stream-level frame.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Opening `<stream:stream>` header
    StreamStart(StreamHeader),
    /// Closing `</stream:stream>` tag
    StreamEnd,
    /// `<stream:error>` from the peer
    StreamError {
        /// Defined-condition element name
        condition: String,
    },
    /// `<stream:features>` advertisement
    Features(StreamFeatures),
    /// `<starttls/>` request
    StartTls,
    /// `<proceed/>` answer to STARTTLS
    TlsProceed,
    /// `<failure/>` answer to STARTTLS
    TlsFailure,
    /// SASL `<auth>` request
    SaslAuth {
        /// The `mechanism` attribute, if present
        mechanism: Option<String>,
        /// Base64 payload text
        payload: String,
    },
    /// SASL `<success/>`
    SaslSuccess,
    /// SASL `<failure>` with its condition
    SaslFailure {
        /// Defined-condition element name
        condition: String,
    },
    /// `<db:result>` — a dialback request (no `type`) or answer (`type` set)
    DialbackResult {
        /// Originating domain
        from: String,
        /// Receiving domain
        to: String,
        /// `valid` / `invalid` on answers, absent on requests
        result_type: Option<String>,
        /// The dialback key on requests
        key: Option<String>,
    },
    /// `<db:verify>` — an authoritative check request or its answer
    DialbackVerify {
        /// Requesting domain
        from: String,
        /// Authoritative domain
        to: String,
        /// Stream ID under verification
        id: String,
        /// `valid` / `invalid` on answers, absent on requests
        verify_type: Option<String>,
        /// The dialback key on requests
        key: Option<String>,
    },
    /// Any other top-level element, surfaced as an opaque stanza
    Stanza(Stanza),
}

/// Incremental decoder turning fed bytes into [`Frame`]s.
pub struct FrameReader {
    buffer: Vec<u8>,
    header_seen: bool,
}

impl FrameReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(8192),
            header_seen: false,
        }
    }

    /// Feed raw bytes into the reader.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Clear all state; used on stream restarts (post-STARTTLS, post-SASL).
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.header_seen = false;
    }

    /// Decode the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FederationError> {
        let text = String::from_utf8_lossy(&self.buffer).to_string();

        if !self.header_seen {
            return self.take_stream_header(&text);
        }

        let offset = match text.find(|c: char| !c.is_whitespace()) {
            Some(i) => i,
            None => return Ok(None),
        };
        let rest = &text[offset..];

        if !rest.starts_with('<') {
            return Err(FederationError::xml_parse("text at stream level"));
        }

        if rest.starts_with("</stream:stream") {
            match rest.find('>') {
                Some(end) => {
                    self.consume(offset + end + 1);
                    return Ok(Some(Frame::StreamEnd));
                }
                None => return Ok(None),
            }
        }

        let name = match element_name(rest) {
            Some(name) => name.to_string(),
            None => return Ok(None),
        };
        let end = match find_element_end(rest, &name) {
            Some(end) => end,
            None => return Ok(None),
        };
        let element = rest[..end].to_string();
        self.consume(offset + end);

        decode_element(&name, &element).map(Some)
    }

    fn take_stream_header(&mut self, text: &str) -> Result<Option<Frame>, FederationError> {
        let start = match text.find("<stream:stream") {
            Some(start) => start,
            None => {
                // Nothing but the XML declaration or a partial tag so far.
                if self.buffer.len() > 16 * 1024 {
                    return Err(FederationError::xml_parse("no stream header"));
                }
                return Ok(None);
            }
        };
        let end = match text[start..].find('>') {
            Some(end) => start + end,
            None => return Ok(None),
        };

        let header = StreamHeader::from_tag(&text[start..=end]);
        self.consume(end + 1);
        self.header_seen = true;
        Ok(Some(Frame::StreamStart(header)))
    }

    fn consume(&mut self, bytes: usize) {
        self.buffer.drain(..bytes);
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode one complete top-level element into a frame.
fn decode_element(name: &str, element: &str) -> Result<Frame, FederationError> {
    match name {
        "stream:features" => Ok(Frame::Features(parse_features(element))),
        "stream:error" => Ok(Frame::StreamError {
            condition: first_child_name(element).unwrap_or_else(|| "undefined-condition".into()),
        }),
        "starttls" => Ok(Frame::StartTls),
        "proceed" => Ok(Frame::TlsProceed),
        "auth" => Ok(Frame::SaslAuth {
            mechanism: extract_attribute(element, "mechanism"),
            payload: text_content(element),
        }),
        "success" => Ok(Frame::SaslSuccess),
        "failure" => {
            if element.contains(ns::TLS) {
                Ok(Frame::TlsFailure)
            } else {
                Ok(Frame::SaslFailure {
                    condition: first_child_name(element)
                        .unwrap_or_else(|| "not-authorized".into()),
                })
            }
        }
        "db:result" => {
            let from = require_attribute(element, "from")?;
            let to = require_attribute(element, "to")?;
            let result_type = extract_attribute(element, "type");
            let key = non_empty(text_content(element));
            Ok(Frame::DialbackResult {
                from,
                to,
                result_type,
                key,
            })
        }
        "db:verify" => {
            let from = require_attribute(element, "from")?;
            let to = require_attribute(element, "to")?;
            let id = require_attribute(element, "id")?;
            let verify_type = extract_attribute(element, "type");
            let key = non_empty(text_content(element));
            Ok(Frame::DialbackVerify {
                from,
                to,
                id,
                verify_type,
                key,
            })
        }
        _ => {
            let xml = ensure_default_ns(element);
            let parsed = xml
                .parse::<Element>()
                .map_err(|e| FederationError::xml_parse(format!("bad element: {}", e)))?;
            Ok(Frame::Stanza(Stanza::from_element(parsed)))
        }
    }
}

/// Extract the element name right after the opening `<`.
fn element_name(s: &str) -> Option<&str> {
    let body = &s[1..];
    let end = body.find(|c: char| c.is_whitespace() || c == '>' || c == '/')?;
    if end == 0 {
        return None;
    }
    Some(&body[..end])
}

/// Find the byte offset one past the end of the element starting at 0.
///
/// Handles self-closing tags and a matching close tag. Nested same-name
/// elements do not occur at the stream level.
fn find_element_end(s: &str, name: &str) -> Option<usize> {
    let gt = s.find('>')?;
    if s.as_bytes()[gt - 1] == b'/' {
        return Some(gt + 1);
    }

    let close = format!("</{}", name);
    let close_start = s.find(&close)?;
    let close_end = s[close_start..].find('>')?;
    Some(close_start + close_end + 1)
}

/// Extract an attribute value from a raw tag, either quote style.
fn extract_attribute(tag: &str, name: &str) -> Option<String> {
    for quote in ['\'', '"'] {
        let pattern = format!("{}={}", name, quote);
        if let Some(start) = tag.find(&pattern) {
            let value_start = start + pattern.len();
            if let Some(value_end) = tag[value_start..].find(quote) {
                return Some(tag[value_start..value_start + value_end].to_string());
            }
        }
    }
    None
}

fn require_attribute(tag: &str, name: &str) -> Result<String, FederationError> {
    extract_attribute(tag, name)
        .ok_or_else(|| FederationError::xml_parse(format!("missing '{}' attribute", name)))
}

/// Text between the opening tag and the closing tag, trimmed.
fn text_content(element: &str) -> String {
    let start = match element.find('>') {
        Some(i) => i + 1,
        None => return String::new(),
    };
    let end = element.rfind("</").unwrap_or(element.len());
    if start >= end {
        return String::new();
    }
    element[start..end].trim().to_string()
}

/// Name of the first child element, if any.
fn first_child_name(element: &str) -> Option<String> {
    let start = element.find('>')? + 1;
    let rel = element[start..].find('<')?;
    element_name(&element[start + rel..]).map(|n| n.to_string())
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Inject the stream default namespace when the wire omitted it.
///
/// Stanzas inherit `jabber:server` from the stream root, but the tree
/// parser sees them detached and needs the declaration inline.
fn ensure_default_ns(element: &str) -> String {
    let gt = match element.find('>') {
        Some(i) => i,
        None => return element.to_string(),
    };
    if element[..gt].contains("xmlns=") {
        return element.to_string();
    }
    let insert_at = if element.as_bytes()[gt - 1] == b'/' {
        gt - 1
    } else {
        gt
    };
    let mut out = String::with_capacity(element.len() + 24);
    out.push_str(&element[..insert_at]);
    out.push_str(" xmlns='");
    out.push_str(ns::JABBER_SERVER);
    out.push('\'');
    out.push_str(&element[insert_at..]);
    out
}

fn parse_features(element: &str) -> StreamFeatures {
    let mut features = StreamFeatures {
        starttls: element.contains("<starttls"),
        mechanisms: Vec::new(),
        dialback: element.contains("<dialback"),
    };

    let mut rest = element;
    while let Some(start) = rest.find("<mechanism>") {
        let after = &rest[start + "<mechanism>".len()..];
        match after.find("</mechanism>") {
            Some(end) => {
                features.mechanisms.push(after[..end].trim().to_string());
                rest = &after[end..];
            }
            None => break,
        }
    }

    features
}

// ---------------------------------------------------------------------------
// Frame builders
// ---------------------------------------------------------------------------

/// Build a stream header for the `jabber:server` namespace.
///
/// `id` is set by the receiving side of a stream; initiators leave it out.
pub fn stream_header(from: &str, to: Option<&str>, id: Option<&str>) -> String {
    let mut header = String::from(
        "<?xml version='1.0'?>\
         <stream:stream xmlns='jabber:server' \
         xmlns:stream='http://etherx.jabber.org/streams' \
         xmlns:db='jabber:server:dialback'",
    );
    header.push_str(&format!(" from='{}'", from));
    if let Some(to) = to {
        header.push_str(&format!(" to='{}'", to));
    }
    if let Some(id) = id {
        header.push_str(&format!(" id='{}'", id));
    }
    header.push_str(" version='1.0'>");
    header
}

/// Build a `<stream:features>` element advertising the given SASL
/// mechanisms. An empty list produces the bare self-closing element,
/// which tells the peer to proceed with dialback.
pub fn stream_features(mechanisms: &[&str]) -> String {
    if mechanisms.is_empty() {
        return "<stream:features/>".to_string();
    }
    let mut features = format!(
        "<stream:features><mechanisms xmlns='{}'>",
        ns::SASL
    );
    for mechanism in mechanisms {
        features.push_str(&format!("<mechanism>{}</mechanism>", mechanism));
    }
    features.push_str("</mechanisms></stream:features>");
    features
}

/// Build a `<starttls/>` request.
pub fn starttls() -> String {
    format!("<starttls xmlns='{}'/>", ns::TLS)
}

/// Build a `<proceed/>` answer to STARTTLS.
pub fn proceed() -> String {
    format!("<proceed xmlns='{}'/>", ns::TLS)
}

/// Build a STARTTLS `<failure/>`.
pub fn tls_failure() -> String {
    format!("<failure xmlns='{}'/>", ns::TLS)
}

/// Build a SASL `<auth>` request with a base64 payload.
pub fn sasl_auth(mechanism: &str, payload: &str) -> String {
    format!(
        "<auth xmlns='{}' mechanism='{}'>{}</auth>",
        ns::SASL,
        mechanism,
        payload
    )
}

/// Build a SASL `<success/>`.
pub fn sasl_success() -> String {
    format!("<success xmlns='{}'/>", ns::SASL)
}

/// Build a SASL `<failure>` carrying `<not-authorized/>`.
pub fn sasl_failure_not_authorized() -> String {
    format!("<failure xmlns='{}'><not-authorized/></failure>", ns::SASL)
}

/// Build a `<stream:error>` element for the given condition.
///
/// Stream errors are fatal; callers follow up with [`STREAM_CLOSE`] and a
/// transport close without awaiting an acknowledgment.
pub fn stream_error(condition: StreamErrorCondition) -> String {
    format!(
        "<stream:error><{} xmlns='{}'/></stream:error>",
        condition.as_str(),
        ns::STREAMS
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_header_roundtrip() {
        let mut reader = FrameReader::new();
        reader.feed(
            b"<?xml version='1.0'?><stream:stream xmlns='jabber:server' \
              xmlns:stream='http://etherx.jabber.org/streams' \
              to='b.example' from='a.example' version='1.0'>",
        );

        match reader.next_frame().unwrap() {
            Some(Frame::StreamStart(header)) => {
                assert_eq!(header.to.as_deref(), Some("b.example"));
                assert_eq!(header.from.as_deref(), Some("a.example"));
                assert_eq!(header.version.as_deref(), Some("1.0"));
                assert!(header.id.is_none());
            }
            other => panic!("expected StreamStart, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_header_waits() {
        let mut reader = FrameReader::new();
        reader.feed(b"<?xml version='1.0'?><stream:stream xmlns='jab");
        assert!(matches!(reader.next_frame().unwrap(), None));

        reader.feed(b"ber:server' from='a.example' version='1.0'>");
        assert!(matches!(
            reader.next_frame().unwrap(),
            Some(Frame::StreamStart(_))
        ));
    }

    fn reader_with_header() -> FrameReader {
        let mut reader = FrameReader::new();
        reader.feed(b"<stream:stream xmlns='jabber:server' from='a.example' version='1.0'>");
        assert!(matches!(
            reader.next_frame().unwrap(),
            Some(Frame::StreamStart(_))
        ));
        reader
    }

    #[test]
    fn test_starttls_frames() {
        let mut reader = reader_with_header();
        reader.feed(b"<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
        assert!(matches!(reader.next_frame().unwrap(), Some(Frame::StartTls)));

        reader.feed(b"<proceed xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>");
        assert!(matches!(
            reader.next_frame().unwrap(),
            Some(Frame::TlsProceed)
        ));
    }

    #[test]
    fn test_features_with_external() {
        let mut reader = reader_with_header();
        reader.feed(
            b"<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
              <mechanism>EXTERNAL</mechanism></mechanisms></stream:features>",
        );

        match reader.next_frame().unwrap() {
            Some(Frame::Features(features)) => {
                assert!(features.offers_external());
                assert!(!features.starttls);
            }
            other => panic!("expected Features, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_features() {
        let mut reader = reader_with_header();
        reader.feed(b"<stream:features/>");

        match reader.next_frame().unwrap() {
            Some(Frame::Features(features)) => {
                assert!(!features.starttls);
                assert!(features.mechanisms.is_empty());
            }
            other => panic!("expected Features, got {:?}", other),
        }
    }

    #[test]
    fn test_sasl_auth_frame() {
        let mut reader = reader_with_header();
        reader.feed(
            b"<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='EXTERNAL'>YS5leGFtcGxl</auth>",
        );

        match reader.next_frame().unwrap() {
            Some(Frame::SaslAuth { mechanism, payload }) => {
                assert_eq!(mechanism.as_deref(), Some("EXTERNAL"));
                assert_eq!(payload, "YS5leGFtcGxl");
            }
            other => panic!("expected SaslAuth, got {:?}", other),
        }
    }

    #[test]
    fn test_dialback_result_request() {
        let mut reader = reader_with_header();
        reader.feed(b"<db:result from='a.example' to='b.example'>somekey</db:result>");

        match reader.next_frame().unwrap() {
            Some(Frame::DialbackResult {
                from,
                to,
                result_type,
                key,
            }) => {
                assert_eq!(from, "a.example");
                assert_eq!(to, "b.example");
                assert!(result_type.is_none());
                assert_eq!(key.as_deref(), Some("somekey"));
            }
            other => panic!("expected DialbackResult, got {:?}", other),
        }
    }

    #[test]
    fn test_dialback_verify_answer() {
        let mut reader = reader_with_header();
        reader.feed(
            b"<db:verify from='a.example' to='b.example' id='s1' type='valid'/>",
        );

        match reader.next_frame().unwrap() {
            Some(Frame::DialbackVerify {
                id, verify_type, ..
            }) => {
                assert_eq!(id, "s1");
                assert_eq!(verify_type.as_deref(), Some("valid"));
            }
            other => panic!("expected DialbackVerify, got {:?}", other),
        }
    }

    #[test]
    fn test_stanza_without_namespace_gets_default() {
        let mut reader = reader_with_header();
        reader.feed(b"<message from='u@a.example' to='v@b.example'><body>hi</body></message>");

        match reader.next_frame().unwrap() {
            Some(Frame::Stanza(stanza)) => {
                assert_eq!(stanza.name(), "message");
                assert_eq!(stanza.from(), Some("u@a.example"));
            }
            other => panic!("expected Stanza, got {:?}", other),
        }
    }

    #[test]
    fn test_split_stanza_across_feeds() {
        let mut reader = reader_with_header();
        reader.feed(b"<message from='u@a.example' to='v@b.");
        assert!(matches!(reader.next_frame().unwrap(), None));
        reader.feed(b"example'><body>hi</body></message>");
        assert!(matches!(
            reader.next_frame().unwrap(),
            Some(Frame::Stanza(_))
        ));
    }

    #[test]
    fn test_stream_end() {
        let mut reader = reader_with_header();
        reader.feed(b"</stream:stream>");
        assert!(matches!(
            reader.next_frame().unwrap(),
            Some(Frame::StreamEnd)
        ));
    }

    #[test]
    fn test_stream_error_condition() {
        let mut reader = reader_with_header();
        reader.feed(
            b"<stream:error><conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/></stream:error>",
        );

        match reader.next_frame().unwrap() {
            Some(Frame::StreamError { condition }) => assert_eq!(condition, "conflict"),
            other => panic!("expected StreamError, got {:?}", other),
        }
    }

    #[test]
    fn test_reset_awaits_new_header() {
        let mut reader = reader_with_header();
        reader.reset();
        reader.feed(b"<stream:features/>");
        // No header yet after the reset, so nothing is decoded.
        assert!(matches!(reader.next_frame().unwrap(), None));
    }

    #[test]
    fn test_builders() {
        let header = stream_header("a.example", Some("b.example"), Some("sid-1"));
        assert!(header.contains("from='a.example'"));
        assert!(header.contains("to='b.example'"));
        assert!(header.contains("id='sid-1'"));
        assert!(header.contains("xmlns:db='jabber:server:dialback'"));

        assert_eq!(stream_features(&[]), "<stream:features/>");
        assert_eq!(
            stream_features(&["EXTERNAL"]),
            "<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
             <mechanism>EXTERNAL</mechanism></mechanisms></stream:features>"
        );

        assert!(sasl_failure_not_authorized().contains("<not-authorized/>"));
        assert!(stream_error(StreamErrorCondition::Conflict).contains("<conflict"));
    }
}
