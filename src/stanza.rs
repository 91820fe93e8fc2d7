//! Routable stanza wrapper.
//!
//! The federation core treats stanzas opaquely: it looks at the element
//! name and the `from`/`to`/`type`/`id` attributes and forwards everything
//! else untouched. Payloads are held as `minidom::Element` trees.

use minidom::Element;

use crate::error::{FederationError, StanzaErrorCondition};
use crate::frame::ns;

/// A top-level routable XMPP element.
#[derive(Debug, Clone)]
pub struct Stanza {
    element: Element,
}

impl Stanza {
    /// Wrap an already-parsed element.
    pub fn from_element(element: Element) -> Self {
        Self { element }
    }

    /// Parse a stanza from its XML form.
    pub fn parse(xml: &str) -> Result<Self, FederationError> {
        let element = xml
            .parse::<Element>()
            .map_err(|e| FederationError::xml_parse(format!("bad stanza: {}", e)))?;
        Ok(Self { element })
    }

    /// The element name (`message`, `presence`, `iq`, ...).
    pub fn name(&self) -> &str {
        self.element.name()
    }

    /// Whether this is one of the three routable stanza kinds.
    pub fn is_routable(&self) -> bool {
        matches!(self.name(), "message" | "presence" | "iq")
    }

    /// The `from` attribute.
    pub fn from(&self) -> Option<&str> {
        self.element.attr("from")
    }

    /// The `to` attribute.
    pub fn to(&self) -> Option<&str> {
        self.element.attr("to")
    }

    /// The `type` attribute.
    pub fn stanza_type(&self) -> Option<&str> {
        self.element.attr("type")
    }

    /// The `id` attribute.
    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    /// Nameprep-normalized domain of the `from` JID.
    pub fn from_domain(&self) -> Option<String> {
        self.from().and_then(|j| domain_of(j).ok())
    }

    /// Nameprep-normalized domain of the `to` JID.
    pub fn to_domain(&self) -> Option<String> {
        self.to().and_then(|j| domain_of(j).ok())
    }

    /// Borrow the underlying element.
    pub fn element(&self) -> &Element {
        &self.element
    }

    /// Serialize the stanza to its XML form.
    pub fn to_xml(&self) -> String {
        String::from(&self.element)
    }

    /// Rewrite this stanza into an error bounce addressed back at its
    /// originator: `type="error"`, `from`/`to` swapped, original `id` and
    /// children preserved, condition appended.
    ///
    /// Returns `None` for stanzas that are already errors; bouncing those
    /// would ping-pong between servers.
    pub fn error_bounce(&self, condition: StanzaErrorCondition) -> Option<Stanza> {
        if self.stanza_type() == Some("error") {
            return None;
        }

        let mut bounced = Element::bare(self.name().to_string(), ns::JABBER_SERVER);
        if let Some(from) = self.to() {
            bounced.set_attr("from", from);
        }
        if let Some(to) = self.from() {
            bounced.set_attr("to", to);
        }
        bounced.set_attr("type", "error");
        if let Some(id) = self.id() {
            bounced.set_attr("id", id);
        }
        for child in self.element.children() {
            bounced.append_child(child.clone());
        }

        let mut error = Element::bare("error", ns::JABBER_SERVER);
        error.set_attr("type", condition.error_type());
        error.append_child(Element::bare(condition.as_str(), ns::STANZAS));
        bounced.append_child(error);

        Some(Stanza { element: bounced })
    }
}

/// Nameprep-normalize a bare domain name.
pub fn normalize_domain(domain: &str) -> Result<String, FederationError> {
    domain_of(domain)
}

/// Extract the normalized domain from a JID string.
fn domain_of(jid: &str) -> Result<String, FederationError> {
    let jid = jid::Jid::new(jid)
        .map_err(|e| FederationError::xml_parse(format!("bad JID '{}': {}", jid, e)))?;
    Ok(jid.domain().as_str().to_string())
}
