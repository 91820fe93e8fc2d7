//! Error types for the federation core.

use thiserror::Error;

/// Errors produced by the federation core and its transport adapter.
#[derive(Debug, Error)]
pub enum FederationError {
    /// IO error (network)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// XML parsing error
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Stream-level protocol error
    #[error("stream error: {0}")]
    Stream(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// The session is not connected
    #[error("session is not connected")]
    NotConnected,

    /// DNS resolution error
    #[error("DNS error: {0}")]
    Dns(#[from] crate::net::dns::DnsError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl FederationError {
    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    /// Create a new TLS error.
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a new stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Create a new authentication error.
    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::AuthFailed(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Stream error conditions used by the S2S core (RFC 6120 Section 4.9.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCondition {
    /// Another verified stream for the same peer domain replaced this one
    Conflict,
    /// The stream `to` attribute names a domain we do not host
    HostUnknown,
    /// A stanza lacked addressing or was addressed past this server
    ImproperAddressing,
    /// A stanza claimed a `from` outside the authenticated peer domain
    InvalidFrom,
    /// The peer acted before authenticating
    NotAuthorized,
    /// The inbound byte stream was not well-formed XML
    NotWellFormed,
    /// An outgoing federation connection could not be established
    RemoteConnectionFailed,
    /// Catch-all for conditions with no closer match
    UndefinedCondition,
}

impl StreamErrorCondition {
    /// Get the defined-condition element name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::HostUnknown => "host-unknown",
            Self::ImproperAddressing => "improper-addressing",
            Self::InvalidFrom => "invalid-from",
            Self::NotAuthorized => "not-authorized",
            Self::NotWellFormed => "not-well-formed",
            Self::RemoteConnectionFailed => "remote-connection-failed",
            Self::UndefinedCondition => "undefined-condition",
        }
    }
}

impl std::fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Stanza error conditions the core synthesizes for bounces
/// (RFC 6120 Section 8.3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    /// The stanza had no routable destination
    JidMalformed,
    /// The destination domain could not be reached
    RemoteServerNotFound,
}

impl StanzaErrorCondition {
    /// Get the defined-condition element name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JidMalformed => "jid-malformed",
            Self::RemoteServerNotFound => "remote-server-not-found",
        }
    }

    /// Get the `type` attribute of the wrapping `<error/>` element.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::JidMalformed => "modify",
            Self::RemoteServerNotFound => "cancel",
        }
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_conditions() {
        assert_eq!(StreamErrorCondition::Conflict.as_str(), "conflict");
        assert_eq!(StreamErrorCondition::InvalidFrom.as_str(), "invalid-from");
        assert_eq!(
            StreamErrorCondition::ImproperAddressing.as_str(),
            "improper-addressing"
        );
    }

    #[test]
    fn test_stanza_error_conditions() {
        assert_eq!(StanzaErrorCondition::JidMalformed.as_str(), "jid-malformed");
        assert_eq!(StanzaErrorCondition::JidMalformed.error_type(), "modify");
        assert_eq!(
            StanzaErrorCondition::RemoteServerNotFound.as_str(),
            "remote-server-not-found"
        );
        assert_eq!(
            StanzaErrorCondition::RemoteServerNotFound.error_type(),
            "cancel"
        );
    }

    #[test]
    fn test_error_display() {
        let err = FederationError::NotConnected;
        assert_eq!(err.to_string(), "session is not connected");

        let err = FederationError::stream("header missing");
        assert!(err.to_string().contains("header missing"));
    }
}
