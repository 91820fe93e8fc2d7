//! TLS peer-certificate identity checking for SASL EXTERNAL.
//!
//! Implements the RFC 6125 server-identity rules the federation core needs:
//! subjectAltName DNS entries are authoritative when present, the subject CN
//! is only consulted for legacy certificates without SANs, and wildcards
//! match exactly one label.

/// Identity material extracted from a peer certificate.
///
/// The transport adapter fills this in; the core never touches raw DER.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerCertificate {
    /// Subject common name, if the certificate carries one.
    pub subject_cn: Option<String>,
    /// DNS entries from the subjectAltName extension.
    pub san_dns: Vec<String>,
}

impl PeerCertificate {
    /// Whether the certificate carries no identity material at all.
    ///
    /// An empty certificate on an established TLS session means the peer
    /// did not present one; the incoming session reacts by renegotiating
    /// with a certificate request.
    pub fn is_empty(&self) -> bool {
        self.subject_cn.is_none() && self.san_dns.is_empty()
    }
}

/// Check whether a certificate is valid for the given host name.
///
/// SAN DNS entries supersede the CN: a certificate that carries SANs is
/// matched against those alone, even when the CN would have matched.
pub fn matches_identity(cert: &PeerCertificate, name: &str) -> bool {
    if !cert.san_dns.is_empty() {
        return cert.san_dns.iter().any(|san| hostname_matches(san, name));
    }
    cert.subject_cn
        .as_deref()
        .is_some_and(|cn| hostname_matches(cn, name))
}

/// Match one certificate name pattern against a host name.
///
/// A leading `*.` wildcard stands in for exactly one label; it never
/// matches the bare parent domain or more than one label.
fn hostname_matches(pattern: &str, name: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let name = name.to_ascii_lowercase();

    match pattern.strip_prefix("*.") {
        Some(parent) => match name.split_once('.') {
            Some((first_label, rest)) => !first_label.is_empty() && rest == parent,
            None => false,
        },
        None => pattern == name,
    }
}
