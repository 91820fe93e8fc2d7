//! Server Dialback (XEP-0220) key derivation and element codec.
//!
//! Dialback proves that the initiator of a federation stream is authorized
//! to speak for its claimed domain without requiring PKI. The receiving
//! server hands the initiator's key back to the authoritative server over a
//! separate stream; only the server that minted the key can confirm it.
//!
//! Key derivation:
//!
//! ```text
//! key = hex( HMAC-SHA256( key  = hex(SHA256(secret)),
//!                         data = from ‖ ' ' ‖ to ‖ ' ' ‖ stream_id ) )
//! ```
//!
//! The secret is private to the generating server and scoped to the process;
//! it does not need to survive restarts because keys are only compared
//! against live outgoing streams.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::frame::ns;

type HmacSha256 = Hmac<Sha256>;

/// Verdict of a dialback verification, as carried in the `type` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Verification succeeded.
    Valid,
    /// Verification failed.
    Invalid,
}

impl Verdict {
    /// The XEP-0220 `type` attribute value.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Invalid => "invalid",
        }
    }

    /// Parse from a `type` attribute value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "valid" => Some(Self::Valid),
            "invalid" => Some(Self::Invalid),
            _ => None,
        }
    }

    /// Build a verdict from a boolean outcome.
    pub fn from_bool(valid: bool) -> Self {
        if valid {
            Self::Valid
        } else {
            Self::Invalid
        }
    }
}

/// Dialback key generator.
#[derive(Clone)]
pub struct DialbackKey {
    secret: Vec<u8>,
}

impl std::fmt::Debug for DialbackKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialbackKey")
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

impl DialbackKey {
    /// Create a key generator with the given secret.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Create a key generator with a fresh random per-process secret.
    pub fn random() -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        Self::new(secret)
    }

    /// Derive the dialback key for one (initiator, receiver, stream) triple.
    ///
    /// * `from` - the originating domain (the one being proven)
    /// * `to` - the receiving domain
    /// * `stream_id` - the stream ID assigned by the receiving server
    pub fn generate(&self, from: &str, to: &str, stream_id: &str) -> String {
        let hmac_key = hex::encode(Sha256::digest(&self.secret));
        let mut mac = HmacSha256::new_from_slice(hmac_key.as_bytes())
            .expect("HMAC can take key of any size");

        mac.update(from.as_bytes());
        mac.update(b" ");
        mac.update(to.as_bytes());
        mac.update(b" ");
        mac.update(stream_id.as_bytes());

        hex::encode(mac.finalize().into_bytes())
    }

    /// Check a presented key against the expected derivation.
    pub fn verify(&self, key: &str, from: &str, to: &str, stream_id: &str) -> bool {
        let expected = self.generate(from, to, stream_id);
        constant_time_eq(key.as_bytes(), expected.as_bytes())
    }
}

/// Constant-time comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Build a `<db:result>` request carrying the initiator's key.
pub fn build_result(from: &str, to: &str, key: &str) -> String {
    format!(
        "<db:result xmlns:db='{}' from='{}' to='{}'>{}</db:result>",
        ns::DIALBACK,
        from,
        to,
        key
    )
}

/// Build the `<db:result>` answer relayed to the initiator.
pub fn build_result_response(from: &str, to: &str, verdict: Verdict) -> String {
    format!(
        "<db:result xmlns:db='{}' from='{}' to='{}' type='{}'/>",
        ns::DIALBACK,
        from,
        to,
        verdict.as_str()
    )
}

/// Build a `<db:verify>` request for the authoritative server.
pub fn build_verify(from: &str, to: &str, id: &str, key: &str) -> String {
    format!(
        "<db:verify xmlns:db='{}' from='{}' to='{}' id='{}'>{}</db:verify>",
        ns::DIALBACK,
        from,
        to,
        id,
        key
    )
}

/// Build the `<db:verify>` answer from the authoritative server.
pub fn build_verify_response(from: &str, to: &str, id: &str, verdict: Verdict) -> String {
    format!(
        "<db:verify xmlns:db='{}' from='{}' to='{}' id='{}' type='{}'/>",
        ns::DIALBACK,
        from,
        to,
        id,
        verdict.as_str()
    )
}
