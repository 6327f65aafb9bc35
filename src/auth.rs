//! NIP-42 challenge/response authentication.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use rand::Rng;
use thiserror::Error;
use url::Url;

use crate::{event::Event, verify::SignatureVerifier};

/// Reserved kind of AUTH response events.
pub const AUTH_KIND: u32 = 22242;

/// Reason an AUTH response was rejected. Rendered into the `OK` frame.
#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("invalid: expected kind {AUTH_KIND}, got {0}")]
    Kind(u32),
    #[error("invalid: missing or incorrect challenge tag")]
    Challenge,
    #[error("invalid: missing or incorrect relay tag")]
    Relay,
    #[error("invalid: created_at {0} is too far from the relay clock")]
    Stale(u64),
    #[error("invalid: bad signature: {0}")]
    Signature(String),
}

/// Fresh per-connection challenge: 32 bytes from the thread CSPRNG, hex encoded.
pub fn new_challenge() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Validates AUTH responses against this relay's identity.
pub struct Authenticator {
    relay_url: String,
    max_skew: u64,
    verifier: Arc<dyn SignatureVerifier>,
}

impl Authenticator {
    pub fn new(relay_url: impl Into<String>, max_skew: u64, verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self {
            relay_url: relay_url.into(),
            max_skew,
            verifier,
        }
    }

    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }

    /// Check `ev` as the answer to `challenge` at time `now`.
    ///
    /// Cheap structural checks run before the signature is verified.
    pub fn validate(&self, ev: &Event, challenge: &str, now: u64) -> Result<(), AuthError> {
        if ev.kind != AUTH_KIND {
            return Err(AuthError::Kind(ev.kind));
        }
        if ev.tag_value("challenge") != Some(challenge) {
            return Err(AuthError::Challenge);
        }
        match ev.tag_value("relay") {
            Some(url) if same_relay(url, &self.relay_url) => {}
            _ => return Err(AuthError::Relay),
        }
        if ev.created_at.abs_diff(now) > self.max_skew {
            return Err(AuthError::Stale(ev.created_at));
        }
        self.verifier
            .verify(ev)
            .map_err(|e| AuthError::Signature(e.to_string()))
    }
}

/// Compare relay URLs ignoring case of scheme/host, default ports and a
/// trailing slash.
fn same_relay(claimed: &str, ours: &str) -> bool {
    match (Url::parse(claimed), Url::parse(ours)) {
        (Ok(a), Ok(b)) => {
            a.scheme() == b.scheme()
                && a.host_str() == b.host_str()
                && a.port_or_known_default() == b.port_or_known_default()
                && a.path().trim_end_matches('/') == b.path().trim_end_matches('/')
                && a.query() == b.query()
        }
        _ => claimed.trim_end_matches('/') == ours.trim_end_matches('/'),
    }
}
