//! Authentication string for the Identify handshake.
//!
//! OBS derives a secret from the password and a per-server salt, then proves
//! possession of it against a per-connection challenge:
//! `base64(sha256(base64(sha256(password + salt)) + challenge))`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::protocol::AuthChallenge;

pub fn authentication_string(password: &str, salt: &str, challenge: &str) -> String {
    let secret = STANDARD.encode(Sha256::digest(format!("{password}{salt}").as_bytes()));
    STANDARD.encode(Sha256::digest(format!("{secret}{challenge}").as_bytes()))
}

/// Convenience wrapper over [`authentication_string`] for a Hello challenge.
pub fn respond_to(password: &str, auth: &AuthChallenge) -> String {
    authentication_string(password, &auth.salt, &auth.challenge)
}
