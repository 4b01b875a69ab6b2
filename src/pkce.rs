//! PKCE (Proof Key for Code Exchange) for the authorization code flow.
//!
//! - Code verifier generation (three concatenated v4 UUIDs)
//! - S256 code challenge derivation using SHA-256
//! - Verification that a challenge matches a verifier

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::Config;

/// Random identifiers concatenated into one verifier.
const VERIFIER_PARTS: usize = 3;

/// A code verifier and its derived challenge.
#[derive(Debug, Clone)]
pub struct Pkce {
    /// Kept in the pending flow and sent with the token request.
    pub verifier: String,

    /// base64url(sha256(verifier)), sent in the authorization URL.
    pub challenge: String,

    /// Always "S256".
    pub method: &'static str,
}

impl Pkce {
    /// Generate a new verifier/challenge pair.
    ///
    /// The verifier is 108 characters of hyphenated lowercase hex, which stays
    /// inside the RFC 7636 unreserved alphabet and its 43..=128 length range.
    #[must_use]
    pub fn generate() -> Self {
        let verifier: String = (0..VERIFIER_PARTS)
            .map(|_| Uuid::new_v4().to_string())
            .collect();
        Self::from_verifier(verifier)
    }

    /// Derive the challenge for an existing verifier.
    #[must_use]
    pub fn from_verifier(verifier: String) -> Self {
        let challenge = Self::compute_challenge(&verifier);
        Self {
            verifier,
            challenge,
            method: Config::CODE_CHALLENGE_METHOD,
        }
    }

    /// Verify that a challenge matches a verifier.
    #[must_use]
    pub fn verify(verifier: &str, challenge: &str) -> bool {
        Self::compute_challenge(verifier) == challenge
    }

    /// Compute the S256 challenge from a verifier.
    pub fn compute_challenge(verifier: &str) -> String {
        let hash = Sha256::digest(verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(hash)
    }
}
