//! Pairing token issuance and verification
//!
//! One token is generated per server lifetime:
//! 1. Server start creates a `TokenIssuer` holding 32 random bytes (base64url)
//! 2. The token travels to the device inside the QR connection descriptor
//! 3. Every inbound connection is checked with a constant-time comparison
//! 4. There is no way to rotate it short of starting a new server

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64, Engine as _};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{info, warn};

/// Random bytes behind each token (256 bits)
pub const TOKEN_BYTES: usize = 32;

/// Authentication errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authentication failed")]
    AuthenticationFailed,
}

impl From<AuthError> for intunnel_core::Error {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::AuthenticationFailed => intunnel_core::Error::AuthenticationFailed,
        }
    }
}

/// Holds the pairing secret for the current server lifetime
pub struct TokenIssuer {
    token: String,
}

impl TokenIssuer {
    /// Generate a fresh token
    pub fn new() -> Self {
        let issuer = Self {
            token: generate_token(),
        };
        info!("Issued pairing token {}", issuer.fingerprint());
        issuer
    }

    /// The issued token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Check a client-presented credential
    pub fn verify(&self, candidate: &str) -> Result<(), AuthError> {
        if bool::from(candidate.as_bytes().ct_eq(self.token.as_bytes())) {
            Ok(())
        } else {
            warn!("Rejected credential for token {}", self.fingerprint());
            Err(AuthError::AuthenticationFailed)
        }
    }

    /// Short, non-reversible identifier for log lines
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.token.as_bytes());
        let encoded = BASE64.encode(digest);
        encoded[..8].to_string()
    }
}

impl Default for TokenIssuer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Generate a secure random URL-safe token
fn generate_token() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; TOKEN_BYTES] = rng.gen();
    BASE64.encode(bytes)
}
