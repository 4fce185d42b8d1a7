//! Shared-password access control.
//!
//! Clients never send the password itself, only `hex(sha256(password))`.
//! The comparison is a plain string equality and there is no rate limiting.

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Unauthorized: Missing password hash.")]
    MissingHash,
    #[error("Unauthorized: Invalid password.")]
    InvalidPassword,
}

/// Lowercase hex SHA-256 of a UTF-8 string
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Checks client password hashes against the server password
#[derive(Debug, Clone)]
pub struct PasswordGate {
    expected_hash: Option<String>,
}

impl PasswordGate {
    pub fn new(app_password: Option<&str>) -> Self {
        Self {
            expected_hash: app_password.map(sha256_hex),
        }
    }

    pub fn is_required(&self) -> bool {
        self.expected_hash.is_some()
    }

    pub fn check(&self, client_hash: Option<&str>) -> Result<(), AuthError> {
        let Some(expected) = &self.expected_hash else {
            return Ok(());
        };

        match client_hash.map(str::trim).filter(|h| !h.is_empty()) {
            None => {
                warn!("Missing password hash");
                Err(AuthError::MissingHash)
            }
            Some(hash) if hash == expected => Ok(()),
            Some(_) => {
                warn!("Invalid password hash");
                Err(AuthError::InvalidPassword)
            }
        }
    }
}
