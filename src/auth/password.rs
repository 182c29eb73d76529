//! Passphrase verification
//!
//! Stored passphrases are bcrypt hashes.

use crate::error::AppError;
use bcrypt::verify;

/// Verify a passphrase against a stored hash
pub fn verify_passphrase(passphrase: &str, hashed: &str) -> Result<bool, AppError> {
    verify(passphrase, hashed)
        .map_err(|e| AppError::Internal(format!("Failed to verify passphrase: {}", e)))
}
