//! # Credential Hashing
//!
//! Argon2id credential verifiers and SHA-256 token digests.
//!
//! Credentials are stored only as one-way verifiers in PHC string format
//! (`$argon2id$v=19$m=65536,t=3,p=4$<salt>$<hash>`); verification is
//! constant-time. Opaque tokens (refresh tokens, assertions) are stored as
//! hex-encoded SHA-256 digests so a database leak never yields usable
//! token material.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use sha2::{Digest, Sha256};

use crate::errors::{ServiceError, ServiceResult};

// =============================================================================
// Credential Hasher
// =============================================================================

/// Argon2id hasher with OWASP-recommended parameters
/// (64 MiB memory, 3 iterations, 4 lanes).
#[derive(Clone)]
pub struct CredentialHasher {
    argon2: Argon2<'static>,
}

impl Default for CredentialHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialHasher {
    pub fn new() -> Self {
        let params = Params::new(64 * 1024, 3, 4, None).expect("static Argon2 params are valid");
        Self { argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params) }
    }

    /// Derives a verifier for storage. Each call salts freshly, so equal
    /// inputs produce distinct verifiers.
    pub fn hash(&self, secret: &str) -> ServiceResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(secret.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| ServiceError::server("CRY-1001", format!("hashing failed: {}", e)))
    }

    /// Verifies a secret against a stored verifier (constant-time).
    pub fn verify(&self, secret: &str, verifier: &str) -> ServiceResult<bool> {
        let parsed = PasswordHash::new(verifier)
            .map_err(|e| ServiceError::server("CRY-1002", format!("invalid verifier: {}", e)))?;
        match self.argon2.verify_password(secret.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(ServiceError::server(
                "CRY-1003",
                format!("verification failed: {}", e),
            )),
        }
    }
}

impl std::fmt::Debug for CredentialHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialHasher").finish_non_exhaustive()
    }
}

// =============================================================================
// Token Digests
// =============================================================================

/// Hex-encoded SHA-256 digest of an opaque token. Deterministic, so lookups
/// hash the presented token and match on the stored digest.
pub fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_roundtrip() {
        let hasher = CredentialHasher::new();
        let verifier = hasher.hash("hunter2").unwrap();
        assert!(verifier.starts_with("$argon2id$"));
        assert!(hasher.verify("hunter2", &verifier).unwrap());
        assert!(!hasher.verify("hunter3", &verifier).unwrap());
    }

    #[test]
    fn equal_inputs_produce_distinct_verifiers() {
        let hasher = CredentialHasher::new();
        let a = hasher.hash("hunter2").unwrap();
        let b = hasher.hash("hunter2").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_verifier_is_a_server_error() {
        let hasher = CredentialHasher::new();
        let err = hasher.verify("x", "not-a-phc-string").unwrap_err();
        assert!(err.is_server_error());
    }

    #[test]
    fn token_digest_is_deterministic_and_hex() {
        let a = token_digest("refresh-token-1");
        let b = token_digest("refresh-token-1");
        let c = token_digest("refresh-token-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }
}
