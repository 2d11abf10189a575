//! Cryptographic services: JWT signing/verification and credential hashing.

pub mod hash;
pub mod jwt;

pub use hash::{token_digest, CredentialHasher};
pub use jwt::JwtService;
