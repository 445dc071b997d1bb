//! Salted one-way password hashing and session token generation.
//!
//! `hash = hex(SHA-256(password ‖ salt))`. Salts and tokens are drawn from
//! v4 UUID randomness; a token is two UUIDs (244 random bits).

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Fresh per-account salt.
pub fn generate_salt() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Fresh opaque session token.
pub fn generate_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

pub fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Re-derive the hash and compare in constant time.
pub fn verify_password(password: &str, hash: &str, salt: &str) -> bool {
    constant_time_eq(hash_password(password, salt).as_bytes(), hash.as_bytes())
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
