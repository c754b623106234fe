//! Hashing and key generation

use rand::Rng;
use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256, the storage format for all credentials
/// (user login tokens and charger Authorization headers).
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A fresh 16-character AuthorizationKey.
pub fn generate_authorization_key() -> String {
    const CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..16)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}
