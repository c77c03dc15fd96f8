//! Secret generation and hashing for download grants and API keys.
//!
//! Download secrets are only ever stored hashed. The plaintext travels inside the
//! signed capability token and is compared against the stored hash in constant time.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Raw entropy behind a download secret. 48 bytes encode to 64 URL-safe characters.
const SECRET_BYTES: usize = 48;

/// Generate a fresh random download secret (64 URL-safe characters).
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Hash a secret for storage. SHA-256 with an application salt, lowercase hex.
pub fn hash_secret(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"shutterpay-v1:");
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check a presented secret against a stored hash without leaking timing.
pub fn secret_matches(secret: &str, stored_hash: &str) -> bool {
    constant_time_eq(&hash_secret(secret), stored_hash)
}

/// Constant-time string comparison.
///
/// Length is compared first; lengths here are never secret (hex digests, fixed-size keys).
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_secret_is_64_url_safe_chars() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 64);
        assert!(
            secret
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
            "secret should only contain URL-safe characters: {}",
            secret
        );
    }

    #[test]
    fn test_secrets_are_unique() {
        assert_ne!(generate_secret(), generate_secret());
    }

    #[test]
    fn test_secret_matches_its_hash_only() {
        let secret = generate_secret();
        let hash = hash_secret(&secret);
        assert!(secret_matches(&secret, &hash));
        assert!(!secret_matches("not-the-secret", &hash));
        assert!(!secret_matches(&secret, ""));
    }
}
