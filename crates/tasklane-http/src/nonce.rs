//! Request signing: the nonce for an action is `hex(sha256(secret ":" action))`.

use sha2::{Digest, Sha256};

/// Hex SHA-256 of `secret:action`, the nonce a trigger request carries.
pub fn sign(secret: &str, action: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(action.as_bytes());
    hex::encode(hasher.finalize())
}

/// Check a presented nonce in constant time.
pub fn verify(secret: &str, action: &str, nonce: &str) -> bool {
    let want = sign(secret, action);
    let got = nonce.trim().to_ascii_lowercase();
    ct_eq(want.as_bytes(), got.as_bytes())
}

fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |diff, (x, y)| diff | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonces_are_bound_to_secret_and_action() {
        let nonce = sign("s3cret", "cache_purger");
        assert_eq!(nonce.len(), 64);
        assert!(verify("s3cret", "cache_purger", &nonce));
        assert!(verify("s3cret", "cache_purger", &nonce.to_uppercase()));
        assert!(!verify("s3cret", "cache_preloader", &nonce));
        assert!(!verify("other", "cache_purger", &nonce));
        assert!(!verify("s3cret", "cache_purger", ""));
    }
}
