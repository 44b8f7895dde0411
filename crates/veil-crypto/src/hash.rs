/// Compute BLAKE3 hash of arbitrary bytes → 32-byte array.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Confirmation hash stored on each epoch row: BLAKE3(epoch private key).
/// Clients compare this after unwrapping a candidate key so a corrupted wrap
/// fails fast instead of producing AEAD failures on every message.
pub fn confirmation_hash(secret: &[u8; 32]) -> [u8; 32] {
    blake3_hash(secret)
}

/// Check an unwrapped candidate private key against the stored hash.
pub fn verify_confirmation(secret: &[u8; 32], expected: &[u8; 32]) -> bool {
    confirmation_hash(secret) == *expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_detects_corruption() {
        let secret = [9u8; 32];
        let hash = confirmation_hash(&secret);
        assert!(verify_confirmation(&secret, &hash));
        let mut corrupted = secret;
        corrupted[0] ^= 0xff;
        assert!(!verify_confirmation(&corrupted, &hash));
    }
}
