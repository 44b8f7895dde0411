//! The one ciphertext format in the system:
//!
//! ```text
//! version (1B) ‖ ephemeral X25519 public (32B) ‖ ciphertext ‖ Poly1305 tag (16B)
//! ```
//!
//! Key derivation: X25519(ephemeral, recipient) → HKDF-SHA256 with
//! salt = ephemeral_public ‖ recipient_public and info `"ecies-xchacha20-v1"`.
//! The XChaCha20-Poly1305 nonce is 24 zero bytes; every encryption derives a
//! fresh symmetric key from a fresh ephemeral, so a key-nonce pair never
//! repeats.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use veil_core::types::PublicKeyBytes;
use veil_core::VeilError;

/// Current (and only) blob version byte.
pub const BLOB_VERSION: u8 = 0x01;

/// Fixed per-blob overhead: version + ephemeral public + auth tag.
pub const BLOB_OVERHEAD: usize = 1 + 32 + 16;

const KDF_INFO: &[u8] = b"ecies-xchacha20-v1";

fn derive_key(
    shared: &[u8; 32],
    ephemeral_public: &[u8; 32],
    recipient_public: &[u8; 32],
) -> Zeroizing<[u8; 32]> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_public);
    salt[32..].copy_from_slice(recipient_public);
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(KDF_INFO, key.as_mut())
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    key
}

/// Encrypt `plaintext` to `recipient_public`. Every call generates a fresh
/// ephemeral key pair.
pub fn encrypt(recipient_public: &PublicKeyBytes, plaintext: &[u8]) -> Result<Vec<u8>, VeilError> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&PublicKey::from(*recipient_public));
    if !shared.was_contributory() {
        return Err(VeilError::CryptoParse("low-order recipient public key".into()));
    }

    let key = derive_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient_public);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
    let ciphertext = cipher
        .encrypt(&XNonce::default(), plaintext)
        .map_err(|_| VeilError::Internal("AEAD encryption failed".into()))?;

    let mut blob = Vec::with_capacity(1 + 32 + ciphertext.len());
    blob.push(BLOB_VERSION);
    blob.extend_from_slice(ephemeral_public.as_bytes());
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt a blob with the recipient's secret key. Authentication failure is
/// fatal: the blob was tampered with or the key is wrong.
pub fn decrypt(recipient_secret: &[u8; 32], blob: &[u8]) -> Result<Vec<u8>, VeilError> {
    if blob.len() < BLOB_OVERHEAD {
        return Err(VeilError::CryptoParse(format!(
            "blob too short: {} bytes",
            blob.len()
        )));
    }
    if blob[0] != BLOB_VERSION {
        return Err(VeilError::CryptoParse(format!(
            "unknown blob version {:#04x}",
            blob[0]
        )));
    }

    let mut ephemeral_public = [0u8; 32];
    ephemeral_public.copy_from_slice(&blob[1..33]);

    let secret = StaticSecret::from(*recipient_secret);
    let recipient_public = PublicKey::from(&secret);
    let shared = secret.diffie_hellman(&PublicKey::from(ephemeral_public));
    if !shared.was_contributory() {
        return Err(VeilError::CryptoParse("low-order ephemeral public key".into()));
    }

    let key = derive_key(shared.as_bytes(), &ephemeral_public, recipient_public.as_bytes());
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_ref()));
    cipher
        .decrypt(&XNonce::default(), &blob[33..])
        .map_err(|_| VeilError::CryptoAuth)
}
