use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey, StaticSecret};

use veil_core::types::PublicKeyBytes;

/// An X25519 key pair: account identity keys, epoch keys, link keys, and
/// share keys are all this one shape.
///
/// The secret half is wiped on drop.
#[derive(Serialize, Deserialize)]
pub struct EciesKeyPair {
    public: PublicKeyBytes,
    secret: [u8; 32],
}

impl EciesKeyPair {
    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            public: *public.as_bytes(),
            secret: secret.to_bytes(),
        }
    }

    /// Restore from raw secret bytes (e.g. an unwrapped epoch key).
    pub fn from_secret(secret: [u8; 32]) -> Self {
        let sk = StaticSecret::from(secret);
        let public = PublicKey::from(&sk);
        Self {
            public: *public.as_bytes(),
            secret: sk.to_bytes(),
        }
    }

    /// Derive deterministically from an arbitrary-length seed. Link guests
    /// derive their key pair this way from the URL-fragment secret.
    pub fn from_seed(seed: &[u8]) -> Self {
        Self::from_secret(*blake3::hash(seed).as_bytes())
    }

    pub fn public_key(&self) -> PublicKeyBytes {
        self.public
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }
}

impl Drop for EciesKeyPair {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for EciesKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EciesKeyPair {{ public: {} }}", hex::encode(self.public))
    }
}
