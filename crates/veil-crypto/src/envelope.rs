//! Message plaintext envelope: an optional raw-deflate pass recorded by a
//! one-byte flag, so decompression is deterministic regardless of what the
//! size heuristic chose at encryption time.

use std::io::Write;

use flate2::write::{DeflateDecoder, DeflateEncoder};
use flate2::Compression;

use veil_core::types::PublicKeyBytes;
use veil_core::VeilError;

const FLAG_STORED: u8 = 0x00;
const FLAG_DEFLATE: u8 = 0x01;

/// Plaintexts below this are never worth deflating.
pub const COMPRESSION_MIN_BYTES: usize = 128;

/// Wrap plaintext in the compression envelope. Deflate is kept only when it
/// actually wins.
pub fn pack(plaintext: &[u8]) -> Vec<u8> {
    if plaintext.len() >= COMPRESSION_MIN_BYTES {
        let mut encoder = DeflateEncoder::new(
            Vec::with_capacity(plaintext.len() / 2),
            Compression::default(),
        );
        let compressed = encoder
            .write_all(plaintext)
            .and_then(|_| encoder.finish())
            .ok();
        if let Some(compressed) = compressed {
            if compressed.len() < plaintext.len() {
                let mut out = Vec::with_capacity(compressed.len() + 1);
                out.push(FLAG_DEFLATE);
                out.extend_from_slice(&compressed);
                return out;
            }
        }
    }
    let mut out = Vec::with_capacity(plaintext.len() + 1);
    out.push(FLAG_STORED);
    out.extend_from_slice(plaintext);
    out
}

/// Invert [`pack`].
pub fn unpack(envelope: &[u8]) -> Result<Vec<u8>, VeilError> {
    match envelope.split_first() {
        Some((&FLAG_STORED, rest)) => Ok(rest.to_vec()),
        Some((&FLAG_DEFLATE, rest)) => {
            let mut decoder = DeflateDecoder::new(Vec::new());
            decoder
                .write_all(rest)
                .and_then(|_| decoder.finish())
                .map_err(|e| VeilError::CryptoParse(format!("deflate envelope: {e}")))
        }
        Some((flag, _)) => Err(VeilError::CryptoParse(format!(
            "unknown envelope flag {flag:#04x}"
        ))),
        None => Err(VeilError::CryptoParse("empty envelope".into())),
    }
}

/// Compress-then-encrypt a message plaintext for `recipient_public`.
pub fn seal_message(
    recipient_public: &PublicKeyBytes,
    plaintext: &[u8],
) -> Result<Vec<u8>, VeilError> {
    crate::ecies::encrypt(recipient_public, &pack(plaintext))
}

/// Decrypt-then-decompress a message blob.
pub fn open_message(recipient_secret: &[u8; 32], blob: &[u8]) -> Result<Vec<u8>, VeilError> {
    unpack(&crate::ecies::decrypt(recipient_secret, blob)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::EciesKeyPair;

    #[test]
    fn short_plaintext_is_stored() {
        let env = pack(b"hi");
        assert_eq!(env[0], FLAG_STORED);
        assert_eq!(unpack(&env).unwrap(), b"hi");
    }

    #[test]
    fn repetitive_plaintext_is_deflated() {
        let plaintext = vec![b'a'; 4096];
        let env = pack(&plaintext);
        assert_eq!(env[0], FLAG_DEFLATE);
        assert!(env.len() < plaintext.len());
        assert_eq!(unpack(&env).unwrap(), plaintext);
    }

    #[test]
    fn incompressible_plaintext_falls_back_to_stored() {
        use rand::RngCore;
        let mut plaintext = vec![0u8; 512];
        rand::rngs::OsRng.fill_bytes(&mut plaintext);
        let env = pack(&plaintext);
        assert_eq!(env[0], FLAG_STORED);
        assert_eq!(unpack(&env).unwrap(), plaintext);
    }

    #[test]
    fn unknown_flag_rejected() {
        assert!(unpack(&[0x7f, 1, 2, 3]).is_err());
        assert!(unpack(&[]).is_err());
    }

    #[test]
    fn seal_open_round_trip() {
        let kp = EciesKeyPair::generate();
        let text = "group chat plaintext ".repeat(40);
        let blob = seal_message(&kp.public_key(), text.as_bytes()).unwrap();
        let plain = open_message(kp.secret_bytes(), &blob).unwrap();
        assert_eq!(plain, text.as_bytes());
    }
}
