//! Client-side epoch key operations. The server never sees an epoch private
//! key outside an ECIES wrap; everything here runs on clients (and in tests
//! standing in for clients), producing the opaque material the server-side
//! rotation transaction stores.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use veil_core::types::PublicKeyBytes;
use veil_core::VeilError;
use veil_crypto::{confirmation_hash, ecies, verify_confirmation, EciesKeyPair};

/// One member's wrap in a rotation submission: the new epoch private key
/// encrypted to that member's public key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemberWrap {
    pub member_public_key: PublicKeyBytes,
    pub wrapped_key: Vec<u8>,
}

/// Material produced when a conversation is created.
pub struct FirstEpoch {
    pub epoch_public_key: PublicKeyBytes,
    pub confirmation_hash: [u8; 32],
    pub owner_wrap: Vec<u8>,
    /// The fresh epoch key pair, for the creating client's session cache.
    pub keys: EciesKeyPair,
}

/// Material produced by a client-side rotation, submitted as one atomic
/// server transaction.
pub struct RotationBundle {
    pub new_epoch_public_key: PublicKeyBytes,
    pub confirmation_hash: [u8; 32],
    pub member_wraps: Vec<MemberWrap>,
    /// `ECIES(new epoch public key, old epoch private key)`.
    pub chain_link: Vec<u8>,
    pub keys: EciesKeyPair,
}

/// Generate the first epoch key pair and wrap it for the owner.
pub fn create_first_epoch(owner_public_key: &PublicKeyBytes) -> Result<FirstEpoch, VeilError> {
    let keys = EciesKeyPair::generate();
    let owner_wrap = wrap_for_member(keys.secret_bytes(), owner_public_key)?;
    Ok(FirstEpoch {
        epoch_public_key: keys.public_key(),
        confirmation_hash: confirmation_hash(keys.secret_bytes()),
        owner_wrap,
        keys,
    })
}

/// Wrap an epoch private key for one member (used when adding a member
/// without rotating).
pub fn wrap_for_member(
    epoch_secret: &[u8; 32],
    member_public_key: &PublicKeyBytes,
) -> Result<Vec<u8>, VeilError> {
    ecies::encrypt(member_public_key, epoch_secret)
}

/// Unwrap an epoch private key and validate it against the epoch's stored
/// confirmation hash before it is ever used on a message.
pub fn unwrap_epoch_key(
    member_secret: &[u8; 32],
    wrapped_key: &[u8],
    expected_confirmation: &[u8; 32],
) -> Result<[u8; 32], VeilError> {
    let plain = Zeroizing::new(ecies::decrypt(member_secret, wrapped_key)?);
    if plain.len() != 32 {
        return Err(VeilError::CryptoParse(format!(
            "epoch key wrap held {} bytes",
            plain.len()
        )));
    }
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&plain);
    if !verify_confirmation(&secret, expected_confirmation) {
        return Err(VeilError::CryptoParse(
            "unwrapped epoch key fails confirmation hash".into(),
        ));
    }
    Ok(secret)
}

/// Rotate: fresh key pair, wraps for every remaining member, and a chain link
/// back to the old epoch. Removed members simply get no wrap.
pub fn rotate(
    old_epoch_secret: &[u8; 32],
    remaining_member_keys: &[PublicKeyBytes],
) -> Result<RotationBundle, VeilError> {
    let keys = EciesKeyPair::generate();
    let mut member_wraps = Vec::with_capacity(remaining_member_keys.len());
    for member_public_key in remaining_member_keys {
        member_wraps.push(MemberWrap {
            member_public_key: *member_public_key,
            wrapped_key: wrap_for_member(keys.secret_bytes(), member_public_key)?,
        });
    }
    let chain_link = ecies::encrypt(&keys.public_key(), old_epoch_secret)?;
    Ok(RotationBundle {
        new_epoch_public_key: keys.public_key(),
        confirmation_hash: confirmation_hash(keys.secret_bytes()),
        member_wraps,
        chain_link,
        keys,
    })
}

/// Walk one chain link backwards: with epoch N+1's private key, recover epoch
/// N's. Reading at epoch k from epoch m costs m−k of these.
pub fn traverse_chain(
    newer_epoch_secret: &[u8; 32],
    chain_link: &[u8],
) -> Result<[u8; 32], VeilError> {
    let plain = Zeroizing::new(ecies::decrypt(newer_epoch_secret, chain_link)?);
    if plain.len() != 32 {
        return Err(VeilError::CryptoParse(format!(
            "chain link held {} bytes",
            plain.len()
        )));
    }
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&plain);
    Ok(secret)
}
