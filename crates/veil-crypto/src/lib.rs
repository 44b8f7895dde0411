pub mod ecies;
pub mod envelope;
pub mod hash;
pub mod keypair;

pub use ecies::{decrypt, encrypt, BLOB_OVERHEAD, BLOB_VERSION};
pub use envelope::{open_message, seal_message};
pub use hash::{blake3_hash, confirmation_hash, verify_confirmation};
pub use keypair::EciesKeyPair;
