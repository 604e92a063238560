//! FireStrike Cryptography
//!
//! Everything a node needs to turn a file into an addressable ciphertext
//! and back:
//! - Symmetric key generation
//! - Salted SHA3-256 content identifiers
//! - Streaming AES-256-CBC encryption with a self-describing IV prefix
//! - Magnet link encoding and parsing
//! - Per-process node identity keypairs

pub mod cipher;
pub mod error;
pub mod hashing;
pub mod identity;
pub mod keys;
pub mod link;

pub use cipher::{decrypt_stream, encrypt_stream, Iv};
pub use error::{CryptoError, Result};
pub use hashing::{hash_content, verify_content, ContentHasher, ContentId, HashingWriter, Salt};
pub use identity::{NodeIdentity, PUBLIC_KEY_SIZE};
pub use keys::{generate_key, SymmetricKey};
pub use link::{decode_link, encode_link, MagnetLink, LINK_SCHEME};

/// Size of a symmetric key in bytes (AES-256)
pub const KEY_SIZE: usize = 32;

/// Size of a CBC initialization vector in bytes
pub const IV_SIZE: usize = 16;

/// Size of a content hashing salt in bytes
pub const SALT_SIZE: usize = 32;

/// Size of a content identifier digest in bytes (SHA3-256)
pub const CONTENT_ID_SIZE: usize = 32;

/// Chunk size for streaming file I/O
pub const CHUNK_SIZE: usize = 8192;

/// Initialize the underlying crypto library
///
/// Must be called once before generating node identities.
pub fn init() -> Result<()> {
    sodiumoxide::init().map_err(|_| CryptoError::Init)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        assert!(init().is_ok());
        // Repeated initialization is harmless
        assert!(init().is_ok());
    }
}
