//! Salted content hashing
//!
//! A content identifier is SHA3-256(salt || data). Supplying the same salt
//! reproduces the same identifier, so any peer holding the bytes and the
//! salt can check that an object really lives under the id it was stored
//! with.

use crate::error::{CryptoError, Result};
use crate::{CONTENT_ID_SIZE, SALT_SIZE};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Sha3_256};
use std::fmt;
use std::io::{self, Write};

/// Hex-encoded 256-bit digest addressing a stored object
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId([u8; CONTENT_ID_SIZE]);

impl ContentId {
    /// Create from raw digest bytes
    pub fn from_bytes(bytes: [u8; CONTENT_ID_SIZE]) -> Self {
        ContentId(bytes)
    }

    /// Get the raw digest bytes
    pub fn as_bytes(&self) -> &[u8; CONTENT_ID_SIZE] {
        &self.0
    }

    /// Convert to lowercase hex (64 characters)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex
    ///
    /// Only the canonical form is accepted: exactly 64 lowercase hex
    /// characters.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != CONTENT_ID_SIZE * 2 {
            return Err(CryptoError::InvalidContentId(format!(
                "expected {} hex characters, got {}",
                CONTENT_ID_SIZE * 2,
                s.len()
            )));
        }

        if !s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            return Err(CryptoError::InvalidContentId(
                "not lowercase hex".to_string(),
            ));
        }

        let mut arr = [0u8; CONTENT_ID_SIZE];
        hex::decode_to_slice(s, &mut arr)
            .map_err(|e| CryptoError::InvalidContentId(e.to_string()))?;
        Ok(ContentId(arr))
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.to_hex())
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for ContentId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ContentId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Random salt mixed into a content identifier
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Salt([u8; SALT_SIZE]);

impl Salt {
    /// Generate a fresh random salt
    pub fn generate() -> Self {
        let mut bytes = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Salt(bytes)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; SALT_SIZE]) -> Self {
        Salt(bytes)
    }

    /// Create from a slice of exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Salt)
    }

    /// Get the raw salt bytes
    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Salt({})", &hex::encode(self.0)[..16])
    }
}

/// Incremental content hasher
///
/// Used when the data is produced as a stream (e.g. while encrypting a
/// file) so the whole object never has to be held in memory.
pub struct ContentHasher {
    hasher: Sha3_256,
    salt: Salt,
}

impl ContentHasher {
    /// Start hashing with the given salt
    pub fn new(salt: Salt) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(salt.as_bytes());
        ContentHasher { hasher, salt }
    }

    /// Feed more data
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// Finish and return the identifier with the salt that produced it
    pub fn finalize(self) -> (ContentId, Salt) {
        let digest = self.hasher.finalize();
        let mut id = [0u8; CONTENT_ID_SIZE];
        id.copy_from_slice(&digest);
        (ContentId(id), self.salt)
    }

    /// Wrap a writer so everything written through it is also hashed
    pub fn wrap<W: Write>(self, inner: W) -> HashingWriter<W> {
        HashingWriter {
            inner,
            hasher: self,
        }
    }
}

/// Writer adapter that hashes all bytes passing through it
pub struct HashingWriter<W> {
    inner: W,
    hasher: ContentHasher,
}

impl<W: Write> HashingWriter<W> {
    /// Return the inner writer and the finished identifier
    pub fn finish(self) -> (W, ContentId, Salt) {
        let (id, salt) = self.hasher.finalize();
        (self.inner, id, salt)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hash data under a salt, generating a random salt when none is given
pub fn hash_content(data: &[u8], salt: Option<Salt>) -> (ContentId, Salt) {
    let mut hasher = ContentHasher::new(salt.unwrap_or_else(Salt::generate));
    hasher.update(data);
    hasher.finalize()
}

/// Check that `data` hashes to `expected` under `salt`
pub fn verify_content(data: &[u8], salt: &Salt, expected: &ContentId) -> bool {
    let (actual, _) = hash_content(data, Some(*salt));
    actual == *expected
}
