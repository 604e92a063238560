//! Magnet links
//!
//! Format: `firestrike://<64 lowercase hex content id>#<base64 of 32-byte key>`.
//! Holding a link is both the capability to locate and to decrypt a file.

use crate::error::{CryptoError, Result};
use crate::hashing::ContentId;
use crate::keys::SymmetricKey;
use crate::KEY_SIZE;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::fmt;
use std::str::FromStr;

/// URI scheme for magnet links
pub const LINK_SCHEME: &str = "firestrike";

/// A content identifier paired with the key that decrypts it
#[derive(Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub content_id: ContentId,
    pub key: SymmetricKey,
}

impl MagnetLink {
    pub fn new(content_id: ContentId, key: SymmetricKey) -> Self {
        MagnetLink { content_id, key }
    }
}

impl fmt::Display for MagnetLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}#{}",
            LINK_SCHEME,
            self.content_id.to_hex(),
            STANDARD.encode(self.key.as_bytes())
        )
    }
}

// Only the content id is shown; the key stays out of logs
impl fmt::Debug for MagnetLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MagnetLink")
            .field("content_id", &self.content_id)
            .finish_non_exhaustive()
    }
}

impl FromStr for MagnetLink {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self> {
        let (content_id, key) = decode_link(s)?;
        Ok(MagnetLink { content_id, key })
    }
}

/// Build a magnet link string
pub fn encode_link(content_id: &ContentId, key: &SymmetricKey) -> String {
    MagnetLink::new(*content_id, key.clone()).to_string()
}

/// Parse a magnet link string
///
/// Rejects a wrong scheme, an id that is not exactly 64 lowercase hex
/// characters, a key segment that is not valid base64, and a key that does
/// not decode to exactly 32 bytes.
pub fn decode_link(link: &str) -> Result<(ContentId, SymmetricKey)> {
    let rest = link
        .strip_prefix(LINK_SCHEME)
        .and_then(|r| r.strip_prefix("://"))
        .ok_or_else(|| CryptoError::InvalidLink(format!("expected {}:// scheme", LINK_SCHEME)))?;

    let (id_part, key_part) = rest
        .split_once('#')
        .ok_or_else(|| CryptoError::InvalidLink("missing '#' separator".to_string()))?;

    let content_id = ContentId::from_hex(id_part)
        .map_err(|e| CryptoError::InvalidLink(e.to_string()))?;

    let key_bytes = STANDARD
        .decode(key_part)
        .map_err(|e| CryptoError::InvalidLink(format!("key is not base64: {}", e)))?;

    if key_bytes.len() != KEY_SIZE {
        return Err(CryptoError::InvalidLink(format!(
            "key decodes to {} bytes (expected {})",
            key_bytes.len(),
            KEY_SIZE
        )));
    }

    let key = SymmetricKey::from_slice(&key_bytes)?;
    Ok((content_id, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_key;
    use crate::CONTENT_ID_SIZE;

    fn sample() -> (ContentId, SymmetricKey) {
        (ContentId::from_bytes([0x5A; CONTENT_ID_SIZE]), generate_key())
    }

    fn key_b64(bytes: &[u8]) -> String {
        STANDARD.encode(bytes)
    }

    #[test]
    fn test_link_roundtrip() {
        let (id, key) = sample();
        let link = encode_link(&id, &key);

        assert!(link.starts_with("firestrike://"));
        let (parsed_id, parsed_key) = decode_link(&link).unwrap();
        assert_eq!(parsed_id, id);
        assert_eq!(parsed_key, key);

        let typed: MagnetLink = link.parse().unwrap();
        assert_eq!(typed.content_id, id);
        assert_eq!(typed.to_string(), link);
    }

    #[test]
    fn test_rejects_wrong_scheme() {
        let (id, key) = sample();
        let link = format!("magnet://{}#{}", id.to_hex(), key_b64(key.as_bytes()));
        assert!(matches!(decode_link(&link), Err(CryptoError::InvalidLink(_))));

        let link = format!("firestrike:{}#{}", id.to_hex(), key_b64(key.as_bytes()));
        assert!(matches!(decode_link(&link), Err(CryptoError::InvalidLink(_))));
    }

    #[test]
    fn test_rejects_wrong_id_length() {
        let key = key_b64(&[1u8; KEY_SIZE]);
        let short = format!("firestrike://{}#{}", "a".repeat(63), key);
        let long = format!("firestrike://{}#{}", "a".repeat(65), key);
        assert!(matches!(decode_link(&short), Err(CryptoError::InvalidLink(_))));
        assert!(matches!(decode_link(&long), Err(CryptoError::InvalidLink(_))));
    }

    #[test]
    fn test_rejects_non_hex_id() {
        let key = key_b64(&[1u8; KEY_SIZE]);
        let link = format!("firestrike://{}#{}", "z".repeat(64), key);
        assert!(matches!(decode_link(&link), Err(CryptoError::InvalidLink(_))));
    }

    #[test]
    fn test_rejects_non_base64_key() {
        let link = format!("firestrike://{}#{}", "a".repeat(64), "not*base64!");
        assert!(matches!(decode_link(&link), Err(CryptoError::InvalidLink(_))));
    }

    #[test]
    fn test_rejects_wrong_key_length() {
        let short = format!("firestrike://{}#{}", "a".repeat(64), key_b64(&[1u8; 31]));
        let long = format!("firestrike://{}#{}", "a".repeat(64), key_b64(&[1u8; 33]));
        assert!(matches!(decode_link(&short), Err(CryptoError::InvalidLink(_))));
        assert!(matches!(decode_link(&long), Err(CryptoError::InvalidLink(_))));
    }

    #[test]
    fn test_rejects_missing_separator_and_extra_fields() {
        let key = key_b64(&[1u8; KEY_SIZE]);
        let no_sep = format!("firestrike://{}{}", "a".repeat(64), key);
        let extra = format!("firestrike://{}#{}#extra", "a".repeat(64), key);
        assert!(matches!(decode_link(&no_sep), Err(CryptoError::InvalidLink(_))));
        assert!(matches!(decode_link(&extra), Err(CryptoError::InvalidLink(_))));
    }

    #[test]
    fn test_debug_hides_key() {
        let (id, key) = sample();
        let link = MagnetLink::new(id, key.clone());
        let rendered = format!("{:?}", link);
        assert!(!rendered.contains(&key_b64(key.as_bytes())));
    }
}
