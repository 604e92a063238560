//! Node identity
//!
//! A node generates a fresh X25519 keypair every time it starts. The
//! identity lives for the process lifetime and is never persisted, so a
//! restarted node is a new identity.

use sodiumoxide::crypto::box_;
use std::fmt;

/// Size of a node public key in bytes
pub const PUBLIC_KEY_SIZE: usize = box_::PUBLICKEYBYTES;

/// Keypair plus the address the node is reachable at
pub struct NodeIdentity {
    pub public_key: box_::PublicKey,
    secret_key: box_::SecretKey,
    pub listen_address: String,
}

impl NodeIdentity {
    /// Generate a new identity bound to `listen_address`
    ///
    /// Call [`crate::init`] once before the first identity is generated.
    pub fn generate(listen_address: impl Into<String>) -> Self {
        let (public_key, secret_key) = box_::gen_keypair();
        NodeIdentity {
            public_key,
            secret_key,
            listen_address: listen_address.into(),
        }
    }

    /// Raw public key bytes
    pub fn public_key_bytes(&self) -> &[u8] {
        self.public_key.as_ref()
    }

    /// Raw secret key bytes
    pub fn secret_key_bytes(&self) -> &[u8] {
        self.secret_key.as_ref()
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("public_key", &hex::encode(self.public_key.as_ref()))
            .field("listen_address", &self.listen_address)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_identity() {
        crate::init().unwrap();
        let a = NodeIdentity::generate("127.0.0.1:8789");
        let b = NodeIdentity::generate("127.0.0.1:8790");

        assert_eq!(a.public_key_bytes().len(), PUBLIC_KEY_SIZE);
        assert_eq!(a.listen_address, "127.0.0.1:8789");
        assert_ne!(a.public_key_bytes(), b.public_key_bytes());
        assert_ne!(a.secret_key_bytes(), b.secret_key_bytes());
    }

    #[test]
    fn test_debug_omits_secret() {
        crate::init().unwrap();
        let identity = NodeIdentity::generate("addr");
        let rendered = format!("{:?}", identity);
        assert!(!rendered.contains(&hex::encode(identity.secret_key_bytes())));
    }
}
