//! X25519 key material in the base64 form `wg` uses.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand_core::{OsRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{KeeperError, Result};

const KEY_LEN: usize = 32;

/// A freshly generated client key pair.
#[derive(Clone)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"(hidden)")
            .field("public_key", &self.public_key)
            .finish()
    }
}

impl KeyPair {
    /// Equivalent of `wg genkey | tee priv | wg pubkey`.
    pub fn generate() -> Self {
        let mut private_key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut private_key);
        Self::from_bytes(private_key)
    }

    fn from_bytes(private_key: [u8; KEY_LEN]) -> Self {
        let secret = StaticSecret::from(private_key);
        let public = PublicKey::from(&secret);
        Self {
            private_key: BASE64.encode(secret.to_bytes()),
            public_key: BASE64.encode(public.as_bytes()),
        }
    }
}

fn decode_key(encoded: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = BASE64
        .decode(encoded.trim())
        .map_err(|e| KeeperError::InvalidKey(format!("not base64: {}", e)))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| KeeperError::InvalidKey(format!("expected 32 bytes, got {}", b.len())))
}

/// `wg pubkey`: derive the public key of a base64 private key.
pub fn public_from_private(private_key: &str) -> Result<String> {
    let secret = StaticSecret::from(decode_key(private_key)?);
    Ok(BASE64.encode(PublicKey::from(&secret).as_bytes()))
}

/// Whether `key` decodes to exactly 32 bytes.
pub fn is_valid_key(key: &str) -> bool {
    decode_key(key).is_ok()
}
