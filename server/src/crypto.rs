//! Frame encryption
//!
//! Every agent frame is `nonce (12 bytes) || AES-256-GCM ciphertext+tag`,
//! sealed with the pre-shared process-wide key.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use crate::error::SessionError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("key must be {KEY_LEN} bytes, got {0}")]
    Length(usize),
}

/// Parse a 64-char hex key
pub fn parse_key(hex_key: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let bytes = hex::decode(hex_key.trim())?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| KeyError::Length(len))
}

/// Fresh random key, hex encoded
pub fn generate_key() -> String {
    let mut key = [0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key);
    hex::encode(key)
}

/// Symmetric cipher shared by all sessions
#[derive(Clone)]
pub struct FrameCipher {
    cipher: Aes256Gcm,
}

impl FrameCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, KeyError> {
        Ok(Self::new(&parse_key(hex_key)?))
    }

    /// Seal a plaintext payload into one frame body
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SessionError::Encryption)?;

        let mut frame = Vec::with_capacity(NONCE_LEN + sealed.len());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    /// Open one frame body; any tampering or key mismatch is `Decryption`
    pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>, SessionError> {
        if frame.len() < NONCE_LEN {
            return Err(SessionError::Decryption);
        }
        let (nonce, sealed) = frame.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| SessionError::Decryption)
    }
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FrameCipher(..)")
    }
}
