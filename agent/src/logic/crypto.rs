//! Frame sealing
//!
//! Frame body layout: `nonce (12 bytes) || AES-256-GCM ciphertext+tag`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

#[derive(Debug)]
pub enum KeyError {
    Hex(hex::FromHexError),
    Length(usize),
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyError::Hex(e) => write!(f, "key is not valid hex: {}", e),
            KeyError::Length(n) => write!(f, "key must be {} bytes, got {}", KEY_LEN, n),
        }
    }
}

impl std::error::Error for KeyError {}

/// AEAD refused to seal the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SealError;

impl std::fmt::Display for SealError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame could not be sealed")
    }
}

impl std::error::Error for SealError {}

pub fn parse_key(hex_key: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let bytes = hex::decode(hex_key.trim()).map_err(KeyError::Hex)?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| KeyError::Length(len))
}

#[derive(Clone)]
pub struct FrameSealer {
    cipher: Aes256Gcm,
}

impl FrameSealer {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    pub fn from_hex(hex_key: &str) -> Result<Self, KeyError> {
        Ok(Self::new(&parse_key(hex_key)?))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SealError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| SealError)?;

        let mut frame = Vec::with_capacity(NONCE_LEN + sealed.len());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }
}
