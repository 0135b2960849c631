//! The per-session datagram envelope.
//!
//! QUIC already encrypts the transport; this is the application-level
//! layer inside it, one fresh XChaCha20-Poly1305 key per session. Wire
//! form: `nonce(24) || ciphertext || tag(16)`, empty AAD. The 24-byte
//! nonces come from the process RNG per packet, which makes collision
//! probability negligible without any counter state.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use thiserror::Error;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("datagram of {len} bytes is shorter than the nonce")]
    TooShort { len: usize },

    #[error("encryption failed")]
    Seal,

    #[error("decryption failed")]
    Open,
}

pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::rng().fill_bytes(&mut key);
    key
}

pub struct SessionCipher {
    aead: XChaCha20Poly1305,
}

impl SessionCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            aead: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Encrypts one packet under a fresh random nonce; the nonce is
    /// prepended to the ciphertext.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let ciphertext = self
            .aead
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Seal)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Splits the nonce prefix and authenticates the rest.
    pub fn open(&self, datagram: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if datagram.len() < NONCE_LEN {
            return Err(CryptoError::TooShort {
                len: datagram.len(),
            });
        }
        let (nonce, ciphertext) = datagram.split_at(NONCE_LEN);
        self.aead
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Open)
    }
}
