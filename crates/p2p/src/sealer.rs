//! Symmetric sealing of gossip payloads

use crate::error::SealError;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;

const NONCE_LEN: usize = 24;

/// Seals and opens payloads with a 32 byte key
pub trait Sealer: Send + Sync {
    fn seal(&self, plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, SealError>;
    fn open(&self, sealed: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, SealError>;
}

/// XChaCha20-Poly1305 with a random nonce prepended to the ciphertext
#[derive(Debug, Default, Clone, Copy)]
pub struct XChaChaSealer;

impl Sealer for XChaChaSealer {
    fn seal(&self, plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, SealError> {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| SealError::Seal)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, sealed: &[u8], key: &[u8; 32]) -> Result<Vec<u8>, SealError> {
        if sealed.len() < NONCE_LEN {
            return Err(SealError::Open);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
        cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| SealError::Open)
    }
}

/// Pass-through sealer for insecure mode and tests
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainSealer;

impl Sealer for PlainSealer {
    fn seal(&self, plaintext: &[u8], _key: &[u8; 32]) -> Result<Vec<u8>, SealError> {
        Ok(plaintext.to_vec())
    }

    fn open(&self, sealed: &[u8], _key: &[u8; 32]) -> Result<Vec<u8>, SealError> {
        Ok(sealed.to_vec())
    }
}
