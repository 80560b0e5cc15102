//! AES-256-GCM sealing for DarkStar frames.
//!
//! Uses AES-256-GCM with deterministic nonces (NIST SP 800-38D §8.2.1):
//! a 4-byte fixed field followed by a 64-bit big-endian invocation counter.

use std::fmt;

use aes_gcm::{
    aead::{Aead as AeadTrait, KeyInit},
    Aes256Gcm,
};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{KEY_SIZE, NONCE_PREFIX, NONCE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};

/// One direction's 256-bit session key, as output by the transcript hash.
///
/// Zeroized on drop and redacted in `Debug`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AeadKey([u8; KEY_SIZE]);

impl AeadKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes. Secret.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AeadKey(..)")
    }
}

/// A 96-bit AEAD nonce: `NONCE_PREFIX || counter (big-endian)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Nonce for invocation number `counter`.
    pub fn new(counter: u64) -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        bytes[..NONCE_PREFIX.len()].copy_from_slice(&NONCE_PREFIX);
        bytes[NONCE_PREFIX.len()..].copy_from_slice(&counter.to_be_bytes());
        Self(bytes)
    }

    /// The 12 nonce bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }

    /// Invocation counter carried in the low 8 bytes.
    pub fn counter(&self) -> u64 {
        let mut counter = [0u8; 8];
        counter.copy_from_slice(&self.0[NONCE_PREFIX.len()..]);
        u64::from_be_bytes(counter)
    }
}

/// Per-key nonce counter.
///
/// Starts at zero, hands out each value exactly once and refuses to wrap.
/// One sequence belongs to exactly one key; the two directions of a session
/// never share a sequence.
#[derive(Debug, Default)]
pub struct NonceSequence {
    next: u64,
}

impl NonceSequence {
    /// Create a sequence starting at zero.
    pub fn new() -> Self {
        Self { next: 0 }
    }

    #[cfg(test)]
    pub(crate) fn starting_at(next: u64) -> Self {
        Self { next }
    }

    /// Take the next nonce.
    ///
    /// The final counter value `u64::MAX` is never issued.
    pub fn next_nonce(&mut self) -> Result<Nonce> {
        if self.next == u64::MAX {
            return Err(Error::CounterOverflow);
        }
        let nonce = Nonce::new(self.next);
        self.next += 1;
        Ok(nonce)
    }

    /// Number of nonces issued so far.
    pub fn issued(&self) -> u64 {
        self.next
    }
}

/// AES-256-GCM AEAD cipher.
pub struct Aead {
    cipher: Aes256Gcm,
}

impl Aead {
    /// Key the cipher.
    pub fn new(key: &AeadKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.as_bytes().into()),
        }
    }

    /// Seal `plaintext`, returning `ciphertext || tag`.
    pub fn encrypt(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(nonce.as_bytes().into(), plaintext)
            .map_err(|_| Error::crypto("AES-GCM seal failed"))
    }

    /// Open `ciphertext || tag`.
    ///
    /// Every failure, including input shorter than a tag, is `DecryptFailed`.
    pub fn decrypt(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::DecryptFailed);
        }

        self.cipher
            .decrypt(nonce.as_bytes().into(), ciphertext)
            .map_err(|_| Error::DecryptFailed)
    }
}

/// Sealed size of a `plaintext_len`-byte plaintext.
pub const fn ciphertext_len(plaintext_len: usize) -> usize {
    plaintext_len + TAG_SIZE
}
