//! DarkStar frame codec.
//!
//! Wire format of one frame:
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────────┐
//! │ AEAD(length: u16 BE) (18)    │ AEAD(payload) (length + 16)      │
//! └──────────────────────────────┴──────────────────────────────────┘
//! ```
//!
//! Every AEAD call, in either direction, takes exactly one nonce from the
//! codec's private counter. The sender and the receiver therefore stay in
//! lockstep as long as frames are neither dropped nor reordered.

use bytes::{BufMut, Bytes, BytesMut};

use crate::crypto::{ciphertext_len, Aead, AeadKey, NonceSequence};
use crate::error::{Error, Result};
use crate::transport::{ENCRYPTED_LENGTH_SIZE, LENGTH_SIZE, MAX_PACK_SIZE};

/// One direction of a DarkStar session: a key plus its nonce counter.
///
/// After any decryption failure the codec is poisoned and refuses all
/// further work, because its counter no longer matches the peer's.
pub struct DarkStarCipher {
    aead: Aead,
    nonces: NonceSequence,
    poisoned: bool,
}

impl DarkStarCipher {
    /// Create a codec for a freshly derived key.
    pub fn new(key: &AeadKey) -> Self {
        Self {
            aead: Aead::new(key),
            nonces: NonceSequence::new(),
            poisoned: false,
        }
    }

    /// Encrypt one message under the next nonce.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.check_usable()?;
        let nonce = self.nonces.next_nonce()?;
        self.aead.encrypt(&nonce, plaintext)
    }

    /// Decrypt one message under the next nonce.
    ///
    /// The nonce is consumed even when authentication fails.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.check_usable()?;
        let nonce = self.nonces.next_nonce()?;
        self.aead.decrypt(&nonce, ciphertext).map_err(|e| {
            self.poisoned = true;
            e
        })
    }

    /// Seal a plaintext chunk into a complete frame.
    pub fn pack(&mut self, plaintext: &[u8]) -> Result<Bytes> {
        if plaintext.len() > MAX_PACK_SIZE {
            return Err(Error::PayloadTooLarge {
                len: plaintext.len(),
                max: MAX_PACK_SIZE,
            });
        }

        let length = (plaintext.len() as u16).to_be_bytes();
        let encrypted_length = self.encrypt(&length)?;
        let encrypted_payload = self.encrypt(plaintext)?;

        let mut frame = BytesMut::with_capacity(frame_len(plaintext.len()));
        frame.put_slice(&encrypted_length);
        frame.put_slice(&encrypted_payload);
        Ok(frame.freeze())
    }

    /// Open the 18-byte encrypted length header of a frame.
    ///
    /// Returns the plaintext length of the payload that follows.
    pub fn unpack_length(&mut self, header: &[u8; ENCRYPTED_LENGTH_SIZE]) -> Result<usize> {
        let plaintext = self.decrypt(header)?;
        if plaintext.len() != LENGTH_SIZE {
            self.poisoned = true;
            return Err(Error::InvalidLength(plaintext.len()));
        }

        let length = u16::from_be_bytes([plaintext[0], plaintext[1]]) as usize;
        if length > MAX_PACK_SIZE {
            self.poisoned = true;
            return Err(Error::InvalidLength(length));
        }
        Ok(length)
    }

    /// Open the encrypted payload of a frame (`length + 16` bytes).
    pub fn unpack_payload(&mut self, ciphertext: &[u8]) -> Result<Bytes> {
        self.decrypt(ciphertext).map(Bytes::from)
    }

    /// Whether a decryption failure has disabled this codec.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Number of nonces consumed so far.
    pub fn nonces_used(&self) -> u64 {
        self.nonces.issued()
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(Error::DecryptFailed);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn with_nonces(key: &AeadKey, nonces: NonceSequence) -> Self {
        Self {
            aead: Aead::new(key),
            nonces,
            poisoned: false,
        }
    }
}

impl std::fmt::Debug for DarkStarCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DarkStarCipher")
            .field("nonces_used", &self.nonces.issued())
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

/// The two codecs produced by a successful handshake.
#[derive(Debug)]
pub struct CipherPair {
    /// Seals outgoing frames
    pub send: DarkStarCipher,
    /// Opens incoming frames
    pub receive: DarkStarCipher,
}

impl CipherPair {
    /// Build a pair from the two directional keys.
    pub fn new(send_key: &AeadKey, receive_key: &AeadKey) -> Self {
        Self {
            send: DarkStarCipher::new(send_key),
            receive: DarkStarCipher::new(receive_key),
        }
    }
}

/// Wire size of a frame carrying `payload_len` plaintext bytes.
pub const fn frame_len(payload_len: usize) -> usize {
    ENCRYPTED_LENGTH_SIZE + ciphertext_len(payload_len)
}
