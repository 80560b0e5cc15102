//! P-256 key agreement primitives.
//!
//! Provides type-safe wrappers around NIST P-256 ECDH with automatic
//! zeroization of secret material on drop, plus the DarkStar public key
//! encoding (the 32-byte x-coordinate of an even-y point).

use std::fmt;

use p256::ecdh::diffie_hellman;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey as P256Public, SecretKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{random, COMPRESSED_KEY_SIZE, PUBLIC_KEY_SIZE, SHARED_SECRET_SIZE};
use crate::error::{Error, Result};

/// SEC1 tag for a compressed point with even y.
pub const TAG_EVEN: u8 = 0x02;

/// SEC1 tag for a compressed point with odd y.
pub const TAG_ODD: u8 = 0x03;

/// An ephemeral (single-handshake) P-256 secret key.
///
/// Generated fresh for each handshake attempt. The public half always has
/// an even y-coordinate so that its 32-byte DarkStar encoding is unambiguous.
/// Zeroized when dropped.
pub struct EphemeralSecret(SecretKey);

impl EphemeralSecret {
    /// Generate a new ephemeral secret with an even public point.
    pub fn random() -> Self {
        Self(random::even_secret_key())
    }

    /// Perform P-256 Diffie-Hellman key agreement.
    ///
    /// Borrows the secret because DarkStar runs two agreements with the
    /// same ephemeral key.
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> SharedSecret {
        SharedSecret::agree(&self.0, their_public)
    }

    /// Get the public half.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.public_key())
    }
}

impl From<&EphemeralSecret> for PublicKey {
    fn from(secret: &EphemeralSecret) -> Self {
        secret.public_key()
    }
}

/// A persistent (long-term) P-256 secret key.
///
/// Held by servers as their identity. Zeroized when dropped.
#[derive(Clone)]
pub struct StaticSecret(SecretKey);

impl StaticSecret {
    /// Generate a new random static secret.
    pub fn random() -> Self {
        Self(random::secret_key())
    }

    /// Create from a 32-byte big-endian scalar.
    ///
    /// Fails if the scalar is zero or not below the curve order.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        SecretKey::from_slice(bytes)
            .map(Self)
            .map_err(|_| Error::key_format("secret scalar out of range"))
    }

    /// Export the secret scalar.
    ///
    /// # Security
    ///
    /// Handle the returned bytes with care and zeroize when done.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes().into()
    }

    /// Perform P-256 Diffie-Hellman key agreement.
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> SharedSecret {
        SharedSecret::agree(&self.0, their_public)
    }

    /// Get the public half.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.public_key())
    }
}

impl From<&StaticSecret> for PublicKey {
    fn from(secret: &StaticSecret) -> Self {
        secret.public_key()
    }
}

/// A P-256 public key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicKey(P256Public);

impl PublicKey {
    /// Parse a SEC1 encoded point (compressed or uncompressed).
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self> {
        P256Public::from_sec1_bytes(bytes)
            .map(Self)
            .map_err(|_| Error::InvalidPublicKey)
    }

    /// Decode a DarkStar x-coordinate into the even point with that x.
    pub fn from_darkstar_bytes(bytes: &[u8; PUBLIC_KEY_SIZE]) -> Result<Self> {
        let mut compressed = [0u8; COMPRESSED_KEY_SIZE];
        compressed[0] = TAG_EVEN;
        compressed[1..].copy_from_slice(bytes);
        Self::from_sec1_bytes(&compressed)
    }

    /// SEC1 compressed encoding: `tag || x`.
    pub fn to_compressed(&self) -> [u8; COMPRESSED_KEY_SIZE] {
        let point = self.0.to_encoded_point(true);
        let mut out = [0u8; COMPRESSED_KEY_SIZE];
        out.copy_from_slice(point.as_bytes());
        out
    }

    /// DarkStar encoding: the x-coordinate with the sign byte stripped.
    pub fn to_darkstar_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        let mut out = [0u8; PUBLIC_KEY_SIZE];
        out.copy_from_slice(&self.to_compressed()[1..]);
        out
    }

    /// Whether the point's y-coordinate is even.
    pub fn is_even(&self) -> bool {
        self.to_compressed()[0] == TAG_EVEN
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.to_darkstar_bytes()))
    }
}

/// The x-coordinate produced by a P-256 Diffie-Hellman agreement.
///
/// Automatically zeroized when dropped.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; SHARED_SECRET_SIZE]);

impl SharedSecret {
    fn agree(secret: &SecretKey, their_public: &PublicKey) -> Self {
        let shared = diffie_hellman(secret.to_nonzero_scalar(), their_public.0.as_affine());
        let mut out = [0u8; SHARED_SECRET_SIZE];
        out.copy_from_slice(shared.raw_secret_bytes());
        Self(out)
    }

    /// Get the raw shared secret bytes.
    ///
    /// # Security
    ///
    /// Only ever fed into a transcript hash, never used directly as a key.
    pub fn as_bytes(&self) -> &[u8; SHARED_SECRET_SIZE] {
        &self.0
    }
}
