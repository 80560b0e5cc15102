//! Cryptographic primitives for Shadow.
//!
//! This module provides:
//! - P-256 Elliptic Curve Diffie-Hellman key agreement
//! - AES-256-GCM AEAD encryption with counter nonces
//! - SHA-256 DarkStar transcripts for keys and confirmation codes
//! - Secret key sampling from OS entropy
//!
//! All secret material is zeroized on drop to prevent memory leakage.

mod aead;
pub mod kdf;
mod keys;
mod random;

pub use aead::{ciphertext_len, Aead, AeadKey, Nonce, NonceSequence};
pub use kdf::{constant_time_eq, Direction, Party, Transcript};
pub use keys::{EphemeralSecret, PublicKey, SharedSecret, StaticSecret, TAG_EVEN, TAG_ODD};

/// Size of symmetric keys in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of AEAD nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Fixed field of every nonce
pub const NONCE_PREFIX: [u8; 4] = [0x1a, 0x1a, 0x1a, 0x1a];

/// Size of AEAD authentication tag in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Size of a DarkStar public key (x-coordinate only)
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of a SEC1 compressed P-256 point
pub const COMPRESSED_KEY_SIZE: usize = 33;

/// Size of a P-256 ECDH output
pub const SHARED_SECRET_SIZE: usize = 32;

/// Size of a confirmation code (SHA-256 digest)
pub const CONFIRMATION_CODE_SIZE: usize = 32;
