//! Error types for the Shadow transport.

use thiserror::Error;

/// Result type alias for Shadow operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during Shadow operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Cryptographic operation failed
    #[error("cryptographic error: {0}")]
    Crypto(String),

    /// Persistent public key could not be decoded or has the wrong shape
    #[error("invalid key format: {0}")]
    InvalidKeyFormat(String),

    /// Cipher name is not one we implement
    #[error("unsupported cipher: {0}")]
    UnsupportedCipher(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Peer closed the connection before a full handshake message arrived
    #[error("handshake incomplete: received {received} of 64 bytes")]
    HandshakeIncomplete {
        /// Bytes that arrived before the connection ended
        received: usize,
    },

    /// Handshake message was already seen by the replay filter
    #[error("replayed handshake detected")]
    ReplayDetected,

    /// Peer's confirmation code does not match the locally computed one
    #[error("handshake confirmation code mismatch")]
    ConfirmationMismatch,

    /// Received bytes are not a valid curve point
    #[error("invalid public key")]
    InvalidPublicKey,

    /// AEAD tag verification failed
    #[error("decryption failed")]
    DecryptFailed,

    /// Plaintext is too large for a single frame
    #[error("payload too large: {len} bytes (max {max})")]
    PayloadTooLarge {
        /// Size of the rejected plaintext
        len: usize,
        /// Largest plaintext one frame carries
        max: usize,
    },

    /// Decrypted frame length is not acceptable
    #[error("invalid frame length: {0}")]
    InvalidLength(usize),

    /// Nonce counter exhausted for this key
    #[error("nonce counter overflow")]
    CounterOverflow,

    /// Network I/O error
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    /// Writing a frame to the connection failed
    #[error("write failed: {0}")]
    WriteFailed(std::io::Error),

    /// Connection ended with nothing left to read
    #[error("end of stream")]
    EndOfStream,

    /// Session was closed
    #[error("session closed")]
    Closed,

    /// Connection or handshake timeout
    #[error("timeout after {0}ms")]
    Timeout(u64),

    /// Replay filter persistence failure
    #[error("replay filter error: {0}")]
    ReplayFilter(String),
}

impl Error {
    /// Create a new cryptographic error
    pub fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }

    /// Create a new key format error
    pub fn key_format(msg: impl Into<String>) -> Self {
        Error::InvalidKeyFormat(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new replay filter error
    pub fn replay_filter(msg: impl Into<String>) -> Self {
        Error::ReplayFilter(msg.into())
    }

    /// Check if a fresh connection and handshake could cure this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::DecryptFailed
                | Error::Network(_)
                | Error::HandshakeIncomplete { .. }
                | Error::Timeout(_)
        )
    }

    /// Check if this error must never be retried automatically.
    pub fn is_fatal_by_design(&self) -> bool {
        matches!(
            self,
            Error::ReplayDetected | Error::ConfirmationMismatch | Error::CounterOverflow
        )
    }
}
