//! # Shadow
//!
//! An encrypted, authenticated stream transport whose bytes on the wire are
//! indistinguishable from uniform random data.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Application Layer                     │
//! ├─────────────────────────────────────────────────────────┤
//! │  ShadowStream (framed reads/writes, optional redial)    │
//! ├─────────────────────────────────────────────────────────┤
//! │  DarkStar handshake (mutual confirmation + replay)      │
//! ├─────────────────────────────────────────────────────────┤
//! │  Frame codec (sealed length || sealed payload)          │
//! ├─────────────────────────────────────────────────────────┤
//! │  Crypto Layer (P-256 ECDH, SHA-256, AES-256-GCM)        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Goals
//!
//! 1. **Unobservability**: Handshake messages are bare curve coordinates and
//!    hashes, frames are AEAD output, nothing is sent in the clear
//! 2. **Forward Secrecy**: Per-connection ephemeral keys on both sides
//! 3. **Server Authentication**: A client only proceeds after the server has
//!    proven knowledge of its persistent secret
//! 4. **Replay Resistance**: Handshake messages seen before are refused

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod crypto;
pub mod darkstar;
pub mod error;
pub mod replay;
pub mod transport;

#[cfg(feature = "server")]
pub mod server;

pub use darkstar::{CipherMode, ClientOptions, RedialPolicy, ShadowClient, ShadowConfig};
pub use error::{Error, Result};
pub use replay::ReplayFilter;
pub use transport::ShadowStream;

#[cfg(feature = "server")]
pub use server::{ServerConfig, ShadowServer};

/// Crate version, as published.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
