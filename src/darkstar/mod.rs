//! DarkStar Protocol Implementation.
//!
//! DarkStar is a one-round-trip authenticated key exchange whose wire bytes
//! are indistinguishable from random:
//!
//! 1. **Client → Server**: `clientEphemeralPub(32) || clientConfirmation(32)`
//! 2. **Server → Client**: `serverEphemeralPub(32) || serverConfirmation(32)`
//!
//! Public keys travel as bare P-256 x-coordinates (always the even point),
//! and confirmation codes are SHA-256 digests, so neither message carries
//! any recognizable structure.
//!
//! ## Key schedule
//!
//! ```text
//! ee = ECDH(clientEph, serverEph)
//! es = ECDH(clientEph, serverPersistent)
//!
//! clientConfirmation = SHA256(es || serverId || serverPersistentPub || clientEphPub || "DarkStar" || "client")
//! serverConfirmation = SHA256(es || serverId || serverPersistentPub || clientEphPub || "DarkStar" || "server")
//!
//! clientToServerKey  = SHA256(ee || es || serverId || clientEphPub || serverEphPub || "DarkStar" || "server")
//! serverToClientKey  = SHA256(ee || es || serverId || clientEphPub || serverEphPub || "DarkStar" || "client")
//! ```

mod client;
mod config;
mod handshake;

pub use client::ShadowClient;
pub use config::{CipherMode, ClientOptions, RedialPolicy, ShadowConfig, ShadowConfigFile};
pub use handshake::{
    client_handshake, server_handshake, ClientHandshake, HandshakeMessage, ServerHandshake,
};

use std::net::{IpAddr, SocketAddr};

/// Size of a handshake message in either direction.
pub const HANDSHAKE_SIZE: usize = 64;

/// Wire name of the only supported cipher mode.
pub const DARKSTAR_CIPHER_NAME: &str = "DarkStar";

/// The server address as mixed into every transcript: `ip || port (u16 BE)`.
///
/// 6 bytes for IPv4, 18 for IPv6. Both parties must build it from the same
/// address, so a client that dials through a different address than the
/// server listens on fails confirmation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerIdentifier(Vec<u8>);

impl ServerIdentifier {
    /// Build the identifier for `ip:port`.
    pub fn new(ip: IpAddr, port: u16) -> Self {
        let mut bytes = match ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        };
        bytes.extend_from_slice(&port.to_be_bytes());
        Self(bytes)
    }

    /// Raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<SocketAddr> for ServerIdentifier {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}
