//! DarkStar key derivation.
//!
//! Both directional session keys and both confirmation codes are single
//! SHA-256 digests over a fixed transcript. Field order is part of the wire
//! protocol and must not change.

use sha2::{Digest, Sha256};

use crate::crypto::{AeadKey, PublicKey, SharedSecret, CONFIRMATION_CODE_SIZE};

/// Protocol label mixed into every transcript.
pub const DARKSTAR_LABEL: &[u8] = b"DarkStar";

/// Label of the client party.
pub const CLIENT_LABEL: &[u8] = b"client";

/// Label of the server party.
pub const SERVER_LABEL: &[u8] = b"server";

/// Direction of traffic protected by a session key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Traffic sent by the client
    ClientToServer,
    /// Traffic sent by the server
    ServerToClient,
}

impl Direction {
    /// Transcript tag for this direction.
    ///
    /// The tags are swapped relative to the direction names: client-to-server
    /// keys are tagged `"server"` (the receiving party).
    pub fn tag(self) -> &'static [u8] {
        match self {
            Direction::ClientToServer => SERVER_LABEL,
            Direction::ServerToClient => CLIENT_LABEL,
        }
    }
}

/// Party whose confirmation code is being computed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Party {
    /// The connecting party
    Client,
    /// The listening party
    Server,
}

impl Party {
    /// Transcript tag for this party.
    pub fn tag(self) -> &'static [u8] {
        match self {
            Party::Client => CLIENT_LABEL,
            Party::Server => SERVER_LABEL,
        }
    }
}

/// Inputs shared by every DarkStar transcript for one handshake.
pub struct Transcript<'a> {
    /// `ip || port_be16` of the server
    pub server_identifier: &'a [u8],
    /// Client's ephemeral public key
    pub client_ephemeral: &'a PublicKey,
    /// Agreement between the client ephemeral key and the server persistent key
    pub ephemeral_persistent: &'a SharedSecret,
}

impl Transcript<'_> {
    /// Derive the session key for one direction.
    ///
    /// `SHA256(ecdh(e,e) || ecdh(e,s) || serverId || clientEphPub ||
    /// serverEphPub || "DarkStar" || direction.tag())`
    pub fn shared_key(
        &self,
        direction: Direction,
        ephemeral_ephemeral: &SharedSecret,
        server_ephemeral: &PublicKey,
    ) -> AeadKey {
        let mut hasher = Sha256::new();
        hasher.update(ephemeral_ephemeral.as_bytes());
        hasher.update(self.ephemeral_persistent.as_bytes());
        hasher.update(self.server_identifier);
        hasher.update(self.client_ephemeral.to_darkstar_bytes());
        hasher.update(server_ephemeral.to_darkstar_bytes());
        hasher.update(DARKSTAR_LABEL);
        hasher.update(direction.tag());

        AeadKey::from_bytes(hasher.finalize().into())
    }

    /// Compute a party's confirmation code.
    ///
    /// `SHA256(ecdh(e,s) || serverId || serverPersistentPub || clientEphPub ||
    /// "DarkStar" || party.tag())`
    pub fn confirmation_code(
        &self,
        party: Party,
        server_persistent: &PublicKey,
    ) -> [u8; CONFIRMATION_CODE_SIZE] {
        let mut hasher = Sha256::new();
        hasher.update(self.ephemeral_persistent.as_bytes());
        hasher.update(self.server_identifier);
        hasher.update(server_persistent.to_darkstar_bytes());
        hasher.update(self.client_ephemeral.to_darkstar_bytes());
        hasher.update(DARKSTAR_LABEL);
        hasher.update(party.tag());

        hasher.finalize().into()
    }
}

/// Compare two byte strings without early exit.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
