//! DarkStar handshake engine.
//!
//! [`ClientHandshake`] and [`ServerHandshake`] are pure state machines over
//! 64-byte messages; [`client_handshake`] and [`server_handshake`] drive them
//! over any async byte stream.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::crypto::{
    constant_time_eq, Direction, EphemeralSecret, Party, PublicKey, StaticSecret, Transcript,
    CONFIRMATION_CODE_SIZE, PUBLIC_KEY_SIZE,
};
use crate::darkstar::{ServerIdentifier, ShadowConfig, HANDSHAKE_SIZE};
use crate::error::{Error, Result};
use crate::replay::ReplayFilter;
use crate::transport::{read_full, CipherPair};

/// One direction's handshake message: `ephemeralPub(32) || confirmation(32)`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct HandshakeMessage {
    ephemeral: [u8; PUBLIC_KEY_SIZE],
    confirmation: [u8; CONFIRMATION_CODE_SIZE],
}

impl HandshakeMessage {
    /// Assemble a message from its two halves.
    pub fn new(ephemeral: &PublicKey, confirmation: [u8; CONFIRMATION_CODE_SIZE]) -> Self {
        Self {
            ephemeral: ephemeral.to_darkstar_bytes(),
            confirmation,
        }
    }

    /// Split 64 wire bytes into their halves.
    pub fn from_bytes(bytes: &[u8; HANDSHAKE_SIZE]) -> Self {
        let mut ephemeral = [0u8; PUBLIC_KEY_SIZE];
        let mut confirmation = [0u8; CONFIRMATION_CODE_SIZE];
        ephemeral.copy_from_slice(&bytes[..PUBLIC_KEY_SIZE]);
        confirmation.copy_from_slice(&bytes[PUBLIC_KEY_SIZE..]);
        Self {
            ephemeral,
            confirmation,
        }
    }

    /// Encode for the wire.
    pub fn to_bytes(&self) -> [u8; HANDSHAKE_SIZE] {
        let mut out = [0u8; HANDSHAKE_SIZE];
        out[..PUBLIC_KEY_SIZE].copy_from_slice(&self.ephemeral);
        out[PUBLIC_KEY_SIZE..].copy_from_slice(&self.confirmation);
        out
    }

    /// Decode the sender's ephemeral public key.
    ///
    /// Fails with `InvalidPublicKey` when the x-coordinate is not on the curve.
    pub fn ephemeral_key(&self) -> Result<PublicKey> {
        PublicKey::from_darkstar_bytes(&self.ephemeral)
    }

    /// The sender's confirmation code.
    pub fn confirmation_code(&self) -> &[u8; CONFIRMATION_CODE_SIZE] {
        &self.confirmation
    }

    /// Run this message through the replay filter.
    fn check_replay(&self, filter: &ReplayFilter) -> Result<()> {
        if filter.check_and_insert(&self.to_bytes()) {
            return Err(Error::ReplayDetected);
        }
        Ok(())
    }
}

impl std::fmt::Debug for HandshakeMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandshakeMessage")
            .field("ephemeral", &hex::encode(self.ephemeral))
            .finish_non_exhaustive()
    }
}

/// Client side of one handshake attempt.
///
/// Owns the ephemeral secret; consuming the handshake with
/// [`ClientHandshake::finish`] drops it.
pub struct ClientHandshake {
    ephemeral: EphemeralSecret,
    server_persistent: PublicKey,
    server_identifier: ServerIdentifier,
    message: HandshakeMessage,
}

impl ClientHandshake {
    /// Start a handshake towards the server described by `config`.
    pub fn new(config: &ShadowConfig) -> Self {
        Self::with_server(config.server_public_key().clone(), config.server_identifier())
    }

    /// Start a handshake towards an explicit server key and identifier.
    pub fn with_server(server_persistent: PublicKey, server_identifier: ServerIdentifier) -> Self {
        let ephemeral = EphemeralSecret::random();
        let client_public = ephemeral.public_key();
        let ephemeral_persistent = ephemeral.diffie_hellman(&server_persistent);

        let transcript = Transcript {
            server_identifier: server_identifier.as_bytes(),
            client_ephemeral: &client_public,
            ephemeral_persistent: &ephemeral_persistent,
        };
        let confirmation = transcript.confirmation_code(Party::Client, &server_persistent);

        Self {
            message: HandshakeMessage::new(&client_public, confirmation),
            ephemeral,
            server_persistent,
            server_identifier,
        }
    }

    /// The message to send to the server.
    pub fn message(&self) -> &HandshakeMessage {
        &self.message
    }

    /// Process the server's reply and derive the session codecs.
    ///
    /// Order: replay check, key derivation, then confirmation check.
    pub fn finish(self, reply: &HandshakeMessage, filter: &ReplayFilter) -> Result<CipherPair> {
        reply.check_replay(filter)?;

        let client_public = self.ephemeral.public_key();
        let server_ephemeral = reply.ephemeral_key()?;
        let ephemeral_ephemeral = self.ephemeral.diffie_hellman(&server_ephemeral);
        let ephemeral_persistent = self.ephemeral.diffie_hellman(&self.server_persistent);

        let transcript = Transcript {
            server_identifier: self.server_identifier.as_bytes(),
            client_ephemeral: &client_public,
            ephemeral_persistent: &ephemeral_persistent,
        };
        let send_key = transcript.shared_key(
            Direction::ClientToServer,
            &ephemeral_ephemeral,
            &server_ephemeral,
        );
        let receive_key = transcript.shared_key(
            Direction::ServerToClient,
            &ephemeral_ephemeral,
            &server_ephemeral,
        );

        let expected = transcript.confirmation_code(Party::Server, &self.server_persistent);
        if !constant_time_eq(&expected, reply.confirmation_code()) {
            return Err(Error::ConfirmationMismatch);
        }

        Ok(CipherPair::new(&send_key, &receive_key))
    }
}

/// Server side of the handshake, bound to the server's persistent identity.
pub struct ServerHandshake<'a> {
    persistent: &'a StaticSecret,
    server_identifier: &'a ServerIdentifier,
}

impl<'a> ServerHandshake<'a> {
    /// Create a responder for the given identity and listen address.
    pub fn new(persistent: &'a StaticSecret, server_identifier: &'a ServerIdentifier) -> Self {
        Self {
            persistent,
            server_identifier,
        }
    }

    /// Validate a client's message and produce the reply plus session codecs.
    ///
    /// Order: replay check, client confirmation check, fresh ephemeral,
    /// key derivation.
    pub fn respond(
        &self,
        request: &HandshakeMessage,
        filter: &ReplayFilter,
    ) -> Result<(HandshakeMessage, CipherPair)> {
        request.check_replay(filter)?;

        let client_public = request.ephemeral_key()?;
        let server_public = self.persistent.public_key();
        let ephemeral_persistent = self.persistent.diffie_hellman(&client_public);

        let transcript = Transcript {
            server_identifier: self.server_identifier.as_bytes(),
            client_ephemeral: &client_public,
            ephemeral_persistent: &ephemeral_persistent,
        };

        let expected = transcript.confirmation_code(Party::Client, &server_public);
        if !constant_time_eq(&expected, request.confirmation_code()) {
            return Err(Error::ConfirmationMismatch);
        }

        let ephemeral = EphemeralSecret::random();
        let server_ephemeral = ephemeral.public_key();
        let ephemeral_ephemeral = ephemeral.diffie_hellman(&client_public);

        let reply = HandshakeMessage::new(
            &server_ephemeral,
            transcript.confirmation_code(Party::Server, &server_public),
        );

        let send_key = transcript.shared_key(
            Direction::ServerToClient,
            &ephemeral_ephemeral,
            &server_ephemeral,
        );
        let receive_key = transcript.shared_key(
            Direction::ClientToServer,
            &ephemeral_ephemeral,
            &server_ephemeral,
        );

        Ok((reply, CipherPair::new(&send_key, &receive_key)))
    }
}

/// Read exactly one handshake message, or report how much arrived.
async fn read_message<S>(io: &mut S) -> Result<HandshakeMessage>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; HANDSHAKE_SIZE];
    let received = read_full(io, &mut buf).await?;
    if received < HANDSHAKE_SIZE {
        return Err(Error::HandshakeIncomplete { received });
    }
    Ok(HandshakeMessage::from_bytes(&buf))
}

/// Run the client role over `io`.
///
/// Sends the client message, waits for the 64-byte reply and returns the
/// session codecs. Has no timeout of its own.
pub async fn client_handshake<S>(
    io: &mut S,
    config: &ShadowConfig,
    filter: &ReplayFilter,
) -> Result<CipherPair>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let handshake = ClientHandshake::new(config);
    io.write_all(&handshake.message().to_bytes()).await?;
    io.flush().await?;

    let reply = read_message(io).await?;
    let ciphers = handshake.finish(&reply, filter)?;

    tracing::debug!(
        "DarkStar client handshake complete with {}:{} (server key {})",
        config.server_ip(),
        config.port(),
        config.server_public_key()
    );
    Ok(ciphers)
}

/// Run the server role over `io`.
pub async fn server_handshake<S>(
    io: &mut S,
    persistent: &StaticSecret,
    server_identifier: &ServerIdentifier,
    filter: &ReplayFilter,
) -> Result<CipherPair>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let request = read_message(io).await?;
    let (reply, ciphers) =
        ServerHandshake::new(persistent, server_identifier).respond(&request, filter)?;

    io.write_all(&reply.to_bytes()).await?;
    io.flush().await?;

    tracing::debug!("DarkStar server handshake complete");
    Ok(ciphers)
}
