//! Client configuration.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::crypto::{PublicKey, COMPRESSED_KEY_SIZE, TAG_EVEN, TAG_ODD};
use crate::darkstar::{ServerIdentifier, DARKSTAR_CIPHER_NAME};
use crate::error::{Error, Result};

/// Cipher suite selector.
///
/// Only DarkStar is live; new variants slot in here without touching the
/// handshake or framing code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CipherMode {
    /// P-256 DarkStar handshake with AES-256-GCM frames
    DarkStar,
}

impl CipherMode {
    /// Wire/config name of the mode.
    pub fn name(self) -> &'static str {
        match self {
            CipherMode::DarkStar => DARKSTAR_CIPHER_NAME,
        }
    }
}

impl FromStr for CipherMode {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            DARKSTAR_CIPHER_NAME => Ok(CipherMode::DarkStar),
            other => Err(Error::UnsupportedCipher(other.to_string())),
        }
    }
}

impl fmt::Display for CipherMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Validated client configuration.
///
/// Immutable once built; every check runs in the constructor, before any
/// network I/O.
#[derive(Clone, Debug)]
pub struct ShadowConfig {
    server_public_key: PublicKey,
    cipher: CipherMode,
    server_ip: IpAddr,
    port: u16,
}

impl ShadowConfig {
    /// Build a configuration from its textual form.
    ///
    /// `password` is the base64 of the server's 33-byte SEC1 compressed
    /// persistent public key (`0x02|0x03 || x`).
    pub fn new(password: &str, cipher_name: &str, server_ip: &str, port: u16) -> Result<Self> {
        let server_public_key = decode_password(password)?;
        let cipher = cipher_name.parse()?;
        let server_ip = server_ip
            .parse()
            .map_err(|e| Error::config(format!("Invalid server IP {:?}: {}", server_ip, e)))?;

        Ok(Self {
            server_public_key,
            cipher,
            server_ip,
            port,
        })
    }

    /// Build a configuration from already-parsed parts.
    pub fn from_parts(
        server_public_key: PublicKey,
        cipher: CipherMode,
        server_ip: IpAddr,
        port: u16,
    ) -> Self {
        Self {
            server_public_key,
            cipher,
            server_ip,
            port,
        }
    }

    /// Parse a JSON document (`password`, `cipherName`, `serverIP`, `port`).
    pub fn from_json(json: &str) -> Result<Self> {
        let file: ShadowConfigFile = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("Invalid config JSON: {}", e)))?;
        file.to_config()
    }

    /// Server's persistent public key.
    pub fn server_public_key(&self) -> &PublicKey {
        &self.server_public_key
    }

    /// Selected cipher mode.
    pub fn cipher(&self) -> CipherMode {
        self.cipher
    }

    /// Server IP address.
    pub fn server_ip(&self) -> IpAddr {
        self.server_ip
    }

    /// Server port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address to dial.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server_ip, self.port)
    }

    /// Identifier mixed into the handshake transcripts.
    pub fn server_identifier(&self) -> ServerIdentifier {
        ServerIdentifier::new(self.server_ip, self.port)
    }

    /// Re-encode the server key as a password string.
    pub fn password(&self) -> String {
        encode_password(&self.server_public_key)
    }
}

/// Encode a persistent public key as a config password.
pub(crate) fn encode_password(key: &PublicKey) -> String {
    STANDARD.encode(key.to_compressed())
}

fn decode_password(password: &str) -> Result<PublicKey> {
    let bytes = STANDARD
        .decode(password.trim())
        .map_err(|e| Error::key_format(format!("password is not valid base64: {}", e)))?;

    if bytes.len() != COMPRESSED_KEY_SIZE {
        return Err(Error::key_format(format!(
            "expected a {}-byte compressed P-256 key, got {} bytes",
            COMPRESSED_KEY_SIZE,
            bytes.len()
        )));
    }
    if bytes[0] != TAG_EVEN && bytes[0] != TAG_ODD {
        return Err(Error::key_format(format!(
            "unrecognized key type tag 0x{:02x}",
            bytes[0]
        )));
    }

    PublicKey::from_sec1_bytes(&bytes)
        .map_err(|_| Error::key_format("password is not a valid P-256 point"))
}

/// Configuration file format for serialization.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShadowConfigFile {
    /// Server persistent public key (base64, 33-byte compressed point)
    pub password: String,
    /// Cipher mode name
    #[serde(rename = "cipherName")]
    pub cipher_name: String,
    /// Server IP literal
    #[serde(rename = "serverIP")]
    pub server_ip: String,
    /// Server port
    pub port: u16,
}

impl ShadowConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ShadowConfig> {
        ShadowConfig::new(&self.password, &self.cipher_name, &self.server_ip, self.port)
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &ShadowConfig) -> Self {
        Self {
            password: config.password(),
            cipher_name: config.cipher().name().to_string(),
            server_ip: config.server_ip().to_string(),
            port: config.port(),
        }
    }
}

impl TryFrom<ShadowConfigFile> for ShadowConfig {
    type Error = Error;

    fn try_from(file: ShadowConfigFile) -> Result<Self> {
        file.to_config()
    }
}

/// Automatic reconnect behaviour of a client session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RedialPolicy {
    /// Consecutive redials allowed after decryption failures (0 disables)
    pub max_redials: u32,
}

impl RedialPolicy {
    /// Never redial.
    pub fn disabled() -> Self {
        Self { max_redials: 0 }
    }

    /// Allow up to `max_redials` consecutive redials.
    pub fn up_to(max_redials: u32) -> Self {
        Self { max_redials }
    }

    /// Whether any redial is allowed.
    pub fn is_enabled(&self) -> bool {
        self.max_redials > 0
    }
}

/// Client connection options.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Handshake round-trip timeout (`None` waits forever)
    pub handshake_timeout: Option<Duration>,
    /// Redial policy
    pub redial: RedialPolicy,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Some(Duration::from_secs(10)),
            redial: RedialPolicy::default(),
        }
    }
}
