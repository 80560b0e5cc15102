//! Server configuration.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::{PublicKey, StaticSecret};
use crate::darkstar::{CipherMode, ServerIdentifier, ShadowConfig};
use crate::error::{Error, Result};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Listen address; also the address clients put in their config
    pub listen_ip: IpAddr,
    /// Listen port (0 picks a free port)
    pub listen_port: u16,
    /// Server's persistent secret key
    pub static_secret: StaticSecret,
    /// Cipher mode
    pub cipher: CipherMode,
    /// Where the replay filter is loaded from and saved to
    pub replay_filter_path: Option<PathBuf>,
    /// Per-connection handshake timeout
    pub handshake_timeout: Option<Duration>,
}

impl ServerConfig {
    /// Create a new configuration with a random keypair.
    pub fn new_random(listen_ip: IpAddr, listen_port: u16) -> Self {
        Self {
            listen_ip,
            listen_port,
            static_secret: StaticSecret::random(),
            cipher: CipherMode::DarkStar,
            replay_filter_path: None,
            handshake_timeout: Some(Duration::from_secs(10)),
        }
    }

    /// Get the server's persistent public key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.static_secret)
    }

    /// Configured listen address.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }

    /// Identifier for the configured listen address.
    ///
    /// Fails when `listen_port` is 0: the real port is only known after
    /// binding, so ask the bound [`ShadowServer`](super::ShadowServer).
    pub fn server_identifier(&self) -> Result<ServerIdentifier> {
        let port = self.fixed_port()?;
        Ok(ServerIdentifier::new(self.listen_ip, port))
    }

    /// Generate the matching client configuration.
    ///
    /// Fails when `listen_port` is 0; use
    /// [`ShadowServer::client_config`](super::ShadowServer::client_config).
    pub fn client_config(&self) -> Result<ShadowConfig> {
        let port = self.fixed_port()?;
        Ok(ShadowConfig::from_parts(
            self.public_key(),
            self.cipher,
            self.listen_ip,
            port,
        ))
    }

    fn fixed_port(&self) -> Result<u16> {
        match self.listen_port {
            0 => Err(Error::config(
                "listen_port 0 is assigned at bind time; take the address from the bound server",
            )),
            port => Ok(port),
        }
    }

    /// Validate the configuration.
    ///
    /// The listen IP is part of every handshake transcript, so it has to be
    /// the exact address clients dial; wildcard addresses never match.
    pub fn validate(&self) -> Result<()> {
        if self.listen_ip.is_unspecified() {
            return Err(Error::config(
                "listen_ip must be the address clients connect to, not a wildcard",
            ));
        }
        if self.handshake_timeout == Some(Duration::ZERO) {
            return Err(Error::config("handshake_timeout cannot be zero"));
        }
        Ok(())
    }
}

/// Configuration file format for serialization.
#[derive(Serialize, Deserialize)]
pub struct ServerConfigFile {
    /// Listen address
    pub listen_ip: String,
    /// Listen port
    pub listen_port: u16,
    /// Server's persistent secret scalar (base64)
    pub static_secret_b64: String,
    /// Cipher mode name
    #[serde(default = "default_cipher_name")]
    pub cipher_name: String,
    /// Replay filter file
    #[serde(default)]
    pub replay_filter_path: Option<String>,
    /// Handshake timeout (seconds, 0 disables)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

fn default_cipher_name() -> String {
    CipherMode::DarkStar.name().to_string()
}

fn default_handshake_timeout() -> u64 {
    10
}

impl ServerConfigFile {
    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ServerConfig> {
        use base64::{engine::general_purpose::STANDARD, Engine};

        let secret_bytes = STANDARD
            .decode(&self.static_secret_b64)
            .map_err(|e| Error::key_format(format!("Invalid base64 secret: {}", e)))?;

        let secret_arr: [u8; 32] = secret_bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::key_format("static_secret must be 32 bytes"))?;

        let listen_ip = self
            .listen_ip
            .parse()
            .map_err(|e| Error::config(format!("Invalid listen IP: {}", e)))?;

        Ok(ServerConfig {
            listen_ip,
            listen_port: self.listen_port,
            static_secret: StaticSecret::from_bytes(&secret_arr)?,
            cipher: self.cipher_name.parse()?,
            replay_filter_path: self.replay_filter_path.as_ref().map(PathBuf::from),
            handshake_timeout: match self.handshake_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        })
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        use base64::{engine::general_purpose::STANDARD, Engine};

        Self {
            listen_ip: config.listen_ip.to_string(),
            listen_port: config.listen_port,
            static_secret_b64: STANDARD.encode(config.static_secret.to_bytes()),
            cipher_name: config.cipher.name().to_string(),
            replay_filter_path: config
                .replay_filter_path
                .as_ref()
                .map(|p| p.display().to_string()),
            handshake_timeout_secs: config.handshake_timeout.map_or(0, |t| t.as_secs()),
        }
    }
}
