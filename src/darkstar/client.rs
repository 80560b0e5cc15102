//! Shadow client.
//!
//! Dials the configured server over TCP, runs the DarkStar client handshake
//! and hands back an established [`ShadowStream`].

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::darkstar::{client_handshake, ClientOptions, ShadowConfig};
use crate::error::{Error, Result};
use crate::replay::ReplayFilter;
use crate::transport::{Dialed, Endpoint, Redialer, ShadowStream};

/// Shadow protocol client.
pub struct ShadowClient {
    config: Arc<ShadowConfig>,
    options: ClientOptions,
    replay_filter: Arc<ReplayFilter>,
}

impl ShadowClient {
    /// Create a client with default options and its own replay filter.
    pub fn new(config: ShadowConfig) -> Self {
        Self::with_options(config, ClientOptions::default())
    }

    /// Create a client with custom options.
    pub fn with_options(config: ShadowConfig, options: ClientOptions) -> Self {
        Self {
            config: Arc::new(config),
            options,
            replay_filter: Arc::new(ReplayFilter::new()),
        }
    }

    /// Share a replay filter with other clients.
    pub fn with_replay_filter(mut self, filter: Arc<ReplayFilter>) -> Self {
        self.replay_filter = filter;
        self
    }

    /// Get the client configuration.
    pub fn config(&self) -> &ShadowConfig {
        &self.config
    }

    /// Get the connection options.
    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Connect and handshake.
    ///
    /// When the redial policy is enabled the returned stream can reconnect
    /// by itself after a decryption failure.
    pub async fn connect(&self) -> Result<ShadowStream<TcpStream>> {
        let dialed = dial(&self.config, &self.options, &self.replay_filter).await?;
        tracing::info!(
            "Connected to Shadow server {} ({})",
            self.config.socket_addr(),
            self.config.cipher()
        );

        let stream = ShadowStream::from_dialed(dialed);
        if !self.options.redial.is_enabled() {
            return Ok(stream);
        }

        let config = Arc::clone(&self.config);
        let options = self.options.clone();
        let filter = Arc::clone(&self.replay_filter);
        let redialer: Redialer<TcpStream> = Box::new(move || {
            let config = Arc::clone(&config);
            let options = options.clone();
            let filter = Arc::clone(&filter);
            async move { dial(&config, &options, &filter).await }.boxed()
        });

        Ok(stream.with_redial(redialer, self.options.redial))
    }
}

/// Open a TCP connection and run the client handshake on it.
async fn dial(
    config: &ShadowConfig,
    options: &ClientOptions,
    filter: &ReplayFilter,
) -> Result<Dialed<TcpStream>> {
    let addr = config.socket_addr();

    let mut stream = timeout(options.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| timeout_error(options.connect_timeout))?
        .map_err(Error::Network)?;
    stream.set_nodelay(true)?;

    let endpoint = Endpoint {
        local: stream.local_addr()?,
        peer: stream.peer_addr()?,
    };

    let handshake = client_handshake(&mut stream, config, filter);
    let ciphers = match options.handshake_timeout {
        Some(limit) => timeout(limit, handshake)
            .await
            .map_err(|_| timeout_error(limit))??,
        None => handshake.await?,
    };

    Ok(Dialed {
        io: stream,
        ciphers,
        endpoint: Some(endpoint),
    })
}

fn timeout_error(limit: Duration) -> Error {
    Error::Timeout(limit.as_millis() as u64)
}
