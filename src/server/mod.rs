//! Shadow Server Module.
//!
//! Accepts TCP connections and runs the server role of the DarkStar
//! handshake on each one in its own task:
//!
//! 1. **Replay Protection**: one [`ReplayFilter`] shared by every handshake
//!    on the listener, optionally persisted across restarts
//! 2. **Per-Connection Tasks**: a slow or hostile client only stalls itself
//! 3. **Metrics**: aggregate counters without any client data
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      ShadowServer                         │
//! │  ┌──────────────┐   ┌────────────────┐   ┌────────────┐  │
//! │  │ TCP Listener │──▶│ DarkStar       │──▶│  Handler   │  │
//! │  │              │   │ server role    │   │ (per conn) │  │
//! │  └──────────────┘   └───────┬────────┘   └────────────┘  │
//! │                             │                             │
//! │                     ┌───────▼────────┐                    │
//! │                     │  ReplayFilter  │                    │
//! │                     └────────────────┘                    │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod config;
mod metrics;

pub use config::{ServerConfig, ServerConfigFile};
pub use metrics::{ActiveConnection, HandshakeOutcome, MetricsSnapshot, ServerMetrics};

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;

use crate::crypto::{PublicKey, StaticSecret};
use crate::darkstar::{server_handshake, CipherMode, ServerIdentifier, ShadowConfig};
use crate::error::{Error, Result};
use crate::replay::ReplayFilter;
use crate::transport::{Dialed, Endpoint, ShadowStream};

/// Main server instance.
pub struct ShadowServer {
    listener: TcpListener,
    static_secret: Arc<StaticSecret>,
    identifier: Arc<ServerIdentifier>,
    cipher: CipherMode,
    replay_filter: Arc<ReplayFilter>,
    replay_filter_path: Option<PathBuf>,
    handshake_timeout: Option<Duration>,
    metrics: Arc<ServerMetrics>,
}

impl ShadowServer {
    /// Bind the listener.
    ///
    /// Loads the replay filter from `replay_filter_path` when configured.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let filter = match &config.replay_filter_path {
            Some(path) => ReplayFilter::open_or_create(path)?,
            None => ReplayFilter::new(),
        };
        Self::bind_with_filter(config, Arc::new(filter)).await
    }

    /// Bind the listener with an explicitly provided replay filter.
    pub async fn bind_with_filter(config: ServerConfig, filter: Arc<ReplayFilter>) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.listen_addr()).await?;
        let local = listener.local_addr()?;

        tracing::info!(
            "Shadow server listening on {} (key {})",
            local,
            config.public_key()
        );

        Ok(Self {
            listener,
            static_secret: Arc::new(config.static_secret),
            // The bound address, so that port 0 resolves to the real port.
            identifier: Arc::new(ServerIdentifier::from(local)),
            cipher: config.cipher,
            replay_filter: filter,
            replay_filter_path: config.replay_filter_path,
            handshake_timeout: config.handshake_timeout,
            metrics: Arc::new(ServerMetrics::new()),
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Server's persistent public key.
    pub fn public_key(&self) -> PublicKey {
        self.static_secret.public_key()
    }

    /// Client configuration for reaching this server.
    pub fn client_config(&self) -> Result<ShadowConfig> {
        let addr = self.local_addr()?;
        Ok(ShadowConfig::from_parts(
            self.public_key(),
            self.cipher,
            addr.ip(),
            addr.port(),
        ))
    }

    /// Get server metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Get the shared replay filter.
    pub fn replay_filter(&self) -> &Arc<ReplayFilter> {
        &self.replay_filter
    }

    /// Accept one connection and complete its handshake on the current task.
    ///
    /// The returned session belongs to the caller and no longer counts as
    /// an active connection.
    pub async fn accept(&self) -> Result<(ShadowStream<TcpStream>, SocketAddr)> {
        let (stream, peer_addr) = self.listener.accept().await?;
        let _connection = self.metrics.track_connection();

        Self::handshake(
            stream,
            &self.static_secret,
            &self.identifier,
            &self.replay_filter,
            self.handshake_timeout,
            &self.metrics,
        )
        .await
        .map(|session| (session, peer_addr))
    }

    /// Serve connections forever; accept errors are logged and skipped.
    pub async fn run<H, Fut>(&self, handler: H) -> Result<()>
    where
        H: Fn(ShadowStream<TcpStream>, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.run_until(handler, std::future::pending()).await
    }

    /// Serve connections until `shutdown` resolves, then save the replay
    /// filter if a path is configured.
    ///
    /// Handshakes still in progress at shutdown are aborted before the
    /// save. Sessions already handed to `handler` keep running.
    pub async fn run_until<H, Fut, S>(&self, handler: H, shutdown: S) -> Result<()>
    where
        H: Fn(ShadowStream<TcpStream>, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        S: Future<Output = ()>,
    {
        let handler = Arc::new(handler);
        let mut handshakes = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        let handler = Arc::clone(&handler);
                        self.spawn_connection(&mut handshakes, stream, peer_addr, handler);
                    }
                    Err(e) => tracing::warn!("Accept error: {}", e),
                },
                Some(joined) = handshakes.join_next(), if !handshakes.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!("Handshake task failed: {}", e);
                    }
                }
            }
        }

        tracing::info!("Shadow server shutting down");
        // No filter insert may land after the save.
        handshakes.shutdown().await;
        self.save_replay_filter()
    }

    /// Persist the replay filter, if a path is configured.
    pub fn save_replay_filter(&self) -> Result<()> {
        match &self.replay_filter_path {
            Some(path) => self.replay_filter.save(path),
            None => Ok(()),
        }
    }

    /// Run the handshake in `handshakes`; a completed session is served on
    /// its own detached task.
    fn spawn_connection<H, Fut>(
        &self,
        handshakes: &mut JoinSet<()>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        handler: Arc<H>,
    ) where
        H: Fn(ShadowStream<TcpStream>, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let connection = self.metrics.track_connection();
        let static_secret = Arc::clone(&self.static_secret);
        let identifier = Arc::clone(&self.identifier);
        let replay_filter = Arc::clone(&self.replay_filter);
        let metrics = Arc::clone(&self.metrics);
        let handshake_timeout = self.handshake_timeout;

        handshakes.spawn(async move {
            let result = Self::handshake(
                stream,
                &static_secret,
                &identifier,
                &replay_filter,
                handshake_timeout,
                &metrics,
            )
            .await;

            match result {
                Ok(session) => {
                    tokio::spawn(async move {
                        let _connection = connection;
                        handler(session, peer_addr).await
                    });
                }
                Err(e) => tracing::debug!("Handshake with {} failed: {}", peer_addr, e),
            }
        });
    }

    async fn handshake(
        mut stream: TcpStream,
        static_secret: &StaticSecret,
        identifier: &ServerIdentifier,
        replay_filter: &ReplayFilter,
        handshake_timeout: Option<Duration>,
        metrics: &ServerMetrics,
    ) -> Result<ShadowStream<TcpStream>> {
        stream.set_nodelay(true)?;
        let endpoint = Endpoint {
            local: stream.local_addr()?,
            peer: stream.peer_addr()?,
        };

        let handshake = server_handshake(&mut stream, static_secret, identifier, replay_filter);
        let result = match handshake_timeout {
            Some(limit) => match timeout(limit, handshake).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(limit.as_millis() as u64)),
            },
            None => handshake.await,
        };

        metrics.record(HandshakeOutcome::of(&result));
        match result {
            Ok(ciphers) => Ok(ShadowStream::from_dialed(Dialed {
                io: stream,
                ciphers,
                endpoint: Some(endpoint),
            })),
            Err(e) => {
                match &e {
                    Error::ReplayDetected => {
                        tracing::warn!("Rejected replayed handshake from {}", endpoint.peer)
                    }
                    Error::ConfirmationMismatch => {
                        tracing::warn!("Confirmation mismatch from {}", endpoint.peer)
                    }
                    _ => {}
                }
                Err(e)
            }
        }
    }
}
