//! Listener counters.
//!
//! Aggregate numbers only; nothing here identifies a client.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// How a server-side handshake ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Both confirmations checked out and a session was established
    Completed,
    /// The client message was already in the replay filter
    Replayed,
    /// Anything else: bad confirmation, short read, timeout, I/O
    Failed,
}

impl HandshakeOutcome {
    /// Classify a handshake result.
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => HandshakeOutcome::Completed,
            Err(Error::ReplayDetected) => HandshakeOutcome::Replayed,
            Err(_) => HandshakeOutcome::Failed,
        }
    }
}

/// Counters shared by the listener and its connection tasks.
pub struct ServerMetrics {
    started: Instant,
    accepted: AtomicU64,
    active: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    replayed: AtomicU64,
}

impl ServerMetrics {
    /// Create a zeroed collector; uptime counts from now.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            accepted: AtomicU64::new(0),
            active: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            replayed: AtomicU64::new(0),
        }
    }

    /// Count an accepted connection as active until the guard drops.
    ///
    /// The guard owns a handle to the counters, so it can move into the
    /// task that ends up serving the connection.
    pub fn track_connection(self: &Arc<Self>) -> ActiveConnection {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveConnection {
            metrics: Arc::clone(self),
        }
    }

    /// Record the end of one handshake.
    pub fn record(&self, outcome: HandshakeOutcome) {
        let counter = match outcome {
            HandshakeOutcome::Completed => &self.completed,
            HandshakeOutcome::Replayed => &self.replayed,
            HandshakeOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Time since the collector was created.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Connections accepted so far.
    pub fn total_connections(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Connections currently handshaking or being served.
    pub fn active_connections(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    /// Handshakes that produced a session.
    pub fn handshakes_completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Handshakes that failed for a reason other than replay.
    pub fn handshake_failures(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Handshakes refused by the replay filter.
    pub fn replays_rejected(&self) -> u64 {
        self.replayed.load(Ordering::Relaxed)
    }

    /// Copy every counter at once.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime: self.uptime(),
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            handshakes_completed: self.handshakes_completed(),
            handshake_failures: self.handshake_failures(),
            replays_rejected: self.replays_rejected(),
        }
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps one connection in the active count while alive.
#[must_use = "the connection stops counting as active when the guard drops"]
pub struct ActiveConnection {
    metrics: Arc<ServerMetrics>,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.metrics.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`ServerMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// Time since the listener started
    pub uptime: Duration,
    /// Connections accepted
    pub total_connections: u64,
    /// Connections handshaking or being served
    pub active_connections: u64,
    /// Handshakes that produced a session
    pub handshakes_completed: u64,
    /// Handshakes that failed other than by replay
    pub handshake_failures: u64,
    /// Handshakes refused as replays
    pub replays_rejected: u64,
}

impl MetricsSnapshot {
    /// Share of handshake attempts that produced a session.
    pub fn handshake_success_rate(&self) -> f64 {
        let attempts = self.handshakes_completed + self.handshake_failures + self.replays_rejected;
        if attempts == 0 {
            return 0.0;
        }
        self.handshakes_completed as f64 / attempts as f64
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Shadow Server Metrics")?;
        writeln!(f, "=====================")?;
        writeln!(f, "Uptime: {} seconds", self.uptime.as_secs())?;
        writeln!(f)?;
        writeln!(f, "Connections:")?;
        writeln!(f, "  Total:  {}", self.total_connections)?;
        writeln!(f, "  Active: {}", self.active_connections)?;
        writeln!(f)?;
        writeln!(f, "Handshakes:")?;
        writeln!(f, "  Completed: {}", self.handshakes_completed)?;
        writeln!(f, "  Failed:    {}", self.handshake_failures)?;
        writeln!(f, "  Replayed:  {}", self.replays_rejected)
    }
}
