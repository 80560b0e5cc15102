//! Stream session over a DarkStar-framed connection.
//!
//! `ShadowStream` turns the frame codec into an ordered byte stream. Reads
//! and writes use independent locks, so one reader task and one writer task
//! may share a session through an `Arc`. `close` wakes both of them.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};

use crate::crypto::ciphertext_len;
use crate::darkstar::RedialPolicy;
use crate::error::{Error, Result};
use crate::transport::{
    read_full, CipherPair, DarkStarCipher, ENCRYPTED_LENGTH_SIZE, MAX_PAYLOAD_SIZE,
};

/// Local and remote socket addresses of a session's connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// Our side of the connection
    pub local: SocketAddr,
    /// The peer's side of the connection
    pub peer: SocketAddr,
}

/// A freshly connected and handshaken transport.
pub struct Dialed<S> {
    /// Raw connection
    pub io: S,
    /// Codecs from the handshake on `io`
    pub ciphers: CipherPair,
    /// Socket addresses, when the transport has them
    pub endpoint: Option<Endpoint>,
}

/// Future returned by a [`Redialer`].
pub type RedialFuture<S> = BoxFuture<'static, Result<Dialed<S>>>;

/// Reconnect-and-rehandshake callback used by the redial policy.
pub type Redialer<S> = Box<dyn Fn() -> RedialFuture<S> + Send + Sync>;

struct ReadState<S> {
    /// `None` once the session is closed
    io: Option<ReadHalf<S>>,
    cipher: DarkStarCipher,
    /// Decrypted bytes not yet handed to the caller
    buffer: BytesMut,
    /// Redials since the last good frame
    redials: u32,
}

impl<S: AsyncRead> ReadState<S> {
    /// Read and open one frame. `None` means a clean end of stream.
    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        let io = self.io.as_mut().ok_or(Error::Closed)?;

        let mut header = [0u8; ENCRYPTED_LENGTH_SIZE];
        let received = read_full(io, &mut header).await?;
        if received == 0 {
            return Ok(None);
        }
        if received < ENCRYPTED_LENGTH_SIZE {
            return Err(truncated_frame());
        }

        let length = self.cipher.unpack_length(&header)?;
        let mut body = vec![0u8; ciphertext_len(length)];
        io.read_exact(&mut body).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => truncated_frame(),
            _ => Error::Network(e),
        })?;

        self.cipher.unpack_payload(&body).map(Some)
    }
}

struct WriteState<S> {
    /// `None` once shut down
    io: Option<WriteHalf<S>>,
    cipher: DarkStarCipher,
}

impl<S: AsyncWrite> WriteState<S> {
    /// Seal `data` into frames of at most [`MAX_PAYLOAD_SIZE`] bytes, send
    /// them and flush.
    async fn write_frames(&mut self, data: &[u8]) -> Result<()> {
        let Self { io, cipher } = self;
        let io = io.as_mut().ok_or(Error::Closed)?;

        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            let frame = cipher.pack(chunk)?;
            io.write_all(&frame).await.map_err(Error::WriteFailed)?;
        }
        io.flush().await.map_err(Error::WriteFailed)
    }

    /// Shut down and drop the write half. Idempotent.
    async fn shutdown(&mut self) {
        if let Some(mut io) = self.io.take() {
            if let Err(e) = io.shutdown().await {
                tracing::debug!("Shutdown error: {}", e);
            }
        }
    }
}

struct Redial<S> {
    dialer: Redialer<S>,
    policy: RedialPolicy,
}

/// An established Shadow session.
pub struct ShadowStream<S> {
    reader: Mutex<ReadState<S>>,
    writer: Mutex<WriteState<S>>,
    closed: AtomicBool,
    /// Flipped to `true` once; in-flight reads and writes select on it
    close_signal: watch::Sender<bool>,
    endpoint: RwLock<Option<Endpoint>>,
    redial: Option<Redial<S>>,
}

impl<S> ShadowStream<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a connection whose handshake produced `ciphers`.
    pub fn new(io: S, ciphers: CipherPair) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        let (close_signal, _) = watch::channel(false);

        Self {
            reader: Mutex::new(ReadState {
                io: Some(read_half),
                cipher: ciphers.receive,
                buffer: BytesMut::new(),
                redials: 0,
            }),
            writer: Mutex::new(WriteState {
                io: Some(write_half),
                cipher: ciphers.send,
            }),
            closed: AtomicBool::new(false),
            close_signal,
            endpoint: RwLock::new(None),
            redial: None,
        }
    }

    /// Wrap the result of a dial.
    pub fn from_dialed(dialed: Dialed<S>) -> Self {
        let stream = Self::new(dialed.io, dialed.ciphers);
        *stream.endpoint.write() = dialed.endpoint;
        stream
    }

    /// Enable automatic redial after decryption failures.
    ///
    /// Has no effect when `policy` allows zero redials.
    pub fn with_redial(mut self, dialer: Redialer<S>, policy: RedialPolicy) -> Self {
        self.redial = policy
            .is_enabled()
            .then_some(Redial { dialer, policy });
        self
    }

    /// Read exactly `n` bytes.
    ///
    /// Returns fewer bytes only when the peer ends the stream with some data
    /// still buffered; `EndOfStream` when nothing is left.
    pub async fn read(&self, n: usize) -> Result<Bytes> {
        self.check_open()?;
        if n == 0 {
            return Ok(Bytes::new());
        }

        let mut reader = self.reader.lock().await;
        while reader.buffer.len() < n {
            if !self.fill(&mut reader).await? {
                if reader.buffer.is_empty() {
                    return Err(Error::EndOfStream);
                }
                let available = reader.buffer.len();
                return Ok(reader.buffer.split_to(available).freeze());
            }
        }
        Ok(reader.buffer.split_to(n).freeze())
    }

    /// Read between 1 and `max` bytes, waiting only until some are available.
    pub async fn read_up_to(&self, max: usize) -> Result<Bytes> {
        self.check_open()?;
        if max == 0 {
            return Ok(Bytes::new());
        }

        let mut reader = self.reader.lock().await;
        while reader.buffer.is_empty() {
            if !self.fill(&mut reader).await? {
                return Err(Error::EndOfStream);
            }
        }
        let take = max.min(reader.buffer.len());
        Ok(reader.buffer.split_to(take).freeze())
    }

    /// Write all of `data`, splitting it into frames of at most
    /// [`MAX_PAYLOAD_SIZE`] bytes, and flush.
    ///
    /// Any failure closes the session; a partially written frame cannot be
    /// resumed because the peer's nonce counter would fall out of step.
    /// A concurrent `close` interrupts the write with `Closed`.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.check_open()?;
        if data.is_empty() {
            return Ok(());
        }

        let mut writer = self.writer.lock().await;
        let result = tokio::select! {
            biased;
            _ = self.closed_signal() => Err(Error::Closed),
            result = writer.write_frames(data) => result,
        };

        match result {
            Ok(()) => Ok(()),
            // `close` owns the shutdown.
            Err(Error::Closed) => Err(Error::Closed),
            Err(e) => {
                tracing::debug!("Closing session after write error: {}", e);
                self.mark_closed();
                writer.shutdown().await;
                Err(e)
            }
        }
    }

    /// Close the session and release the connection. Idempotent.
    ///
    /// Reads and writes in flight on other tasks return `Closed`, as do all
    /// later calls.
    pub async fn close(&self) -> Result<()> {
        let was_closed = self.closed.load(Ordering::SeqCst);
        self.mark_closed();

        // In-flight I/O has been signalled, so both locks free up promptly.
        self.reader.lock().await.io = None;
        self.writer.lock().await.shutdown().await;

        if !was_closed {
            tracing::debug!("Shadow session closed");
        }
        Ok(())
    }

    /// Whether the session has been closed, explicitly or by a fatal error.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Local socket address, when known.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.read().map(|e| e.local)
    }

    /// Peer socket address, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.endpoint.read().map(|e| e.peer)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_signal.send_replace(true);
    }

    /// Resolves once the session is closed, immediately if it already is.
    async fn closed_signal(&self) {
        let mut closed = self.close_signal.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Pull one frame into the buffer. `false` at end of stream.
    async fn fill(&self, reader: &mut ReadState<S>) -> Result<bool> {
        tokio::select! {
            biased;
            _ = self.closed_signal() => Err(Error::Closed),
            filled = self.fill_frame(reader) => filled,
        }
    }

    async fn fill_frame(&self, reader: &mut ReadState<S>) -> Result<bool> {
        loop {
            match reader.read_frame().await {
                Ok(Some(payload)) => {
                    reader.buffer.extend_from_slice(&payload);
                    reader.redials = 0;
                    return Ok(true);
                }
                Ok(None) => return Ok(false),
                // Only a frame that failed authentication asks for a new
                // connection; other read errors mean the stream is broken.
                Err(e @ Error::DecryptFailed) if self.may_redial(&e, reader.redials) => {
                    if let Err(e) = self.reconnect(reader).await {
                        self.mark_closed();
                        return Err(e);
                    }
                }
                Err(e) => {
                    tracing::debug!("Closing session after read error: {}", e);
                    self.mark_closed();
                    return Err(e);
                }
            }
        }
    }

    /// Whether `error` may be answered with another redial attempt.
    fn may_redial(&self, error: &Error, redials: u32) -> bool {
        let Some(redial) = self.redial.as_ref() else {
            return false;
        };
        error.is_recoverable()
            && !error.is_fatal_by_design()
            && redials < redial.policy.max_redials
    }

    /// Redial until a connection is established or the budget runs out.
    ///
    /// Recoverable dial failures (network, timeout, short handshake) are
    /// retried; a failed confirmation or a replay stops at once.
    async fn reconnect(&self, reader: &mut ReadState<S>) -> Result<()> {
        loop {
            reader.redials += 1;
            match self.redial(reader).await {
                Ok(()) => return Ok(()),
                Err(e) if self.may_redial(&e, reader.redials) => {
                    tracing::warn!("Redial failed, retrying: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Replace the connection and both codecs. Caller holds the read lock.
    ///
    /// Buffered plaintext from the old connection was authenticated and
    /// stays ahead of anything the new one delivers.
    async fn redial(&self, reader: &mut ReadState<S>) -> Result<()> {
        let Some(redial) = self.redial.as_ref() else {
            return Err(Error::DecryptFailed);
        };

        tracing::warn!(
            "Decryption failed, redialing (attempt {} of {})",
            reader.redials,
            redial.policy.max_redials
        );

        let mut writer = self.writer.lock().await;
        let dialed = (redial.dialer)().await?;
        writer.shutdown().await;

        let (read_half, write_half) = tokio::io::split(dialed.io);
        reader.io = Some(read_half);
        reader.cipher = dialed.ciphers.receive;
        writer.io = Some(write_half);
        writer.cipher = dialed.ciphers.send;
        *self.endpoint.write() = dialed.endpoint;

        tracing::info!("Redial succeeded");
        Ok(())
    }
}

impl<S> std::fmt::Debug for ShadowStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowStream")
            .field("endpoint", &*self.endpoint.read())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .field("redial", &self.redial.as_ref().map(|r| r.policy))
            .finish()
    }
}

fn truncated_frame() -> Error {
    Error::Network(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed mid-frame",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;
    use std::time::Duration;

    use futures::FutureExt;
    use tokio::io::DuplexStream;

    use crate::crypto::{AeadKey, KEY_SIZE};
    use crate::transport::frame_len;

    fn keys(seed: u8) -> (CipherPair, CipherPair) {
        let up = AeadKey::from_bytes([seed; KEY_SIZE]);
        let down = AeadKey::from_bytes([seed.wrapping_add(1); KEY_SIZE]);
        (CipherPair::new(&up, &down), CipherPair::new(&down, &up))
    }

    fn session_pair() -> (ShadowStream<DuplexStream>, ShadowStream<DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (client, server) = keys(1);
        (ShadowStream::new(a, client), ShadowStream::new(b, server))
    }

    /// Read one raw frame from `io` and open it with `cipher`.
    async fn read_raw_frame(io: &mut DuplexStream, cipher: &mut DarkStarCipher) -> Bytes {
        let mut header = [0u8; ENCRYPTED_LENGTH_SIZE];
        io.read_exact(&mut header).await.unwrap();
        let length = cipher.unpack_length(&header).unwrap();
        let mut body = vec![0u8; ciphertext_len(length)];
        io.read_exact(&mut body).await.unwrap();
        cipher.unpack_payload(&body).unwrap()
    }

    #[tokio::test]
    async fn test_hi_yo() {
        let (client, server) = session_pair();

        let server_task = tokio::spawn(async move {
            let request = server.read(2).await.unwrap();
            assert_eq!(&request[..], b"Hi");
            server.write(b"Yo").await.unwrap();
            server
        });

        client.write(b"Hi").await.unwrap();
        let reply = client.read(2).await.unwrap();
        assert_eq!(&reply[..], b"Yo");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_chunked_write_emits_two_frames() {
        let (a, mut raw) = tokio::io::duplex(64 * 1024);
        let (client_ciphers, mut server_ciphers) = keys(2);
        let client = ShadowStream::new(a, client_ciphers);

        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 253) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write(&payload).await.unwrap();
            client.close().await.unwrap();
        });

        let first = read_raw_frame(&mut raw, &mut server_ciphers.receive).await;
        let second = read_raw_frame(&mut raw, &mut server_ciphers.receive).await;
        assert_eq!(first.len(), MAX_PAYLOAD_SIZE);
        assert_eq!(second.len(), 20_000 - MAX_PAYLOAD_SIZE);
        assert_eq!([first, second].concat(), expected);

        // Nothing after the second frame.
        let mut rest = Vec::new();
        raw.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_wire_size_of_chunked_write() {
        let (a, mut raw) = tokio::io::duplex(64 * 1024);
        let (client_ciphers, _) = keys(3);
        let client = ShadowStream::new(a, client_ciphers);

        let writer = tokio::spawn(async move {
            client.write(&vec![0u8; 20_000]).await.unwrap();
            client.close().await.unwrap();
        });

        let mut wire = Vec::new();
        raw.read_to_end(&mut wire).await.unwrap();
        assert_eq!(
            wire.len(),
            frame_len(MAX_PAYLOAD_SIZE) + frame_len(20_000 - MAX_PAYLOAD_SIZE)
        );
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_serves_from_buffer() {
        let (client, server) = session_pair();
        client.write(b"Hello").await.unwrap();

        assert_eq!(&server.read(2).await.unwrap()[..], b"He");
        assert_eq!(&server.read(3).await.unwrap()[..], b"llo");
    }

    #[tokio::test]
    async fn test_read_spans_frames() {
        let (client, server) = session_pair();
        client.write(b"ab").await.unwrap();
        client.write(b"cd").await.unwrap();
        client.write(b"ef").await.unwrap();

        assert_eq!(&server.read(5).await.unwrap()[..], b"abcde");
        assert_eq!(&server.read(1).await.unwrap()[..], b"f");
    }

    #[tokio::test]
    async fn test_short_read_then_end_of_stream() {
        let (client, server) = session_pair();
        client.write(b"abc").await.unwrap();
        client.close().await.unwrap();

        assert_eq!(&server.read(10).await.unwrap()[..], b"abc");
        assert!(matches!(server.read(1).await, Err(Error::EndOfStream)));
    }

    #[tokio::test]
    async fn test_read_up_to() {
        let (client, server) = session_pair();
        client.write(b"abcdef").await.unwrap();

        assert_eq!(&server.read_up_to(4).await.unwrap()[..], b"abcd");
        assert_eq!(&server.read_up_to(100).await.unwrap()[..], b"ef");
        assert!(server.read_up_to(0).await.unwrap().is_empty());

        client.close().await.unwrap();
        assert!(matches!(server.read_up_to(8).await, Err(Error::EndOfStream)));
    }

    #[tokio::test]
    async fn test_empty_write_sends_nothing() {
        let (a, mut raw) = tokio::io::duplex(1024);
        let (client_ciphers, _) = keys(4);
        let client = ShadowStream::new(a, client_ciphers);

        client.write(&[]).await.unwrap();
        client.close().await.unwrap();

        let mut wire = Vec::new();
        raw.read_to_end(&mut wire).await.unwrap();
        assert!(wire.is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _server) = session_pair();

        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(client.is_closed());
        assert!(matches!(client.write(b"x").await, Err(Error::Closed)));
        assert!(matches!(client.read(1).await, Err(Error::Closed)));
        assert!(matches!(client.read_up_to(1).await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_tampered_frame_is_fatal() {
        let (mut raw, b) = tokio::io::duplex(1024);
        let (mut client_ciphers, server_ciphers) = keys(5);
        let server = ShadowStream::new(b, server_ciphers);

        let mut frame = client_ciphers.send.pack(b"hello").unwrap().to_vec();
        frame[ENCRYPTED_LENGTH_SIZE] ^= 0x01;
        raw.write_all(&frame).await.unwrap();

        assert!(matches!(server.read(5).await, Err(Error::DecryptFailed)));
        assert!(server.is_closed());
        assert!(matches!(server.read(5).await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_network_error() {
        let (mut raw, b) = tokio::io::duplex(1024);
        let (mut client_ciphers, server_ciphers) = keys(6);
        let server = ShadowStream::new(b, server_ciphers);

        let frame = client_ciphers.send.pack(b"hello").unwrap();
        raw.write_all(&frame[..frame.len() - 3]).await.unwrap();
        drop(raw);

        assert!(matches!(server.read(5).await, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_write_failure_closes_session() {
        let (a, raw) = tokio::io::duplex(1024);
        let (client_ciphers, _) = keys(7);
        let client = ShadowStream::new(a, client_ciphers);
        drop(raw);

        assert!(matches!(
            client.write(b"into the void").await,
            Err(Error::WriteFailed(_))
        ));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_reader_and_writer() {
        let (client, server) = session_pair();
        let client = Arc::new(client);

        let echo = tokio::spawn(async move {
            loop {
                match server.read_up_to(4096).await {
                    Ok(data) => server.write(&data).await.unwrap(),
                    Err(Error::EndOfStream) => break,
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }
        });

        let reader = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.read(50_000).await.unwrap() })
        };

        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 241) as u8).collect();
        client.write(&payload).await.unwrap();

        let echoed = reader.await.unwrap();
        assert_eq!(&echoed[..], &payload[..]);

        client.close().await.unwrap();
        echo.await.unwrap();
    }

    /// A peer that sends `wire` verbatim and then waits.
    fn spawn_raw_peer(wire: Vec<u8>) -> DuplexStream {
        let (local, mut remote) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            remote.write_all(&wire).await.unwrap();
            let mut sink = Vec::new();
            let _ = remote.read_to_end(&mut sink).await;
        });
        local
    }

    /// A peer that sends one frame sealed with `ciphers` and then waits.
    fn spawn_peer(mut ciphers: CipherPair, message: &'static [u8]) -> DuplexStream {
        spawn_raw_peer(ciphers.send.pack(message).unwrap().to_vec())
    }

    fn counting_redialer(
        attempts: Arc<AtomicU32>,
        message: &'static [u8],
    ) -> Redialer<DuplexStream> {
        Box::new(move || {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                let (local, remote) = keys(9);
                Ok::<_, Error>(Dialed {
                    io: spawn_peer(remote, message),
                    ciphers: local,
                    endpoint: None,
                })
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_redial_after_decrypt_failure() {
        // First connection speaks with the wrong key.
        let (_, wrong) = keys(20);
        let (local, _) = keys(21);
        let io = spawn_peer(wrong, b"garbage");

        let attempts = Arc::new(AtomicU32::new(0));
        let stream = ShadowStream::new(io, local)
            .with_redial(counting_redialer(Arc::clone(&attempts), b"ok"), RedialPolicy::up_to(1));

        assert_eq!(&stream.read(2).await.unwrap()[..], b"ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_redial_by_default() {
        let (_, wrong) = keys(30);
        let (local, _) = keys(31);
        let io = spawn_peer(wrong, b"garbage");

        let attempts = Arc::new(AtomicU32::new(0));
        let stream = ShadowStream::new(io, local)
            .with_redial(counting_redialer(Arc::clone(&attempts), b"ok"), RedialPolicy::default());

        assert!(matches!(stream.read(2).await, Err(Error::DecryptFailed)));
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_redial_limit_is_enforced() {
        let (_, wrong) = keys(40);
        let (local, _) = keys(41);
        let io = spawn_peer(wrong, b"garbage");

        // Every redial lands on a peer that also uses the wrong key.
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let redialer: Redialer<DuplexStream> = Box::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let (_, wrong) = keys(50);
                let (local, _) = keys(51);
                Ok::<_, Error>(Dialed {
                    io: spawn_peer(wrong, b"still garbage"),
                    ciphers: local,
                    endpoint: None,
                })
            }
            .boxed()
        });

        let stream = ShadowStream::new(io, local).with_redial(redialer, RedialPolicy::up_to(2));
        assert!(matches!(stream.read(2).await, Err(Error::DecryptFailed)));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_failed_redial_surfaces_its_error() {
        let (_, wrong) = keys(60);
        let (local, _) = keys(61);
        let io = spawn_peer(wrong, b"garbage");

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let redialer: Redialer<DuplexStream> = Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<Dialed<DuplexStream>, _>(Error::ConfirmationMismatch) }.boxed()
        });

        // A server that fails confirmation is not retried, budget or not.
        let stream = ShadowStream::new(io, local).with_redial(redialer, RedialPolicy::up_to(3));
        assert!(matches!(
            stream.read(2).await,
            Err(Error::ConfirmationMismatch)
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_redial_retries_network_failure() {
        let (_, wrong) = keys(62);
        let (local, _) = keys(63);
        let io = spawn_peer(wrong, b"garbage");

        // The first redial cannot connect, the second can.
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let redialer: Redialer<DuplexStream> = Box::new(move || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    return Err(Error::Network(std::io::Error::new(
                        std::io::ErrorKind::ConnectionRefused,
                        "refused",
                    )));
                }
                let (local, remote) = keys(64);
                Ok(Dialed {
                    io: spawn_peer(remote, b"ok"),
                    ciphers: local,
                    endpoint: None,
                })
            }
            .boxed()
        });

        let stream = ShadowStream::new(io, local).with_redial(redialer, RedialPolicy::up_to(2));
        assert_eq!(&stream.read(2).await.unwrap()[..], b"ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_network_failure_exhausts_budget() {
        let (_, wrong) = keys(65);
        let (local, _) = keys(66);
        let io = spawn_peer(wrong, b"garbage");

        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let redialer: Redialer<DuplexStream> = Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<Dialed<DuplexStream>, _>(Error::Network(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )))
            }
            .boxed()
        });

        let stream = ShadowStream::new(io, local).with_redial(redialer, RedialPolicy::up_to(2));
        assert!(matches!(stream.read(2).await, Err(Error::Network(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn test_redial_keeps_authenticated_prefix() {
        // "abc" arrives intact, then a frame under a key nobody agreed on.
        let (local, mut remote) = keys(67);
        let (_, mut stranger) = keys(68);
        let mut wire = remote.send.pack(b"abc").unwrap().to_vec();
        wire.extend_from_slice(&stranger.send.pack(b"xyz").unwrap());
        let io = spawn_raw_peer(wire);

        let attempts = Arc::new(AtomicU32::new(0));
        let stream = ShadowStream::new(io, local)
            .with_redial(counting_redialer(Arc::clone(&attempts), b"de"), RedialPolicy::up_to(1));

        assert_eq!(&stream.read(5).await.unwrap()[..], b"abcde");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_interrupts_stuck_write() {
        // The peer never reads, so the write blocks once the pipe fills.
        let (a, mut raw) = tokio::io::duplex(1024);
        let (client_ciphers, _) = keys(72);
        let client = Arc::new(ShadowStream::new(a, client_ciphers));

        let writer = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.write(&vec![0u8; 100_000]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        tokio::time::timeout(Duration::from_secs(2), client.close())
            .await
            .expect("close blocked behind the write")
            .unwrap();
        let written = tokio::time::timeout(Duration::from_secs(2), writer)
            .await
            .expect("write not interrupted")
            .unwrap();
        assert!(matches!(written, Err(Error::Closed)));

        // The connection itself is gone.
        assert!(raw.write_all(b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_close_wakes_pending_read() {
        let (a, mut raw) = tokio::io::duplex(1024);
        let (_, server_ciphers) = keys(73);
        let server = Arc::new(ShadowStream::new(a, server_ciphers));

        let reader = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.read(1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());

        tokio::time::timeout(Duration::from_secs(2), server.close())
            .await
            .expect("close blocked behind the read")
            .unwrap();
        let read = tokio::time::timeout(Duration::from_secs(2), reader)
            .await
            .expect("read not woken")
            .unwrap();
        assert!(matches!(read, Err(Error::Closed)));

        let mut rest = Vec::new();
        raw.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_endpoint_from_dialed() {
        let (a, _b) = tokio::io::duplex(64);
        let (ciphers, _) = keys(70);
        let endpoint = Endpoint {
            local: "127.0.0.1:5000".parse().unwrap(),
            peer: "127.0.0.1:6000".parse().unwrap(),
        };

        let stream = ShadowStream::from_dialed(Dialed {
            io: a,
            ciphers,
            endpoint: Some(endpoint),
        });
        assert_eq!(stream.local_addr(), Some(endpoint.local));
        assert_eq!(stream.peer_addr(), Some(endpoint.peer));
    }
}
