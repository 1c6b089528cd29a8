//! Transports: the byte-level seam between a connection's state machine
//! and its socket (plain TCP, TLS, or an in-memory pair for tests).
//!
//! The state machine itself is synchronous; every call here either makes
//! progress or fails with `WouldBlock`, and the owning worker awaits
//! [`Transport::ready`] before re-entering the machine.

use std::io::{self, IoSlice};

use async_trait::async_trait;
use tokio::io::Interest as TokioInterest;
use tokio::net::TcpStream;

use super::tls::{TlsChannel, TlsRead};

/// Readiness interest a suspended connection re-arms with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };
    pub const READ_WRITE: Interest = Interest {
        read: true,
        write: true,
    };
}

/// Progress of a TLS handshake drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Handshake finished (trivially so for plain transports).
    Complete,
    /// More socket readiness is needed.
    WouldBlock,
    /// The handshake failed; close the connection.
    Failed,
}

/// Byte-level transport under a connection.
#[async_trait]
pub trait Transport: Send {
    /// Non-blocking read. `Ok(0)` means the peer closed.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Non-blocking scatter-gather write.
    fn try_write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// Drive any pre-traffic negotiation. Plain transports complete
    /// immediately.
    fn drive_handshake(&mut self) -> HandshakeStatus {
        HandshakeStatus::Complete
    }

    /// Whether encrypted output is still buffered below the connection's
    /// own send queue.
    fn pending_output(&self) -> bool {
        false
    }

    /// DER bytes of the peer's certificate, when one was presented.
    fn peer_certificate(&self) -> Option<Vec<u8>> {
        None
    }

    /// Whether this transport runs TLS.
    fn is_tls(&self) -> bool {
        false
    }

    /// Wait until the transport can make progress for `interest`.
    async fn ready(&mut self, interest: Interest) -> io::Result<()>;

    /// Best-effort orderly shutdown.
    fn shutdown(&mut self);
}

/// Plain TCP transport over a tokio stream.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    #[must_use]
    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.peer_addr().ok()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    fn try_write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        self.stream.try_write_vectored(bufs)
    }

    async fn ready(&mut self, interest: Interest) -> io::Result<()> {
        let tokio_interest = match (interest.read, interest.write) {
            (true, true) => TokioInterest::READABLE | TokioInterest::WRITABLE,
            (false, true) => TokioInterest::WRITABLE,
            _ => TokioInterest::READABLE,
        };
        self.stream.ready(tokio_interest).await.map(|_| ())
    }

    fn shutdown(&mut self) {
        // Dropping the stream closes the descriptor; nothing to flush at
        // this layer.
    }
}

/// TLS transport: a [`TlsChannel`] layered over an inner transport.
pub struct TlsTransport {
    inner: Box<dyn Transport>,
    channel: TlsChannel,
    /// Ciphertext accepted from the channel but not yet written to the
    /// socket.
    out_pending: Vec<u8>,
    socket_eof: bool,
}

impl TlsTransport {
    #[must_use]
    pub fn new(inner: Box<dyn Transport>, channel: TlsChannel) -> Self {
        Self {
            inner,
            channel,
            out_pending: Vec::new(),
            socket_eof: false,
        }
    }

    /// Pull ciphertext from the socket into the session.
    fn drain_recv_pipe(&mut self) -> io::Result<()> {
        let mut scratch = [0u8; 4096];
        loop {
            match self.inner.try_read(&mut scratch) {
                Ok(0) => {
                    self.socket_eof = true;
                    return Ok(());
                }
                Ok(n) => {
                    self.channel
                        .feed_ciphertext(&scratch[..n])
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Push buffered ciphertext to the socket. Returns whether everything
    /// drained.
    fn drain_send_pipe(&mut self) -> io::Result<bool> {
        self.channel
            .take_ciphertext(&mut self.out_pending)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        while !self.out_pending.is_empty() {
            match self
                .inner
                .try_write_vectored(&[IoSlice::new(&self.out_pending)])
            {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.out_pending.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl Transport for TlsTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.channel.read_plaintext(buf) {
                TlsRead::Data(n) => return Ok(n),
                TlsRead::Closed => return Ok(0),
                TlsRead::WouldBlock => {
                    if self.channel.has_error() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "TLS session failed",
                        ));
                    }
                    if self.socket_eof {
                        // Abrupt close without close-notify.
                        return Ok(0);
                    }
                    let before_eof = self.socket_eof;
                    self.drain_recv_pipe()?;
                    if self.channel.has_error() {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            "TLS session failed",
                        ));
                    }
                    // No forward progress possible without more socket
                    // readiness.
                    if !self.socket_eof && before_eof == self.socket_eof {
                        match self.channel.read_plaintext(buf) {
                            TlsRead::Data(n) => return Ok(n),
                            TlsRead::Closed => return Ok(0),
                            TlsRead::WouldBlock => {
                                return Err(io::ErrorKind::WouldBlock.into())
                            }
                        }
                    }
                }
            }
        }
    }

    fn try_write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        // Drain previously encrypted output first so the session buffer
        // frees up.
        self.drain_send_pipe()?;
        let mut accepted = 0usize;
        for buf in bufs {
            let n = self.channel.write_plaintext(buf);
            accepted += n;
            if n < buf.len() {
                break;
            }
        }
        // Force a drain after the final chunk: the caller's transmit loop
        // must not observe "complete" while ciphertext is still buffered.
        self.drain_send_pipe()?;
        if accepted == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(accepted)
    }

    fn drive_handshake(&mut self) -> HandshakeStatus {
        loop {
            if self.channel.has_error() {
                return HandshakeStatus::Failed;
            }
            if !self.channel.is_handshaking() {
                match self.drain_send_pipe() {
                    Ok(_) => return HandshakeStatus::Complete,
                    Err(_) => return HandshakeStatus::Failed,
                }
            }
            match self.drain_send_pipe() {
                // The socket cannot accept our handshake bytes right now.
                Ok(false) => return HandshakeStatus::WouldBlock,
                Ok(true) => {}
                Err(_) => return HandshakeStatus::Failed,
            }
            if self.socket_eof {
                return HandshakeStatus::Failed;
            }
            let was_handshaking = self.channel.is_handshaking();
            if self.drain_recv_pipe().is_err() || self.channel.has_error() {
                return HandshakeStatus::Failed;
            }
            if self.channel.is_handshaking() == was_handshaking
                && !self.channel.has_pending_ciphertext()
            {
                return HandshakeStatus::WouldBlock;
            }
        }
    }

    fn pending_output(&self) -> bool {
        !self.out_pending.is_empty() || self.channel.has_pending_ciphertext()
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.channel.peer_certificate()
    }

    fn is_tls(&self) -> bool {
        true
    }

    async fn ready(&mut self, interest: Interest) -> io::Result<()> {
        // Data may already be buffered inside the session rather than the
        // socket; in that case readiness is immediate.
        let mut inner_interest = interest;
        if self.pending_output() {
            inner_interest.write = true;
        }
        self.inner.ready(inner_interest).await
    }

    fn shutdown(&mut self) {
        let _ = self.drain_send_pipe();
        self.inner.shutdown();
    }
}

#[derive(Debug, Default)]
struct MemState {
    input: Vec<u8>,
    consumed: usize,
    output: Vec<u8>,
    peer_closed: bool,
    write_limit: Option<usize>,
    shutdown: bool,
}

/// In-memory transport for exercising the state machine without sockets.
///
/// Created with [`mem_transport_pair`]; the [`MemPeer`] half stays with
/// the test, which scripts incoming bytes and inspects everything the
/// connection wrote. Reads past the scripted input report would-block;
/// writes can be throttled to force partial sends.
#[derive(Debug, Default)]
pub struct MemTransport {
    state: std::sync::Arc<parking_lot::Mutex<MemState>>,
}

/// Test-side handle to a [`MemTransport`].
#[derive(Clone, Debug, Default)]
pub struct MemPeer {
    state: std::sync::Arc<parking_lot::Mutex<MemState>>,
}

/// Build a connected in-memory transport and its scripting handle.
#[must_use]
pub fn mem_transport_pair() -> (MemTransport, MemPeer) {
    let state = std::sync::Arc::new(parking_lot::Mutex::new(MemState::default()));
    (
        MemTransport {
            state: std::sync::Arc::clone(&state),
        },
        MemPeer { state },
    )
}

impl MemPeer {
    /// Queue bytes for the connection to read.
    pub fn push_input(&self, bytes: &[u8]) {
        self.state.lock().input.extend_from_slice(bytes);
    }

    /// Simulate the peer closing its half of the connection.
    pub fn close_peer(&self) {
        self.state.lock().peer_closed = true;
    }

    /// Accept at most `limit` bytes per write call.
    pub fn set_write_limit(&self, limit: Option<usize>) {
        self.state.lock().write_limit = limit;
    }

    /// Everything the connection has written so far.
    #[must_use]
    pub fn output(&self) -> Vec<u8> {
        self.state.lock().output.clone()
    }

    /// Drop captured output (e.g. after asserting on a response).
    pub fn clear_output(&self) {
        self.state.lock().output.clear();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }
}

#[async_trait]
impl Transport for MemTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let consumed = state.consumed;
        if state.input.len() <= consumed {
            if state.peer_closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let available = state.input.len() - consumed;
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&state.input[consumed..consumed + n]);
        state.consumed += n;
        Ok(n)
    }

    fn try_write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let mut budget = state.write_limit.unwrap_or(usize::MAX);
        let mut written = 0usize;
        for buf in bufs {
            if budget == 0 {
                break;
            }
            let n = buf.len().min(budget);
            state.output.extend_from_slice(&buf[..n]);
            written += n;
            budget -= n;
            if n < buf.len() {
                break;
            }
        }
        if written == 0 && !bufs.iter().all(|b| b.is_empty()) {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(written)
    }

    async fn ready(&mut self, _interest: Interest) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) {
        self.state.lock().shutdown = true;
    }
}
