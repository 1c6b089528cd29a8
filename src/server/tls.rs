//! TLS plumbing: a sans-IO channel around a rustls server session with
//! paired input/output byte pipes, plus client-certificate authentication
//! hooks.
//!
//! The channel never touches a socket. The transport layer feeds ciphertext
//! in and drains ciphertext out; plaintext crosses through the channel's
//! read/write calls following the connection engine's would-block rules:
//!
//! - reads that need more ciphertext report would-block only once the
//!   buffered input is exhausted,
//! - a clean close-notify surfaces as an orderly zero-length read,
//! - writes are chunked at the configured drain size and the caller must
//!   drain remaining ciphertext before reporting a transmit complete.

use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

use miette::Diagnostic;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, ServerConnection};
use thiserror::Error;
use tracing::warn;

/// X.509 client certificate demand level for a listener.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientCertMode {
    /// Never request a client certificate.
    #[default]
    Disabled,
    /// Request one; authenticate from it when present.
    Enabled,
    /// Require one; connections without a certificate are dropped.
    Mandatory,
}

/// Result of mapping a client certificate to a username.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CertMapResult {
    /// Certificate mapped to a user.
    Success(String),
    /// A certificate was presented but matched no mapping rule.
    NoMatch,
    /// No certificate was presented.
    NotPresent,
    /// The certificate could not be inspected.
    Error,
}

/// Maps a DER-encoded client certificate to a username. The concrete
/// mapping rules (subject fields, prefixes) come from deployment
/// configuration outside this crate.
pub trait CertMapper: Send + Sync {
    fn map(&self, der: &[u8]) -> CertMapResult;
}

/// Default mapper: certificates never map to users.
#[derive(Debug, Default)]
pub struct NoCertMapper;

impl CertMapper for NoCertMapper {
    fn map(&self, _der: &[u8]) -> CertMapResult {
        CertMapResult::NoMatch
    }
}

/// TLS setup failures.
#[derive(Debug, Error, Diagnostic)]
pub enum TlsError {
    #[error("TLS configuration error: {0}")]
    #[diagnostic(code(tidemark::tls::config))]
    Config(String),

    #[error("TLS protocol error: {0}")]
    #[diagnostic(code(tidemark::tls::protocol))]
    Protocol(#[from] rustls::Error),

    #[error("failed to read key material: {0}")]
    #[diagnostic(code(tidemark::tls::io))]
    Io(#[from] io::Error),
}

/// Build a rustls server config from PEM-encoded cert/key bytes and the
/// requested client-certificate mode. `ca_pem` supplies the trust roots
/// used to verify client certificates when the mode requests them.
pub fn server_config(
    cert_pem: &[u8],
    key_pem: &[u8],
    client_cert_mode: ClientCertMode,
    ca_pem: Option<&[u8]>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = rustls_pemfile::certs(&mut Cursor::new(cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::Io)?;
    let key = rustls_pemfile::private_key(&mut Cursor::new(key_pem))
        .map_err(TlsError::Io)?
        .ok_or_else(|| TlsError::Config("no private key found".into()))?;

    let builder = match client_cert_mode {
        ClientCertMode::Disabled => ServerConfig::builder().with_no_client_auth(),
        ClientCertMode::Enabled | ClientCertMode::Mandatory => {
            let mut roots = RootCertStore::empty();
            let ca = ca_pem.ok_or_else(|| {
                TlsError::Config("client cert auth requires a CA bundle".into())
            })?;
            for cert in rustls_pemfile::certs(&mut Cursor::new(ca)) {
                roots
                    .add(cert.map_err(TlsError::Io)?)
                    .map_err(TlsError::Protocol)?;
            }
            let verifier = if client_cert_mode == ClientCertMode::Mandatory {
                WebPkiClientVerifier::builder(Arc::new(roots)).build()
            } else {
                WebPkiClientVerifier::builder(Arc::new(roots))
                    .allow_unauthenticated()
                    .build()
            }
            .map_err(|e| TlsError::Config(e.to_string()))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        }
    };
    let config = builder
        .with_single_cert(certs, key)
        .map_err(TlsError::Protocol)?;
    Ok(Arc::new(config))
}

/// Plaintext read outcome from the channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsRead {
    /// Bytes decoded into the caller's buffer.
    Data(usize),
    /// More ciphertext is needed before plaintext is available.
    WouldBlock,
    /// The peer sent close-notify: an orderly shutdown.
    Closed,
}

/// Envelope around a non-blocking TLS server session.
pub struct TlsChannel {
    session: ServerConnection,
    drain_chunk: usize,
    failed: bool,
}

impl TlsChannel {
    pub fn new(config: Arc<ServerConfig>, drain_chunk: usize) -> Result<Self, TlsError> {
        Ok(Self {
            session: ServerConnection::new(config).map_err(TlsError::Protocol)?,
            drain_chunk,
            failed: false,
        })
    }

    /// Whether the handshake is still in progress.
    #[must_use]
    pub fn is_handshaking(&self) -> bool {
        self.session.is_handshaking()
    }

    /// Whether a fatal protocol error has occurred.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.failed
    }

    /// Feed ciphertext received from the socket. Returns the number of
    /// bytes accepted.
    pub fn feed_ciphertext(&mut self, bytes: &[u8]) -> Result<usize, TlsError> {
        let mut cursor = Cursor::new(bytes);
        let mut fed = 0usize;
        while (cursor.position() as usize) < bytes.len() {
            match self.session.read_tls(&mut cursor) {
                Ok(0) => break,
                Ok(n) => fed += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(TlsError::Io(e)),
            }
        }
        if let Err(e) = self.session.process_new_packets() {
            self.failed = true;
            warn!(error = %e, "TLS record processing failed; resetting session");
            return Err(TlsError::Protocol(e));
        }
        Ok(fed)
    }

    /// Read decoded plaintext.
    pub fn read_plaintext(&mut self, buf: &mut [u8]) -> TlsRead {
        match self.session.reader().read(buf) {
            Ok(0) => TlsRead::Closed,
            Ok(n) => TlsRead::Data(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => TlsRead::WouldBlock,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => TlsRead::Closed,
            Err(_) => {
                self.failed = true;
                TlsRead::WouldBlock
            }
        }
    }

    /// Encrypt plaintext, chunked at the drain-buffer size. Returns the
    /// number of bytes accepted; zero means the session's outgoing buffer
    /// is full and ciphertext must be drained first.
    pub fn write_plaintext(&mut self, data: &[u8]) -> usize {
        let mut written = 0usize;
        while written < data.len() {
            let chunk = (data.len() - written).min(self.drain_chunk);
            match self.session.writer().write(&data[written..written + chunk]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(_) => break,
            }
        }
        written
    }

    /// Whether encrypted output is waiting to be drained to the socket.
    #[must_use]
    pub fn has_pending_ciphertext(&self) -> bool {
        self.session.wants_write()
    }

    /// Move pending ciphertext into `out`. Returns bytes appended.
    pub fn take_ciphertext(&mut self, out: &mut Vec<u8>) -> Result<usize, TlsError> {
        let mut taken = 0usize;
        while self.session.wants_write() {
            match self.session.write_tls(out) {
                Ok(0) => break,
                Ok(n) => taken += n,
                Err(e) => return Err(TlsError::Io(e)),
            }
        }
        Ok(taken)
    }

    /// DER bytes of the peer's end-entity certificate, if one was
    /// presented.
    #[must_use]
    pub fn peer_certificate(&self) -> Option<Vec<u8>> {
        self.session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec())
    }
}

impl std::fmt::Debug for TlsChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsChannel")
            .field("handshaking", &self.is_handshaking())
            .field("pending_ciphertext", &self.has_pending_ciphertext())
            .field("failed", &self.failed)
            .finish()
    }
}
