//! Process-wide settings.
//!
//! Settings are built once at startup (defaults, then environment
//! overrides via `dotenvy`) and shared immutably behind an `Arc`. Anything
//! tunable per-connection (priority, features) lives on the connection.

use std::time::Duration;

use tracing::warn;

use crate::server::ClientCertMode;

/// Requests a connection may process per readiness event, by priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestsPerEvent {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl Default for RequestsPerEvent {
    fn default() -> Self {
        Self {
            high: 50,
            medium: 20,
            low: 5,
        }
    }
}

/// Immutable process configuration.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Address the plain listener binds to.
    pub listen_address: String,
    /// Reactor worker thread count.
    pub num_worker_threads: usize,
    /// Idle timeout for external connections; zero disables aging.
    /// Internal and DCP connections are never aged out.
    pub connection_idle_time: Duration,
    /// Chunk size for draining the TLS ciphertext pipe.
    pub bio_drain_buffer_size: usize,
    /// Upper bound on a single request frame's body.
    pub max_packet_size: u32,
    /// Per-priority request budget per readiness event.
    pub reqs_per_event: RequestsPerEvent,
    /// Client certificate demand level for TLS listeners.
    pub client_cert_mode: ClientCertMode,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:11210".to_string(),
            num_worker_threads: 4,
            connection_idle_time: Duration::ZERO,
            bio_drain_buffer_size: 8192,
            max_packet_size: 25 * 1024 * 1024,
            reqs_per_event: RequestsPerEvent::default(),
            client_cert_mode: ClientCertMode::Disabled,
        }
    }
}

impl Settings {
    /// Defaults overlaid with `TIDEMARK_*` environment variables. A
    /// `.env` file is honored when present.
    #[must_use]
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut settings = Self::default();
        if let Ok(addr) = std::env::var("TIDEMARK_LISTEN") {
            settings.listen_address = addr;
        }
        if let Some(workers) = parse_env("TIDEMARK_WORKERS") {
            settings.num_worker_threads = workers;
        }
        if let Some(secs) = parse_env("TIDEMARK_IDLE_TIME_SECS") {
            settings.connection_idle_time = Duration::from_secs(secs);
        }
        if let Some(size) = parse_env("TIDEMARK_BIO_DRAIN_SIZE") {
            settings.bio_drain_buffer_size = size;
        }
        if let Some(size) = parse_env("TIDEMARK_MAX_PACKET_SIZE") {
            settings.max_packet_size = size;
        }
        if let Ok(mode) = std::env::var("TIDEMARK_CLIENT_CERT") {
            settings.client_cert_mode = match mode.as_str() {
                "disabled" => ClientCertMode::Disabled,
                "enabled" => ClientCertMode::Enabled,
                "mandatory" => ClientCertMode::Mandatory,
                other => {
                    warn!(mode = other, "unknown client cert mode; keeping disabled");
                    ClientCertMode::Disabled
                }
            };
        }
        settings
    }

    /// Whether idle aging applies at all.
    #[must_use]
    pub fn idle_timeout_enabled(&self) -> bool {
        !self.connection_idle_time.is_zero()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
