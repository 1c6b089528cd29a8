//! The front-end connection engine.
//!
//! Owns the socket lifecycle: accept, TLS handshake, the per-connection
//! state machine, scatter-gather transmit, SASL/RBAC glue, per-connection
//! server events, and the fixed worker reactor pool. The engine boundary
//! is [`crate::engine::BucketEngine`]; everything above the cursor
//! abstraction (DCP framing and friends) lives outside this crate.

pub(crate) mod connection;
mod cookie;
mod dispatch;
mod events;
mod listener;
mod pipes;
mod state_machine;
mod tls;
mod transport;
mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::auth::{PasswordDatabase, RbacDatabase};
use crate::engine::BucketEngine;
use crate::settings::Settings;

pub use connection::{Connection, Priority};
pub use cookie::{Cookie, CookieCore, CookieHandle};
pub use events::{ClusterMapBumpEvent, ForceDisconnectEvent, ServerEvent};
pub use listener::{run_listener, ListenerConfig};
pub use pipes::{BytePipe, SendQueue, TransmitResult, IOV_MAX, MSG_LIST_HIGHWAT, MSG_LIST_INITIAL};
pub use state_machine::{ConnState, StateOutcome};
pub use tls::{
    server_config, CertMapResult, CertMapper, ClientCertMode, NoCertMapper, TlsChannel, TlsError,
    TlsRead,
};
pub use transport::{
    mem_transport_pair, HandshakeStatus, Interest, MemPeer, MemTransport, TcpTransport,
    TlsTransport, Transport,
};
pub use worker::{ConnectionSeed, WorkerPool};

/// Process-wide services shared by every connection: settings, the user
/// catalogs, the bucket registry and the certificate mapper. Initialized
/// once at startup and injected, never reached through globals.
pub struct ServerContext {
    pub settings: Arc<Settings>,
    pub rbac: Arc<RbacDatabase>,
    pub passwords: Arc<PasswordDatabase>,
    pub cert_mapper: Arc<dyn CertMapper>,
    buckets: RwLock<FxHashMap<String, Arc<dyn BucketEngine>>>,
    next_connection_id: AtomicU64,
}

impl ServerContext {
    #[must_use]
    pub fn new(
        settings: Arc<Settings>,
        rbac: Arc<RbacDatabase>,
        passwords: Arc<PasswordDatabase>,
    ) -> Self {
        Self {
            settings,
            rbac,
            passwords,
            cert_mapper: Arc::new(NoCertMapper),
            buckets: RwLock::new(FxHashMap::default()),
            next_connection_id: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub fn with_cert_mapper(mut self, mapper: Arc<dyn CertMapper>) -> Self {
        self.cert_mapper = mapper;
        self
    }

    /// Register a bucket engine under its name.
    pub fn add_bucket(&self, name: impl Into<String>, bucket: Arc<dyn BucketEngine>) {
        self.buckets.write().insert(name.into(), bucket);
    }

    /// Look up a bucket engine by name.
    #[must_use]
    pub fn get_bucket(&self, name: &str) -> Option<Arc<dyn BucketEngine>> {
        self.buckets.read().get(name).cloned()
    }

    #[must_use]
    pub fn bucket_names(&self) -> Vec<String> {
        self.buckets.read().keys().cloned().collect()
    }

    pub(crate) fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}
