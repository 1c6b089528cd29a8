//! One TCP peer: socket transport, buffering, authentication state, the
//! per-connection state machine and its driver.
//!
//! The machine is re-entrant but never entered concurrently: a connection
//! is bound to exactly one worker for its lifetime, and every suspension
//! point yields back to that worker's reactor.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{
    required_privilege, Privilege, PrivilegeAccess, PrivilegeContext, RbacError, SaslSession,
};
use crate::engine::{BucketEngine, EngineCode, EngineResponse};
use crate::protocol::{
    Opcode, ProtocolError, Request, RequestHeader, Response, Status, FeatureSet, HEADER_LEN,
};
use crate::server::cookie::Cookie;
use crate::server::events::ServerEvent;
use crate::server::pipes::{BytePipe, SendQueue, TransmitResult};
use crate::server::state_machine::{ConnState, StateOutcome};
use crate::server::tls::CertMapResult;
use crate::server::transport::{HandshakeStatus, Interest, Transport};
use crate::server::ServerContext;

/// Scheduling priority; selects how many requests a connection may process
/// per readiness event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

const MAX_PRIVILEGE_RETRIES: usize = 100;

/// Result of remapping an engine code for a particular client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Remapped {
    Status(Status),
    Disconnect,
}

/// Action produced by command dispatch.
pub(crate) enum CommandAction {
    /// Protocol-level response with an explicit status.
    Respond(Response),
    /// Engine result; the status is remapped per negotiated features.
    Engine(EngineResponse),
    /// Respond, then run the closing chain once written.
    RespondThenClose(Response),
    /// The engine suspended the call; the cookie is parked.
    WouldBlock,
    /// Tear the connection down without responding.
    Disconnect,
}

pub struct Connection {
    id: u64,
    uuid: Uuid,
    pub(crate) transport: Box<dyn Transport>,
    state: ConnState,
    write_and_go: ConnState,
    pub(crate) input: BytePipe,
    pub(crate) send_queue: SendQueue,
    pub(crate) features: FeatureSet,
    pub(crate) ctx: Arc<ServerContext>,
    pub(crate) engine: Option<Arc<dyn BucketEngine>>,
    pub(crate) bucket_name: String,
    pub(crate) sasl: SaslSession,
    pub(crate) sasl_enabled: bool,
    pub(crate) authenticated: bool,
    pub(crate) username: String,
    pub(crate) internal: bool,
    dcp: bool,
    privilege: PrivilegeContext,
    pub(crate) cookie: Cookie,
    server_events: VecDeque<Box<dyn ServerEvent>>,
    refcount: u32,
    priority: Priority,
    max_reqs_per_event: usize,
    num_events: usize,
    clustermap_revno: i64,
    pub(crate) agent_name: String,
    peername: String,
    description: String,
    ev_flags: Interest,
    ev_insert_time: Instant,
    total_recv: u64,
    total_send: u64,
    total_cpu_time: Duration,
    min_sched_time: Duration,
    max_sched_time: Duration,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>, ctx: Arc<ServerContext>, peername: String) -> Self {
        let max_reqs = ctx.settings.reqs_per_event.medium;
        let sasl = SaslSession::new(Arc::clone(&ctx.passwords));
        let mut conn = Self {
            id: ctx.next_connection_id(),
            uuid: Uuid::new_v4(),
            transport,
            state: ConnState::New,
            write_and_go: ConnState::ParseCmd,
            input: BytePipe::new(),
            send_queue: SendQueue::new(),
            features: FeatureSet::new(),
            ctx,
            engine: None,
            bucket_name: String::new(),
            sasl,
            sasl_enabled: true,
            authenticated: false,
            username: "unknown".to_string(),
            internal: false,
            dcp: false,
            privilege: PrivilegeContext::empty(),
            cookie: Cookie::new(),
            server_events: VecDeque::new(),
            refcount: 1,
            priority: Priority::Medium,
            max_reqs_per_event: max_reqs,
            num_events: max_reqs,
            clustermap_revno: -2,
            agent_name: String::new(),
            peername,
            description: String::new(),
            ev_flags: Interest::READ,
            ev_insert_time: Instant::now(),
            total_recv: 0,
            total_send: 0,
            total_cpu_time: Duration::ZERO,
            min_sched_time: Duration::MAX,
            max_sched_time: Duration::ZERO,
        };
        conn.update_description();
        conn
    }

    // ------------------------------------------------------------------
    // Accessors & small state
    // ------------------------------------------------------------------

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[must_use]
    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnState) {
        debug!(conn = self.id, from = %self.state, to = %state, "state transition");
        self.state = state;
    }

    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    fn update_description(&mut self) {
        self.description = if self.authenticated {
            let tag = if self.internal { "System, " } else { "" };
            format!("[ {} ({tag}{}) ]", self.peername, self.username)
        } else {
            format!("[ {} (not authenticated) ]", self.peername)
        };
    }

    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    #[must_use]
    pub fn is_dcp(&self) -> bool {
        self.dcp
    }

    pub fn set_dcp(&mut self, dcp: bool) {
        self.dcp = dcp;
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
        self.max_reqs_per_event = match priority {
            Priority::High => self.ctx.settings.reqs_per_event.high,
            Priority::Medium => self.ctx.settings.reqs_per_event.medium,
            Priority::Low => self.ctx.settings.reqs_per_event.low,
        };
    }

    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_clustermap_revno(&mut self, revision: i64) {
        self.clustermap_revno = revision;
    }

    #[must_use]
    pub fn clustermap_revno(&self) -> i64 {
        self.clustermap_revno
    }

    pub fn reserve(&mut self) {
        self.refcount += 1;
    }

    pub fn release(&mut self) {
        self.refcount = self.refcount.saturating_sub(1);
    }

    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.refcount
    }

    pub fn enqueue_server_event(&mut self, event: Box<dyn ServerEvent>) {
        self.server_events.push_back(event);
    }

    /// Accumulate scheduling time for this connection. The maximum tracks
    /// the largest single slice.
    pub fn add_cpu_time(&mut self, slice: Duration) {
        self.total_cpu_time += slice;
        self.min_sched_time = self.min_sched_time.min(slice);
        self.max_sched_time = self.max_sched_time.max(slice);
    }

    #[must_use]
    pub fn total_cpu_time(&self) -> Duration {
        self.total_cpu_time
    }

    #[must_use]
    pub fn max_sched_time(&self) -> Duration {
        self.max_sched_time
    }

    #[must_use]
    pub fn min_sched_time(&self) -> Duration {
        self.min_sched_time
    }

    /// Whether the parked cookie is awaiting an engine completion.
    #[must_use]
    pub fn is_ewouldblock(&self) -> bool {
        self.cookie.is_ewouldblock()
    }

    /// Engine-side handle to the current cookie.
    #[must_use]
    pub fn cookie_handle(&self) -> crate::server::cookie::CookieHandle {
        self.cookie.handle()
    }

    /// Deliver an engine completion for the parked cookie. Test and
    /// engine-thread convenience for `CookieCore::notify_io_complete`.
    pub fn notify_io_complete(&self, status: EngineCode) {
        self.cookie.handle().notify_io_complete(status);
    }

    /// Await transport readiness for the given interest.
    pub async fn wait_ready(&mut self, interest: Interest) -> std::io::Result<()> {
        self.transport.ready(interest).await
    }

    #[must_use]
    pub fn interest(&self) -> Interest {
        self.ev_flags
    }

    /// Cache-aware interest update: identical flags skip the re-register
    /// unless more than half the idle timeout has elapsed since insertion
    /// (so external clients do not age out spuriously). Internal and DCP
    /// connections are exempt from the timeout entirely.
    pub fn update_event(&mut self, flags: Interest) -> bool {
        let idle = self.ctx.settings.connection_idle_time;
        if self.ev_flags == flags {
            if idle.is_zero() || self.internal || self.dcp {
                return false;
            }
            if self.ev_insert_time.elapsed() <= idle / 2 {
                return false;
            }
            debug!(conn = self.id, "refreshing event registration to avoid premature timeout");
        }
        self.ev_flags = flags;
        self.ev_insert_time = Instant::now();
        true
    }

    /// Deadline for idle teardown, if aging applies to this connection.
    #[must_use]
    pub fn idle_deadline(&self) -> Option<Instant> {
        let idle = self.ctx.settings.connection_idle_time;
        if idle.is_zero() || self.internal || self.dcp {
            return None;
        }
        Some(self.ev_insert_time + idle)
    }

    /// Reset authentication to a blank slate; the client must SASL again.
    pub fn restart_authentication(&mut self) {
        self.sasl = SaslSession::new(Arc::clone(&self.ctx.passwords));
        self.authenticated = false;
        self.internal = false;
        self.username = String::new();
        self.privilege = PrivilegeContext::empty();
        self.update_description();
    }

    /// Install a freshly built privilege context (bucket selection, SASL
    /// completion, certificate auth).
    pub(crate) fn set_privilege_context(&mut self, context: PrivilegeContext) {
        self.privilege = context;
        self.update_description();
    }

    /// Drop a privilege for the rest of the connection's lifetime.
    pub fn drop_privilege(&mut self, privilege: Privilege) -> EngineCode {
        if self.privilege.drop_privilege(privilege) {
            EngineCode::Success
        } else {
            EngineCode::Eaccess
        }
    }

    // ------------------------------------------------------------------
    // Privilege checking
    // ------------------------------------------------------------------

    pub(crate) fn check_privilege(&mut self, privilege: Privilege) -> PrivilegeAccess {
        let mut retries = 0usize;
        loop {
            match self
                .privilege
                .check(privilege, self.ctx.rbac.generation())
            {
                PrivilegeAccess::Ok => return PrivilegeAccess::Ok,
                PrivilegeAccess::Fail => {
                    info!(
                        conn = self.id,
                        privilege = ?privilege,
                        bucket = %self.bucket_name,
                        "privilege denied for {}",
                        self.description
                    );
                    return PrivilegeAccess::Fail;
                }
                PrivilegeAccess::Stale => {
                    if retries == MAX_PRIVILEGE_RETRIES {
                        info!(
                            conn = self.id,
                            retries,
                            "gave up rebuilding privilege context; surfacing stale auth"
                        );
                        return PrivilegeAccess::Stale;
                    }
                    retries += 1;
                    match self.ctx.rbac.create_context(&self.username, &self.bucket_name) {
                        Ok(rebuilt) => {
                            self.privilege = rebuilt;
                            if self.engine.is_none() {
                                // "No bucket" connections hold every bucket
                                // privilege so they see NoBucket rather
                                // than Eaccess.
                                self.privilege.set_bucket_privileges();
                            }
                        }
                        Err(RbacError::NoSuchBucket { .. }) => {
                            match self.ctx.rbac.create_context(&self.username, "") {
                                Ok(rebuilt) => {
                                    info!(
                                        conn = self.id,
                                        bucket = %self.bucket_name,
                                        "bucket disappeared; dropping to empty-bucket context"
                                    );
                                    self.privilege = rebuilt;
                                }
                                Err(_) => return PrivilegeAccess::Stale,
                            }
                        }
                        // The user vanished (catalog replaced under us):
                        // authentication must be redone.
                        Err(RbacError::NoSuchUser { .. }) => return PrivilegeAccess::Stale,
                        Err(err) => {
                            warn!(conn = self.id, error = %err, "privilege rebuild failed");
                            return PrivilegeAccess::Fail;
                        }
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Error remapping
    // ------------------------------------------------------------------

    /// Downgrade an engine code for clients that have not negotiated
    /// XERROR, and decide which codes force a disconnect instead of a
    /// response.
    pub(crate) fn remap_engine_code(&self, code: EngineCode) -> Remapped {
        use EngineCode::*;
        let xerror = self.features.xerror();
        match code {
            Success => Remapped::Status(Status::Success),
            KeyEnoent => Remapped::Status(Status::KeyEnoent),
            KeyEexists => Remapped::Status(Status::KeyEexists),
            Enomem => Remapped::Status(Status::Enomem),
            NotStored => Remapped::Status(Status::NotStored),
            Einval => Remapped::Status(Status::Einval),
            NotSupported => Remapped::Status(Status::NotSupported),
            E2big => Remapped::Status(Status::E2big),
            NotMyPartition => Remapped::Status(Status::NotMyPartition),
            Tmpfail => Remapped::Status(Status::Etmpfail),
            Erange => Remapped::Status(Status::Erange),
            Ebusy => Remapped::Status(Status::Ebusy),
            Failed => Remapped::Status(Status::Einternal),
            // A suspended call never reaches the transmit path.
            EWouldBlock => Remapped::Status(Status::Einternal),
            Disconnect => Remapped::Disconnect,
            Locked => {
                if xerror {
                    Remapped::Status(Status::Locked)
                } else {
                    Remapped::Status(Status::KeyEexists)
                }
            }
            LockedTmpfail => {
                if xerror {
                    Remapped::Status(Status::Locked)
                } else {
                    Remapped::Status(Status::Etmpfail)
                }
            }
            UnknownCollection => {
                if self.features.collections() {
                    Remapped::Status(Status::UnknownCollection)
                } else {
                    Remapped::Status(Status::Einval)
                }
            }
            Eaccess => {
                if xerror {
                    Remapped::Status(Status::Eaccess)
                } else {
                    Remapped::Disconnect
                }
            }
            NoBucket => {
                if xerror {
                    Remapped::Status(Status::NoBucket)
                } else {
                    Remapped::Disconnect
                }
            }
            AuthStale => {
                if xerror {
                    Remapped::Status(Status::AuthStale)
                } else {
                    Remapped::Disconnect
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Response queueing
    // ------------------------------------------------------------------

    pub(crate) fn queue_response(&mut self, response: &Response) {
        self.send_queue.add_msg_hdr(true);
        self.send_queue.add_iov(response.encode());
    }

    fn go_write(&mut self, next: ConnState) {
        self.write_and_go = next;
        self.set_state(ConnState::Write);
    }

    /// Build and queue the wire response for a finished engine call.
    fn respond_engine(&mut self, engine_response: &EngineResponse) {
        let Some(request) = self.cookie.request() else {
            self.set_state(ConnState::Closing);
            return;
        };
        let opcode = request.header.opcode;
        let opaque = request.header.opaque;
        let partition = request.header.partition;
        match self.remap_engine_code(engine_response.code) {
            Remapped::Disconnect => {
                info!(
                    conn = self.id,
                    code = ?engine_response.code,
                    "client not aware of extended error code; disconnecting {}",
                    self.description
                );
                self.set_state(ConnState::Closing);
            }
            Remapped::Status(status) => {
                let mut response = Response::new(opcode, status, opaque);
                if status.is_success() {
                    response = response.with_cas(engine_response.cas);
                    match opcode {
                        Opcode::Get => {
                            // Flags extras precede the document body.
                            response = response
                                .with_extras(vec![0u8; 4])
                                .with_value(engine_response.value.clone());
                        }
                        op if op.is_mutation()
                            && self
                                .features
                                .contains(crate::protocol::Feature::MutationSeqno) =>
                        {
                            let mut extras = Vec::with_capacity(16);
                            extras.extend_from_slice(&engine_response.seqno.to_be_bytes());
                            extras.extend_from_slice(&u64::from(partition).to_be_bytes());
                            response = response.with_extras(extras);
                        }
                        _ => {}
                    }
                }
                let next = if status == Status::AuthStale {
                    // Surfaced stale auth still ends the conversation; the
                    // client reconnects and authenticates again.
                    ConnState::Closing
                } else {
                    ConnState::ParseCmd
                };
                self.queue_response(&response);
                self.go_write(next);
            }
        }
    }

    // ------------------------------------------------------------------
    // Event-loop entry
    // ------------------------------------------------------------------

    /// Run the machinery until it yields. `scratch` is the worker's shared
    /// read buffer, loaned for this step only.
    pub fn run_event_loop(&mut self, which: Interest, scratch: &mut Vec<u8>) {
        self.num_events = self.max_reqs_per_event;
        debug!(conn = self.id, read = which.read, write = which.write, "event loop entry");
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.run_machinery(scratch);
        }));
        if result.is_err() {
            warn!(
                conn = self.id,
                "exception in runloop; closing connection {}", self.description
            );
            self.set_state(ConnState::Closing);
            let second = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                self.run_machinery(scratch);
            }));
            if second.is_err() {
                warn!(conn = self.id, "exception while closing connection");
                self.set_state(ConnState::Destroyed);
            }
        }
    }

    fn run_machinery(&mut self, scratch: &mut Vec<u8>) {
        loop {
            debug!(conn = self.id, state = %self.state, "running task");
            let outcome = match self.state {
                ConnState::New => self.conn_new(),
                ConnState::SslInit => self.conn_ssl_init(),
                ConnState::Read => self.conn_read(scratch),
                ConnState::ParseCmd => self.conn_parse_cmd(),
                ConnState::Execute => self.conn_execute(),
                ConnState::Write => self.conn_write(),
                ConnState::Nack => self.conn_nack(),
                ConnState::Closing => self.conn_closing(),
                ConnState::PendingClose => self.conn_pending_close(),
                ConnState::ImmediateClose => self.conn_immediate_close(),
                ConnState::Destroyed => StateOutcome::Yield,
            };
            if outcome == StateOutcome::Yield {
                return;
            }
        }
    }

    // ------------------------------------------------------------------
    // State handlers
    // ------------------------------------------------------------------

    fn conn_new(&mut self) -> StateOutcome {
        if self.transport.is_tls() {
            self.set_state(ConnState::SslInit);
        } else {
            self.set_state(ConnState::Read);
        }
        StateOutcome::Continue
    }

    fn conn_ssl_init(&mut self) -> StateOutcome {
        match self.transport.drive_handshake() {
            HandshakeStatus::WouldBlock => {
                self.update_event(Interest::READ_WRITE);
                StateOutcome::Yield
            }
            HandshakeStatus::Failed => {
                info!(conn = self.id, "TLS handshake failed; closing");
                self.set_state(ConnState::Closing);
                StateOutcome::Continue
            }
            HandshakeStatus::Complete => {
                match self.transport.peer_certificate() {
                    Some(der) => match self.ctx.cert_mapper.map(&der) {
                        CertMapResult::Success(user) => {
                            if !self.try_auth_from_cert(&user) {
                                self.set_state(ConnState::Closing);
                                return StateOutcome::Continue;
                            }
                        }
                        CertMapResult::NoMatch | CertMapResult::Error => {
                            info!(
                                conn = self.id,
                                "client certificate did not map to a user; disconnecting"
                            );
                            self.set_state(ConnState::Closing);
                            return StateOutcome::Continue;
                        }
                        CertMapResult::NotPresent => {}
                    },
                    None => {
                        if self.ctx.settings.client_cert_mode
                            == crate::server::ClientCertMode::Mandatory
                        {
                            info!(
                                conn = self.id,
                                "client certificate mandatory but not presented; disconnecting"
                            );
                            self.set_state(ConnState::Closing);
                            return StateOutcome::Continue;
                        }
                    }
                }
                self.set_state(ConnState::Read);
                StateOutcome::Continue
            }
        }
    }

    fn try_auth_from_cert(&mut self, user: &str) -> bool {
        match self.ctx.rbac.create_context(user, "") {
            Ok(context) => {
                self.authenticated = true;
                self.username = user.to_string();
                self.internal = context.is_internal();
                self.privilege = context;
                self.privilege.set_bucket_privileges();
                // Certificate-authenticated connections may not change
                // identity over SASL.
                self.sasl_enabled = false;
                info!(
                    conn = self.id,
                    user, "client authenticated via X.509 certificate"
                );
                self.update_description();
                true
            }
            Err(err) => {
                warn!(conn = self.id, user, error = %err, "certificate user not defined");
                false
            }
        }
    }

    fn conn_read(&mut self, scratch: &mut Vec<u8>) -> StateOutcome {
        if self.input.len() >= HEADER_LEN {
            self.set_state(ConnState::ParseCmd);
            return StateOutcome::Continue;
        }
        self.input.ensure_capacity(HEADER_LEN);
        if scratch.is_empty() {
            scratch.resize(16 * 1024, 0);
        }
        match self.transport.try_read(scratch) {
            Ok(0) => {
                info!(
                    conn = self.id,
                    "closing connection; the other side closed {}", self.description
                );
                self.set_state(ConnState::Closing);
                StateOutcome::Continue
            }
            Ok(n) => {
                self.total_recv += n as u64;
                self.input.produce(&scratch[..n]);
                self.set_state(ConnState::ParseCmd);
                StateOutcome::Continue
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                self.update_event(Interest::READ);
                StateOutcome::Yield
            }
            Err(e) => {
                warn!(conn = self.id, error = %e, "closing connection due to read error");
                self.set_state(ConnState::Closing);
                StateOutcome::Continue
            }
        }
    }

    fn conn_parse_cmd(&mut self) -> StateOutcome {
        if self.process_server_events() {
            return StateOutcome::Continue;
        }
        if self.num_events == 0 {
            // Budget for this readiness event exhausted; yield so the
            // worker's other connections get served.
            self.update_event(Interest::READ);
            return StateOutcome::Yield;
        }
        if self.input.len() < HEADER_LEN {
            self.set_state(ConnState::Read);
            return StateOutcome::Continue;
        }

        let header = match RequestHeader::parse(self.input.data(), self.ctx.settings.max_packet_size)
        {
            Ok(header) => header,
            Err(ProtocolError::UnknownOpcode { byte }) => {
                // The frame is structurally sound; consume it and answer
                // with UNKNOWN_COMMAND.
                let data = self.input.data();
                let body_len =
                    u32::from_be_bytes([data[8], data[9], data[10], data[11]]) as usize;
                let opaque = u32::from_le_bytes([data[12], data[13], data[14], data[15]]);
                let frame_len = HEADER_LEN + body_len;
                if self.input.len() < frame_len {
                    self.input.ensure_capacity(frame_len - self.input.len());
                    self.set_state(ConnState::Read);
                    return StateOutcome::Continue;
                }
                self.input.consume(frame_len);
                let response = Response {
                    opcode: byte,
                    status: Status::UnknownCommand,
                    opaque,
                    ..Response::default()
                };
                self.queue_response(&response);
                self.num_events -= 1;
                self.go_write(ConnState::ParseCmd);
                return StateOutcome::Continue;
            }
            Err(err) => {
                info!(conn = self.id, error = %err, "protocol violation; nacking connection");
                let response = Response {
                    opcode: self.input.data().get(1).copied().unwrap_or(0),
                    status: Status::Einval,
                    ..Response::default()
                };
                self.queue_response(&response);
                self.set_state(ConnState::Nack);
                return StateOutcome::Continue;
            }
        };

        if self.input.len() < header.frame_len() {
            self.input
                .ensure_capacity(header.frame_len() - self.input.len());
            self.set_state(ConnState::Read);
            return StateOutcome::Continue;
        }
        self.input.consume(HEADER_LEN);
        let body = self.input.split_to(header.body_len as usize);
        let request = Request::from_frame(header, body);

        if let Some(privilege) = required_privilege(header.opcode) {
            // A stale context is rebuilt (bounded) before the check
            // resolves; exhaustion surfaces AuthStale so the client can
            // re-authenticate.
            match self.check_privilege(privilege) {
                PrivilegeAccess::Ok => {}
                PrivilegeAccess::Fail => {
                    self.cookie.set_request(request);
                    self.num_events -= 1;
                    self.respond_engine(&EngineResponse::code(EngineCode::Eaccess));
                    return StateOutcome::Continue;
                }
                PrivilegeAccess::Stale => {
                    self.cookie.set_request(request);
                    self.num_events -= 1;
                    self.respond_engine(&EngineResponse::code(EngineCode::AuthStale));
                    return StateOutcome::Continue;
                }
            }
        }

        self.cookie.set_request(request);
        self.num_events -= 1;
        self.set_state(ConnState::Execute);
        StateOutcome::Continue
    }

    fn conn_execute(&mut self) -> StateOutcome {
        // Re-entry after an engine completion: the status delivered by
        // notify_io_complete finishes the suspended call.
        if let Some(code) = self.cookie.take_aiostat() {
            self.respond_engine(&EngineResponse::code(code));
            return StateOutcome::Continue;
        }
        match self.dispatch_command() {
            CommandAction::Respond(response) => {
                self.queue_response(&response);
                self.go_write(ConnState::ParseCmd);
                StateOutcome::Continue
            }
            CommandAction::RespondThenClose(response) => {
                self.queue_response(&response);
                self.go_write(ConnState::Closing);
                StateOutcome::Continue
            }
            CommandAction::Engine(engine_response) => {
                self.respond_engine(&engine_response);
                StateOutcome::Continue
            }
            CommandAction::WouldBlock => {
                self.cookie.set_ewouldblock();
                StateOutcome::Yield
            }
            CommandAction::Disconnect => {
                self.set_state(ConnState::Closing);
                StateOutcome::Continue
            }
        }
    }

    pub(crate) fn transmit(&mut self) -> TransmitResult {
        let Some(slices) = self.send_queue.current_slices() else {
            if self.transport.pending_output() {
                return TransmitResult::SoftError;
            }
            return TransmitResult::Complete;
        };
        let written = match self.transport.try_write_vectored(&slices) {
            Ok(0) => {
                warn!(conn = self.id, "transport accepted zero bytes");
                return TransmitResult::HardError;
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                return TransmitResult::SoftError;
            }
            Err(e) => {
                info!(conn = self.id, error = %e, "failed to send; closing {}", self.description);
                return TransmitResult::HardError;
            }
        };
        drop(slices);
        self.total_send += written as u64;
        self.send_queue.consume(written);
        if self.send_queue.is_drained() {
            if self.transport.pending_output() {
                // Ciphertext still buffered below us; the transmission is
                // not complete until it drains.
                return TransmitResult::SoftError;
            }
            TransmitResult::Complete
        } else {
            TransmitResult::Incomplete
        }
    }

    fn conn_write(&mut self) -> StateOutcome {
        match self.transmit() {
            TransmitResult::Complete => {
                self.send_queue.shrink();
                if self.write_and_go == ConnState::ParseCmd {
                    self.cookie.reset();
                }
                let next = self.write_and_go;
                self.write_and_go = ConnState::ParseCmd;
                self.set_state(next);
                StateOutcome::Continue
            }
            TransmitResult::Incomplete => StateOutcome::Continue,
            TransmitResult::SoftError => {
                self.update_event(Interest::WRITE);
                StateOutcome::Yield
            }
            TransmitResult::HardError => {
                self.set_state(ConnState::Closing);
                StateOutcome::Continue
            }
        }
    }

    fn conn_nack(&mut self) -> StateOutcome {
        self.go_write(ConnState::Closing);
        StateOutcome::Continue
    }

    fn conn_closing(&mut self) -> StateOutcome {
        let parked = self.cookie.is_ewouldblock();
        self.transport.shutdown();
        if self.refcount > 1 || parked {
            self.set_state(ConnState::PendingClose);
        } else {
            self.set_state(ConnState::ImmediateClose);
        }
        StateOutcome::Continue
    }

    fn conn_pending_close(&mut self) -> StateOutcome {
        if self.refcount <= 1 && !self.cookie.is_ewouldblock() {
            self.set_state(ConnState::ImmediateClose);
            return StateOutcome::Continue;
        }
        StateOutcome::Yield
    }

    fn conn_immediate_close(&mut self) -> StateOutcome {
        debug!(conn = self.id, "destroying connection {}", self.description);
        self.cookie.reset();
        self.set_state(ConnState::Destroyed);
        StateOutcome::Continue
    }

    /// Drain pending out-of-band events. Returns whether an event changed
    /// the connection's state.
    fn process_server_events(&mut self) -> bool {
        let Some(mut event) = self.server_events.pop_front() else {
            return false;
        };
        let before = self.state;
        debug!(conn = self.id, event = event.description(), "processing server event");
        if !event.execute(self) {
            self.server_events.push_front(event);
        }
        self.state != before
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("peer", &self.peername)
            .field("authenticated", &self.authenticated)
            .field("bucket", &self.bucket_name)
            .field("refcount", &self.refcount)
            .finish()
    }
}
