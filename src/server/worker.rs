//! The worker reactor pool.
//!
//! A fixed set of OS threads, each running a single-threaded reactor that
//! owns a disjoint set of connections. A connection is bound to its worker
//! for life; the worker re-enters the state machine on readiness events,
//! engine completions and idle timeouts, and loans its shared read buffer
//! to the connection for the duration of each step.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::server::connection::Connection;
use crate::server::state_machine::ConnState;
use crate::server::tls::TlsChannel;
use crate::server::transport::{Interest, TcpTransport, TlsTransport, Transport};
use crate::server::ServerContext;

/// Size of the per-worker shared read buffer loaned to connections.
const WORKER_READ_BUFFER: usize = 64 * 1024;

/// A freshly accepted socket on its way to a worker.
pub struct ConnectionSeed {
    pub stream: std::net::TcpStream,
    pub tls: Option<Arc<rustls::ServerConfig>>,
    pub peer: String,
}

enum WorkerMessage {
    Accept(ConnectionSeed),
    Shutdown,
}

struct WorkerHandle {
    tx: flume::Sender<WorkerMessage>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Fixed pool of reactor threads.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    next: AtomicUsize,
}

impl WorkerPool {
    /// Spawn the configured number of worker threads.
    pub fn new(ctx: Arc<ServerContext>) -> std::io::Result<Self> {
        let count = ctx.settings.num_worker_threads.max(1);
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let (tx, rx) = flume::unbounded();
            let worker_ctx = Arc::clone(&ctx);
            let thread = thread::Builder::new()
                .name(format!("tidemark-worker-{index}"))
                .spawn(move || worker_main(index, rx, worker_ctx))?;
            workers.push(WorkerHandle {
                tx,
                thread: Some(thread),
            });
        }
        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    /// Hand an accepted socket to the next worker, round robin.
    pub fn dispatch(&self, seed: ConnectionSeed) {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        if self.workers[index]
            .tx
            .send(WorkerMessage::Accept(seed))
            .is_err()
        {
            warn!(worker = index, "worker is gone; dropping accepted connection");
        }
    }

    /// Stop every worker and wait for them to drain.
    pub fn shutdown(mut self) {
        for worker in &self.workers {
            let _ = worker.tx.send(WorkerMessage::Shutdown);
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

fn worker_main(index: usize, rx: flume::Receiver<WorkerMessage>, ctx: Arc<ServerContext>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            warn!(worker = index, error = %err, "failed to build worker runtime");
            return;
        }
    };
    let local = tokio::task::LocalSet::new();
    info!(worker = index, "worker started");
    local.block_on(&runtime, async move {
        // One read buffer per worker, loaned to whichever connection is
        // being driven.
        let buffers = Rc::new(RefCell::new(vec![0u8; WORKER_READ_BUFFER]));
        while let Ok(message) = rx.recv_async().await {
            match message {
                WorkerMessage::Shutdown => break,
                WorkerMessage::Accept(seed) => {
                    match build_connection(seed, &ctx) {
                        Ok(conn) => {
                            let buffers = Rc::clone(&buffers);
                            tokio::task::spawn_local(drive_connection(conn, buffers));
                        }
                        Err(err) => {
                            warn!(worker = index, error = %err, "failed to set up connection");
                        }
                    }
                }
            }
        }
        debug!(worker = index, "worker stopping");
    });
}

fn build_connection(
    seed: ConnectionSeed,
    ctx: &Arc<ServerContext>,
) -> std::io::Result<Connection> {
    seed.stream.set_nonblocking(true)?;
    let stream = tokio::net::TcpStream::from_std(seed.stream)?;
    let transport: Box<dyn Transport> = match seed.tls {
        Some(config) => {
            let channel = TlsChannel::new(config, ctx.settings.bio_drain_buffer_size)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
            Box::new(TlsTransport::new(Box::new(TcpTransport::new(stream)), channel))
        }
        None => Box::new(TcpTransport::new(stream)),
    };
    Ok(Connection::new(transport, Arc::clone(ctx), seed.peer))
}

/// Drive one connection until it is destroyed. Exactly one entry into the
/// state machine at a time.
async fn drive_connection(mut conn: Connection, buffers: Rc<RefCell<Vec<u8>>>) {
    let mut which = Interest::READ;
    loop {
        let started = Instant::now();
        {
            let mut scratch = buffers.borrow_mut();
            conn.run_event_loop(which, &mut scratch);
        }
        conn.add_cpu_time(started.elapsed());

        match conn.state() {
            ConnState::Destroyed => break,
            ConnState::PendingClose => {
                // Parked cookies must complete before the teardown
                // finishes; the engine's notify wakes us.
                conn.cookie_handle().completed().await;
                which = Interest::READ;
            }
            _ if conn.is_ewouldblock() => {
                conn.cookie_handle().completed().await;
                which = Interest::READ;
            }
            _ => {
                let interest = conn.interest();
                let readiness = match conn.idle_deadline() {
                    Some(deadline) => {
                        match tokio::time::timeout_at(deadline.into(), conn.wait_ready(interest))
                            .await
                        {
                            Ok(result) => result,
                            Err(_) => {
                                info!(
                                    conn = conn.id(),
                                    "closing idle connection {}",
                                    conn.description()
                                );
                                conn.set_state(ConnState::Closing);
                                which = Interest::READ;
                                continue;
                            }
                        }
                    }
                    None => conn.wait_ready(interest).await,
                };
                if let Err(err) = readiness {
                    debug!(conn = conn.id(), error = %err, "readiness wait failed");
                    conn.set_state(ConnState::Closing);
                }
                which = interest;
            }
        }
    }
    debug!(conn = conn.id(), "connection reclaimed");
}
