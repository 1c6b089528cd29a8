//! Cookies: per-request handles threaded through the engine for
//! asynchronous completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::engine::EngineCode;
use crate::protocol::Request;

/// Shared core of a cookie. Engines clone the handle when they suspend a
/// call and use it to deliver the completion status from another thread.
#[derive(Debug, Default)]
pub struct CookieCore {
    ewouldblock: AtomicBool,
    aiostat: Mutex<Option<EngineCode>>,
    notify: Notify,
}

/// Cloneable engine-side handle to a parked cookie.
pub type CookieHandle = Arc<CookieCore>;

impl CookieCore {
    /// Engine side: deliver the final status for a suspended call and wake
    /// the owning worker.
    pub fn notify_io_complete(&self, status: EngineCode) {
        *self.aiostat.lock() = Some(status);
        self.ewouldblock.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    #[must_use]
    pub fn is_ewouldblock(&self) -> bool {
        self.ewouldblock.load(Ordering::Acquire)
    }

    /// Wait until the engine signals completion.
    pub async fn completed(&self) {
        self.notify.notified().await;
    }
}

/// The per-request state owned by a connection.
///
/// One cookie lives for the duration of one command; `reset` recycles it
/// between requests.
#[derive(Debug, Default)]
pub struct Cookie {
    core: CookieHandle,
    request: Option<Request>,
}

impl Cookie {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle the engine keeps while a call is suspended.
    #[must_use]
    pub fn handle(&self) -> CookieHandle {
        Arc::clone(&self.core)
    }

    pub fn set_request(&mut self, request: Request) {
        self.request = Some(request);
    }

    #[must_use]
    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    /// Park this cookie pending engine completion.
    pub fn set_ewouldblock(&self) {
        self.core.ewouldblock.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_ewouldblock(&self) -> bool {
        self.core.is_ewouldblock()
    }

    /// Take the completion status delivered by the engine, if any.
    pub fn take_aiostat(&self) -> Option<EngineCode> {
        self.core.aiostat.lock().take()
    }

    /// Recycle between requests. The shared core survives so a straggling
    /// engine completion cannot touch a freed cookie.
    pub fn reset(&mut self) {
        self.request = None;
        self.core.ewouldblock.store(false, Ordering::Release);
        *self.core.aiostat.lock() = None;
    }
}
