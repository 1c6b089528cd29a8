//! Connection buffering: the growable input pipe and the scatter-gather
//! send queue.
//!
//! The send queue mirrors the classic `sendmsg` shape: an ordered list of
//! message headers, each carrying up to [`IOV_MAX`] buffer slices. Partial
//! sends adjust the front slice in place; completed slices are dropped.
//! Between requests both lists shrink back to their initial capacity once
//! they have grown past the high watermark.

use std::collections::VecDeque;
use std::io::IoSlice;

use bytes::{Buf, Bytes, BytesMut};

/// Maximum iovec entries per message header.
pub const IOV_MAX: usize = 1024;

/// Initial message-list capacity.
pub const MSG_LIST_INITIAL: usize = 10;

/// Message-list length that triggers a shrink between requests.
pub const MSG_LIST_HIGHWAT: usize = 600;

/// Growable input byte pipe.
///
/// The connection guarantees capacity for at least one request header
/// before reading, and consumes parsed frames from the front.
#[derive(Debug, Default)]
pub struct BytePipe {
    buf: BytesMut,
}

impl BytePipe {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Reserve room for at least `additional` further bytes.
    pub fn ensure_capacity(&mut self, additional: usize) {
        self.buf.reserve(additional);
    }

    /// View of the buffered bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Append freshly received bytes.
    pub fn produce(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Detach the first `n` buffered bytes.
    pub fn split_to(&mut self, n: usize) -> Bytes {
        self.buf.split_to(n).freeze()
    }

    /// Drop the first `n` buffered bytes.
    pub fn consume(&mut self, n: usize) {
        self.buf.advance(n);
    }
}

/// Result of one transmit pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransmitResult {
    /// Everything queued has reached the kernel (and, on TLS connections,
    /// the ciphertext pipe is drained).
    Complete,
    /// Progress was made; call again.
    Incomplete,
    /// The transport would block; re-arm write readiness and yield.
    SoftError,
    /// Unrecoverable transport failure; close the connection.
    HardError,
}

#[derive(Debug, Default)]
struct MsgHdr {
    entries: VecDeque<Bytes>,
}

impl MsgHdr {
    fn is_drained(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove `written` bytes from the front, adjusting a partially sent
    /// slice in place.
    fn consume(&mut self, mut written: usize) {
        while written > 0 {
            let Some(front) = self.entries.front_mut() else {
                return;
            };
            if written >= front.len() {
                written -= front.len();
                self.entries.pop_front();
            } else {
                front.advance(written);
                return;
            }
        }
    }
}

/// Ordered response data awaiting transmission.
#[derive(Debug)]
pub struct SendQueue {
    msgs: Vec<MsgHdr>,
    curr: usize,
    pending_bytes: usize,
    iov_used: usize,
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SendQueue {
    #[must_use]
    pub fn new() -> Self {
        let mut msgs = Vec::with_capacity(MSG_LIST_INITIAL);
        msgs.push(MsgHdr::default());
        Self {
            msgs,
            curr: 0,
            pending_bytes: 0,
            iov_used: 0,
        }
    }

    /// Start a fresh message header. With `reset`, the whole queue is
    /// cleared first (used at the start of each response).
    pub fn add_msg_hdr(&mut self, reset: bool) {
        if reset {
            self.msgs.clear();
            self.curr = 0;
            self.pending_bytes = 0;
            self.iov_used = 0;
        }
        self.msgs.push(MsgHdr::default());
    }

    /// Append a buffer slice to the current message, opening a new message
    /// header when the current one is at [`IOV_MAX`] entries.
    pub fn add_iov(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        if self
            .msgs
            .last()
            .is_some_and(|m| m.entries.len() == IOV_MAX)
        {
            self.add_msg_hdr(false);
        }
        self.pending_bytes += data.len();
        self.iov_used += 1;
        if let Some(last) = self.msgs.last_mut() {
            last.entries.push_back(data);
        }
    }

    /// Bytes not yet handed to the transport.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.pending_bytes
    }

    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.pending_bytes == 0
    }

    /// Skip fully drained message headers and expose the current one as a
    /// scatter list, or `None` when everything has been sent.
    pub fn current_slices(&mut self) -> Option<Vec<IoSlice<'_>>> {
        while self.curr < self.msgs.len() && self.msgs[self.curr].is_drained() {
            self.curr += 1;
        }
        if self.curr >= self.msgs.len() {
            return None;
        }
        Some(
            self.msgs[self.curr]
                .entries
                .iter()
                .map(|b| IoSlice::new(b))
                .collect(),
        )
    }

    /// Account for `written` bytes sent from the current message.
    pub fn consume(&mut self, written: usize) {
        self.pending_bytes -= written.min(self.pending_bytes);
        if let Some(msg) = self.msgs.get_mut(self.curr) {
            msg.consume(written);
        }
    }

    /// Shrink back to the initial capacity once past the high watermark.
    /// Only legal between requests, when the queue is drained.
    pub fn shrink(&mut self) {
        if self.msgs.len() > MSG_LIST_HIGHWAT || self.iov_used > MSG_LIST_HIGHWAT {
            self.msgs = Vec::with_capacity(MSG_LIST_INITIAL);
            self.msgs.push(MsgHdr::default());
            self.curr = 0;
            self.pending_bytes = 0;
            self.iov_used = 0;
        }
    }

    /// Number of message headers currently allocated.
    #[must_use]
    pub fn msg_count(&self) -> usize {
        self.msgs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_send_adjusts_front_slice() {
        let mut queue = SendQueue::new();
        queue.add_iov(Bytes::from_static(b"hello "));
        queue.add_iov(Bytes::from_static(b"world"));
        assert_eq!(queue.pending_bytes(), 11);

        queue.consume(8);
        assert_eq!(queue.pending_bytes(), 3);
        let slices = queue.current_slices().unwrap();
        assert_eq!(&*slices[0], b"rld");
    }

    #[test]
    fn full_msg_hdr_opens_a_new_one() {
        let mut queue = SendQueue::new();
        for _ in 0..IOV_MAX + 1 {
            queue.add_iov(Bytes::from_static(b"x"));
        }
        assert_eq!(queue.msg_count(), 2);
    }

    #[test]
    fn drained_queue_reports_complete() {
        let mut queue = SendQueue::new();
        queue.add_iov(Bytes::from_static(b"abc"));
        queue.consume(3);
        assert!(queue.is_drained());
        assert!(queue.current_slices().is_none());
    }
}
