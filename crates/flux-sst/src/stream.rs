//! The user-facing logical stream handle and the atomic send-status word
//! that coordinates concurrent senders with concurrent closers.
//!
//! Bit layout of the status word (one `AtomicU32`):
//!   bits 0..16  sender count — incremented for the duration of one `send`
//!   bits 16..32 closer multiplicity, scaled by [`CLOSING_UNIT`]
//!
//! At most three concurrent closers are expected (the recv thread tearing
//! down a peer-initiated close, the reactor's write-completion path, and a
//! user thread calling `close()`); a fourth is a programming error.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use flux_utils::safe_assert;
use tracing::debug;

use crate::callbacks::CallbackSet;
use crate::codec::StreamId;
use crate::error::SstError;
use crate::multiplex::{MultiplexedSocket, RawRequest};

const CLOSING_UNIT: u32 = 1 << 16;
const SENDER_MASK: u32 = CLOSING_UNIT - 1;
const CLOSING_MASK: u32 = !SENDER_MASK;
const MAX_CLOSERS: u32 = 3;

pub(crate) struct SendStatus(AtomicU32);

impl SendStatus {
    pub(crate) fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Runs `f` unless a closer already owns the slot, in which case `f` is
    /// dropped unrun (releasing anything it captured) and `None` is
    /// returned.
    pub(crate) fn try_send<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let v = self.0.fetch_add(1, Ordering::AcqRel) + 1;
        let out = if v & CLOSING_MASK == 0 { Some(f()) } else { None };
        self.0.fetch_sub(1, Ordering::AcqRel);
        out
    }

    /// Claims a closing slot. Returns `true` if this call is the first
    /// closer and therefore owns the actual teardown, having first spun
    /// until in-flight senders drained. Later closers still register (up to
    /// the 3-closer cap) but skip the spin and return `false`.
    pub(crate) fn begin_close(&self) -> bool {
        let prev = self.0.fetch_add(CLOSING_UNIT, Ordering::AcqRel);
        let closers_before = (prev & CLOSING_MASK) / CLOSING_UNIT;
        safe_assert!(
            closers_before < MAX_CLOSERS,
            "more than {MAX_CLOSERS} concurrent closers on one LogicalStream"
        );

        let first = closers_before == 0;
        if first {
            while self.0.load(Ordering::Acquire) & SENDER_MASK != 0 {
                std::hint::spin_loop();
            }
        }
        first
    }
}

/// How a [`LogicalStream::send`] should be placed and whether it may be
/// dropped under backpressure. There is deliberately no
/// `OrderedUnreliable` variant — that combination is unrepresentable rather
/// than merely rejected at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    OrderedReliable,
    UnorderedReliable,
    UnorderedUnreliable,
}

impl Reliability {
    fn flags(self) -> (bool, bool) {
        match self {
            Reliability::OrderedReliable => (false, false),
            Reliability::UnorderedReliable => (true, false),
            Reliability::UnorderedUnreliable => (true, true),
        }
    }
}

/// An application-visible, independently addressable byte stream within one
/// [`MultiplexedSocket`]. Cheap to clone in spirit (it holds an `Arc` to the
/// socket) but deliberately doesn't implement `Clone` itself — use
/// [`LogicalStream::clone_within_transport`] to open a *new* stream sharing
/// the same peer connection.
pub struct LogicalStream {
    socket: Arc<MultiplexedSocket>,
    sid: StreamId,
    status: Arc<SendStatus>,
}

impl LogicalStream {
    pub(crate) fn new(socket: Arc<MultiplexedSocket>, sid: StreamId) -> Self {
        Self { socket, sid, status: Arc::new(SendStatus::new()) }
    }

    pub fn id(&self) -> StreamId {
        self.sid
    }

    /// Sends `data` with the given reliability.
    ///
    /// If a `close()` is in progress or completed, the payload is dropped
    /// and `Ok(())` is returned — send-to-closed-stream is fire-and-forget,
    /// not an error. Encode failures (`PayloadTooLarge`) and a socket not
    /// `Connected` (`NotConnected`) are programmer-visible and returned as
    /// `Err`.
    pub fn send(&self, data: Vec<u8>, reliability: Reliability) -> Result<(), SstError> {
        let (unordered, unreliable) = reliability.flags();
        let sid = self.sid;
        let socket = &self.socket;

        match self.status.try_send(|| {
            socket.send_bytes(RawRequest {
                origin_stream: sid,
                unordered,
                unreliable,
                payload: data,
            })
        }) {
            Some(result) => result,
            None => {
                debug!(stream = sid, "sst: send to closed stream, dropping");
                Ok(())
            }
        }
    }

    /// Closes the stream: stops inbound delivery immediately, waits for any
    /// in-flight `send` to drain, fires `on_disconnected` once locally, then
    /// tells the peer via `CLOSE_STREAM`. Idempotent — a second `close()`
    /// call (or a concurrent one racing from another thread) registers as a
    /// closer but performs no further work.
    pub fn close(&self) {
        if !self.status.begin_close() {
            return;
        }
        if let Some(cbs) = self.socket.remove_callbacks(self.sid) {
            cbs.fire_disconnected();
        }
        self.socket.begin_stream_close(self.sid);
    }

    /// Opens a new logical stream on the same peer connection as `self`.
    /// Fails with [`SstError::NotConnected`] if the underlying socket isn't
    /// `Connected`.
    pub fn clone_within_transport(&self, cbs: CallbackSet) -> Result<LogicalStream, SstError> {
        self.socket.open_stream(Arc::new(cbs))
    }
}
