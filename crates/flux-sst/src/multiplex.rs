//! Aggregates `width` parallel TCP sub-connections into one peer session:
//! stream-id allocation, the per-stream callback table, the connect
//! handshake, and the `send`/`poll` surface the rest of the crate is built
//! on.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use mio::{Events, Poll, Registry, Token};
use tracing::{debug, warn};

use crate::callbacks::CallbackSet;
use crate::codec::{self, CONTROL_STREAM, StreamId};
use crate::config::SstConfig;
use crate::control::{self, ControlFrame};
use crate::error::SstError;
use crate::handshake::{self, HandshakeConn, HandshakeStatus};
use crate::stream::LogicalStream;
use crate::subconn::{ConnState, SubConnection};

/// A send unit handed to [`MultiplexedSocket::send_bytes`]. `(ordered,
/// unreliable)` — i.e. `unordered == false && unreliable == true` — is
/// rejected with [`SstError::IllegalReliability`]; [`crate::stream::Reliability`]
/// makes that combination unrepresentable from [`LogicalStream::send`], but
/// this lower-level entry point still validates it.
pub struct RawRequest {
    pub origin_stream: StreamId,
    pub unordered: bool,
    pub unreliable: bool,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketState {
    Unconnected = 0,
    Connecting = 1,
    Connected = 2,
    Draining = 3,
    Disconnected = 4,
}

impl From<u8> for SocketState {
    fn from(value: u8) -> Self {
        match value {
            0 => SocketState::Unconnected,
            1 => SocketState::Connecting,
            2 => SocketState::Connected,
            3 => SocketState::Draining,
            _ => SocketState::Disconnected,
        }
    }
}

type SubstreamAcceptFn = Box<dyn FnMut(LogicalStream) + Send>;

struct Inner {
    poll: Poll,
    registry: Registry,
    events: Events,
    subconns: Vec<SubConnection>,
    streams: HashMap<StreamId, Arc<CallbackSet>>,
    rr_counter: usize,
    pending_close: HashMap<StreamId, Instant>,
    /// Stream ids for which a `NEW_STREAM` was decoded but
    /// `add_callbacks` hasn't installed the real callback set yet — the
    /// window between `substream_accept` being queued and it actually
    /// running once the stream-table lock is released.
    pending_accept: HashMap<StreamId, Vec<Vec<u8>>>,
}

enum PendingAction {
    Bytes(Arc<CallbackSet>, Vec<u8>),
    Disconnected(Arc<CallbackSet>),
    NewStream(StreamId),
}

/// One peer session: `width` TCP sub-connections, a stream-id allocator,
/// and the callback table routing inbound frames to [`LogicalStream`]s.
///
/// Owns its own `mio::Poll` — there is no process-wide reactor singleton in
/// this crate (see the crate-level design notes). The caller is
/// responsible for calling [`MultiplexedSocket::poll`] regularly, the same
/// way `flux-network`'s `TcpConnector::poll_with` is driven from the
/// caller's own loop.
pub struct MultiplexedSocket {
    inner: Mutex<Inner>,
    state: AtomicU8,
    next_local_id: AtomicU64,
    config: SstConfig,
    substream_accept: Mutex<SubstreamAcceptFn>,
    self_ref: Weak<MultiplexedSocket>,
}

impl MultiplexedSocket {
    /// Active/initiator side: opens `config.width()` TCP connections to
    /// `addr` sequentially, driving each through the handshake described in
    /// the crate's wire protocol before the next one is attempted.
    ///
    /// `substream_accept` is invoked (on a later [`poll`](Self::poll) call)
    /// for every `NEW_STREAM` the peer opens.
    pub fn connect(
        addr: SocketAddr,
        config: SstConfig,
        substream_accept: impl FnMut(LogicalStream) + Send + 'static,
    ) -> Result<Arc<MultiplexedSocket>, SstError> {
        let mut poll = Poll::new().map_err(|_| SstError::ConnectionFailed)?;
        let registry = poll.registry().try_clone().map_err(|_| SstError::ConnectionFailed)?;
        let nonce: u64 = rand::random();
        let deadline = Instant::now() + config.handshake_timeout;

        let mut subconns = Vec::with_capacity(config.width());
        for i in 0..config.width() {
            let raw = mio::net::TcpStream::connect(addr).map_err(|_| SstError::ConnectionFailed)?;
            let token = Token(i);
            let out = if i == 0 {
                handshake::encode_hello(config.width() as u8, nonce)
            } else {
                handshake::encode_nonce(nonce)
            };
            let want_in = if i == 0 { 2 } else { 1 };

            let mut hs = HandshakeConn::new(raw, token, out, want_in);
            hs.register(&registry).map_err(|_| SstError::ConnectionFailed)?;

            let status = Self::drive_handshake_to_completion(&mut poll, &registry, &mut hs, deadline)?;
            if status != HandshakeStatus::Done {
                let _ = hs.deregister(&registry);
                return Err(SstError::HandshakeFailed);
            }

            let reply_ok = if i == 0 {
                hs.received().first().copied() == Some(handshake::PROTOCOL_VERSION)
                    && hs.received().get(1).copied() == Some(config.width() as u8)
            } else {
                hs.received().first().copied() == Some(handshake::ACK_BYTE)
            };
            if !reply_ok {
                let _ = hs.deregister(&registry);
                return Err(SstError::HandshakeFailed);
            }

            let _ = hs.deregister(&registry);
            let raw = hs.into_stream();
            let sc = SubConnection::new(raw, &registry, Token(i), config.socket_buf_size)
                .map_err(|_| SstError::ConnectionFailed)?;
            subconns.push(sc);
        }

        debug!(width = config.width(), ?addr, "sst: connected");

        Ok(Arc::new_cyclic(|weak| MultiplexedSocket {
            inner: Mutex::new(Inner {
                poll,
                registry,
                events: Events::with_capacity(128),
                subconns,
                streams: HashMap::new(),
                rr_counter: 0,
                pending_close: HashMap::new(),
                pending_accept: HashMap::new(),
            }),
            state: AtomicU8::new(SocketState::Connected as u8),
            next_local_id: AtomicU64::new(1), // odd: initiator-allocated
            config,
            substream_accept: Mutex::new(Box::new(substream_accept)),
            self_ref: weak.clone(),
        }))
    }

    /// Accept side: wraps an already width-complete set of raw streams
    /// (handshake already sniffed and replied to by [`crate::listener::Listener`])
    /// into a `Connected` socket.
    pub(crate) fn from_accepted(
        raw_streams: Vec<mio::net::TcpStream>,
        config: SstConfig,
    ) -> Result<Arc<MultiplexedSocket>, SstError> {
        let poll = Poll::new().map_err(|_| SstError::ConnectionFailed)?;
        let registry = poll.registry().try_clone().map_err(|_| SstError::ConnectionFailed)?;

        let mut subconns = Vec::with_capacity(raw_streams.len());
        for (i, raw) in raw_streams.into_iter().enumerate() {
            let sc = SubConnection::new(raw, &registry, Token(i), config.socket_buf_size)
                .map_err(|_| SstError::ConnectionFailed)?;
            subconns.push(sc);
        }

        Ok(Arc::new_cyclic(|weak| MultiplexedSocket {
            inner: Mutex::new(Inner {
                poll,
                registry,
                events: Events::with_capacity(128),
                subconns,
                streams: HashMap::new(),
                rr_counter: 0,
                pending_close: HashMap::new(),
                pending_accept: HashMap::new(),
            }),
            state: AtomicU8::new(SocketState::Connected as u8),
            next_local_id: AtomicU64::new(2), // even: acceptor-allocated
            config,
            substream_accept: Mutex::new(Box::new(|_: LogicalStream| {})),
            self_ref: weak.clone(),
        }))
    }

    fn drive_handshake_to_completion(
        poll: &mut Poll,
        registry: &Registry,
        hs: &mut HandshakeConn,
        deadline: Instant,
    ) -> Result<HandshakeStatus, SstError> {
        let mut events = Events::with_capacity(4);
        loop {
            if Instant::now() >= deadline {
                return Ok(HandshakeStatus::Pending);
            }
            if let Err(err) = poll.poll(&mut events, Some(Duration::from_millis(25))) {
                warn!(?err, "sst: handshake poll failed");
                return Err(SstError::HandshakeFailed);
            }
            for ev in events.iter() {
                let status = hs.poll_with(registry, ev);
                if status != HandshakeStatus::Pending {
                    return Ok(status);
                }
            }
        }
    }

    pub fn state(&self) -> SocketState {
        SocketState::from(self.state.load(Ordering::Acquire))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SocketState::Connected
    }

    pub fn width(&self) -> usize {
        self.inner.lock().unwrap().subconns.len()
    }

    pub fn set_substream_accept(&self, f: impl FnMut(LogicalStream) + Send + 'static) {
        *self.substream_accept.lock().unwrap() = Box::new(f);
    }

    /// Opens a new logical stream and notifies the peer via `NEW_STREAM`.
    pub fn open_stream(&self, cbs: Arc<CallbackSet>) -> Result<LogicalStream, SstError> {
        let me = self.self_ref.upgrade().ok_or(SstError::NotConnected)?;
        let sid = self.new_id()?;
        self.add_callbacks(sid, Some(Arc::clone(&cbs)))?;
        self.send_control(sid, control::NEW_STREAM)?;
        Ok(LogicalStream::new(me, sid))
    }

    /// `next_local_stream_id`, then advances it by 2 (parity fixed by
    /// side). Wraparound is a fatal protocol error.
    pub(crate) fn new_id(&self) -> Result<StreamId, SstError> {
        let id = self.next_local_id.fetch_add(2, Ordering::AcqRel);
        if id >= StreamId::MAX - 2 {
            return Err(SstError::StreamIdExhausted);
        }
        Ok(id)
    }

    /// Installs (`Some`) or removes (`None`) the callback set for `sid`.
    ///
    /// A [`MultiplexedSocket`] only ever exists once its handshake has fully
    /// completed (`connect`/`from_accepted` both construct it already
    /// `Connected`; there is no externally observable `Connecting` state), so
    /// every registrant is a "late" one by the terms of the wire protocol's
    /// session-level connected event: `on_connected(true)` fires synchronously
    /// on registration, once, for every `sid`.
    pub fn add_callbacks(&self, sid: StreamId, cbs: Option<Arc<CallbackSet>>) -> Result<(), SstError> {
        let mut inner = self.inner.lock().unwrap();
        match cbs {
            None => {
                inner.streams.remove(&sid);
                Ok(())
            }
            Some(cbs) => {
                let state = self.state();
                if state != SocketState::Connected {
                    return Err(SstError::NotConnected);
                }
                inner.streams.insert(sid, Arc::clone(&cbs));
                // Deliver, in arrival order, any bytes that reached this sid
                // before the callback set was installed (see `poll`'s
                // `pending_accept` buffering).
                let buffered = inner.pending_accept.remove(&sid).unwrap_or_default();
                drop(inner);
                cbs.fire_connected(true);
                for body in buffered {
                    cbs.fire_bytes_received(&body);
                }
                Ok(())
            }
        }
    }

    pub(crate) fn remove_callbacks(&self, sid: StreamId) -> Option<Arc<CallbackSet>> {
        self.inner.lock().unwrap().streams.remove(&sid)
    }

    fn send_control(&self, sid: StreamId, opcode: u8) -> Result<(), SstError> {
        let body = control::encode(opcode, sid);
        let frame = codec::encode_frame(CONTROL_STREAM, &body)?;

        let mut inner = self.inner.lock().unwrap();
        if inner.subconns.is_empty() {
            return Err(SstError::NotConnected);
        }
        let idx = (sid as usize) % inner.subconns.len();
        let registry = inner.registry.try_clone().expect("registry clone");
        inner.subconns[idx].enqueue(&registry, frame);
        Ok(())
    }

    pub(crate) fn begin_stream_close(&self, sid: StreamId) {
        if self.send_control(sid, control::CLOSE_STREAM).is_err() {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        inner.pending_close.insert(sid, Instant::now() + self.config.close_ack_timeout);
    }

    /// Applies the chosen sub-connection policy and hands the encoded frame
    /// to that sub-connection's outbound queue. `unreliable` requests past
    /// `high_water_mark` on their chosen sub-connection are dropped
    /// silently.
    pub fn send_bytes(&self, req: RawRequest) -> Result<(), SstError> {
        if !req.unordered && req.unreliable {
            return Err(SstError::IllegalReliability);
        }
        let frame = codec::encode_frame(req.origin_stream, &req.payload)?;

        if self.state() != SocketState::Connected {
            return Err(SstError::NotConnected);
        }

        let mut inner = self.inner.lock().unwrap();
        let width = inner.subconns.len();
        if width == 0 {
            return Err(SstError::NotConnected);
        }

        let idx = if req.unordered {
            let i = inner.rr_counter % width;
            inner.rr_counter = inner.rr_counter.wrapping_add(1);
            i
        } else {
            (req.origin_stream as usize) % width
        };

        if req.unreliable && inner.subconns[idx].queue_depth() >= self.config.high_water_mark {
            return Ok(());
        }

        let registry = inner.registry.try_clone().expect("registry clone");
        if inner.subconns[idx].enqueue(&registry, frame) == ConnState::Disconnected {
            let notify = self.begin_drain(&mut inner);
            drop(inner);
            for cbs in notify {
                cbs.fire_disconnected();
            }
        }
        Ok(())
    }

    /// Application-initiated shutdown: moves straight to `Draining` and
    /// notifies every live stream exactly once.
    pub fn shutdown(&self) {
        if self.state() != SocketState::Connected {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        let notify = self.begin_drain(&mut inner);
        drop(inner);
        for cbs in notify {
            cbs.fire_disconnected();
        }
    }

    fn begin_drain(&self, inner: &mut Inner) -> Vec<Arc<CallbackSet>> {
        if self.state() == SocketState::Disconnected {
            return Vec::new();
        }
        self.state.store(SocketState::Draining as u8, Ordering::Release);

        for sc in &mut inner.subconns {
            sc.begin_close(&inner.registry);
        }
        let notify: Vec<_> = inner.streams.drain().map(|(_, cbs)| cbs).collect();
        inner.pending_accept.clear();
        inner.pending_close.clear();

        self.state.store(SocketState::Disconnected as u8, Ordering::Release);
        notify
    }

    /// Drives one non-blocking tick of I/O: reads, reassembles frames,
    /// dispatches control frames and `on_bytes_received`/`on_disconnected`
    /// to user code. User callbacks are always invoked after the
    /// stream-table lock has been released.
    pub fn poll(&self) {
        let Some(me) = self.self_ref.upgrade() else { return };
        if self.state() != SocketState::Connected {
            return;
        }

        let mut actions: Vec<PendingAction> = Vec::new();
        let mut failed = false;

        {
            let mut inner = self.inner.lock().unwrap();
            let Inner { poll, events, subconns, streams, registry, pending_close, pending_accept, .. } =
                &mut *inner;

            if let Err(err) = poll.poll(events, Some(Duration::ZERO)) {
                warn!(?err, "sst: mio poll failed");
                return;
            }

            let mut protocol_violation = false;

            for ev in events.iter() {
                let idx = ev.token().0;
                if idx >= subconns.len() {
                    continue;
                }

                let mut frame_actions: Vec<PendingAction> = Vec::new();
                let mut ack_replies: Vec<StreamId> = Vec::new();

                let conn_state = {
                    let sc = &mut subconns[idx];
                    sc.poll_with(registry, ev, &mut |sid, body| {
                        if sid == CONTROL_STREAM {
                            match control::decode(body) {
                                Ok(ControlFrame::NewStream(new_sid)) => {
                                    // Registered synchronously, before the
                                    // lock is released, so a data frame for
                                    // `new_sid` arriving on this same
                                    // sub-connection later in this very tick
                                    // is buffered rather than dropped while
                                    // `substream_accept` hasn't run yet.
                                    pending_accept.entry(new_sid).or_default();
                                    frame_actions.push(PendingAction::NewStream(new_sid));
                                }
                                Ok(ControlFrame::CloseStream(closed_sid)) => {
                                    if let Some(cbs) = streams.remove(&closed_sid) {
                                        frame_actions.push(PendingAction::Disconnected(cbs));
                                    }
                                    pending_accept.remove(&closed_sid);
                                    // Unknown sid: silent no-op, tolerating a
                                    // late frame after local retirement.
                                    ack_replies.push(closed_sid);
                                }
                                Ok(ControlFrame::AckClose(acked_sid)) => {
                                    pending_close.remove(&acked_sid);
                                }
                                Err(_) => protocol_violation = true,
                            }
                        } else if let Some(cbs) = streams.get(&sid) {
                            frame_actions.push(PendingAction::Bytes(Arc::clone(cbs), body.to_vec()));
                        } else if let Some(buffered) = pending_accept.get_mut(&sid) {
                            buffered.push(body.to_vec());
                        }
                    })
                };

                for sid in ack_replies {
                    let body = control::encode(control::ACK_CLOSE, sid);
                    if let Ok(frame) = codec::encode_frame(CONTROL_STREAM, &body) {
                        subconns[idx].enqueue(registry, frame);
                    }
                }

                actions.extend(frame_actions);

                if conn_state == ConnState::Disconnected {
                    failed = true;
                }
            }

            let now = Instant::now();
            pending_close.retain(|_, deadline| *deadline > now);

            if protocol_violation || failed {
                let notify = self.begin_drain(&mut inner);
                drop(inner);
                for cbs in notify {
                    cbs.fire_disconnected();
                }
                for action in actions {
                    if let PendingAction::Bytes(cbs, body) = action {
                        cbs.fire_bytes_received(&body);
                    }
                }
                return;
            }
        }

        for action in actions {
            match action {
                PendingAction::Bytes(cbs, body) => cbs.fire_bytes_received(&body),
                PendingAction::Disconnected(cbs) => cbs.fire_disconnected(),
                PendingAction::NewStream(sid) => {
                    let stream = LogicalStream::new(Arc::clone(&me), sid);
                    (self.substream_accept.lock().unwrap())(stream);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acceptor_side() -> Arc<MultiplexedSocket> {
        MultiplexedSocket::from_accepted(Vec::new(), SstConfig::default()).unwrap()
    }

    /// Property 6: every `new_id()` result is unique and carries the
    /// side's fixed parity (even for the acceptor).
    #[test]
    fn new_id_is_unique_and_even_on_accept_side() {
        let socket = acceptor_side();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let id = socket.new_id().unwrap();
            assert_eq!(id % 2, 0, "acceptor-allocated id {id} should be even");
            assert!(seen.insert(id), "id {id} allocated twice");
        }
    }

    /// S6: a too-large payload fails at the `send_bytes` call site with
    /// nothing enqueued, regardless of connection state.
    #[test]
    fn send_bytes_rejects_oversized_payload() {
        let socket = acceptor_side();
        let req = RawRequest {
            origin_stream: 2,
            unordered: false,
            unreliable: false,
            payload: vec![0u8; codec::MAX_FRAME_BODY as usize],
        };
        assert_eq!(socket.send_bytes(req), Err(SstError::PayloadTooLarge));
    }

    /// `(ordered, unreliable)` is rejected at `send_bytes`, independent of
    /// encode or connection-state checks.
    #[test]
    fn send_bytes_rejects_ordered_unreliable() {
        let socket = acceptor_side();
        let req = RawRequest {
            origin_stream: 2,
            unordered: false,
            unreliable: true,
            payload: b"x".to_vec(),
        };
        assert_eq!(socket.send_bytes(req), Err(SstError::IllegalReliability));
    }

    /// A socket with zero sub-connections (as `from_accepted(vec![], _)`
    /// degenerately produces) can't carry a well-formed send.
    #[test]
    fn send_bytes_on_widthless_socket_is_not_connected() {
        let socket = acceptor_side();
        let req = RawRequest {
            origin_stream: 2,
            unordered: true,
            unreliable: false,
            payload: b"x".to_vec(),
        };
        assert_eq!(socket.send_bytes(req), Err(SstError::NotConnected));
    }
}
