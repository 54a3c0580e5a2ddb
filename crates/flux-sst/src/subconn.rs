//! Per-sub-connection non-blocking send queue and receive reassembly.
//!
//! One [`SubConnection`] wraps a single TCP socket inside a
//! [`crate::multiplex::MultiplexedSocket`]'s fixed pool. Writes are
//! single-writer by construction: only the reactor's poll loop ever touches
//! a given `SubConnection`, so `enqueue` from a user thread just appends to
//! the backlog and the next writable tick drains it.

use std::{collections::VecDeque, io, io::Read, io::Write};

use mio::{Interest, Registry, Token, event::Event};
use tracing::{debug, warn};

use crate::codec::{self, MAX_LEN_BYTES, StreamId, VarintScan};

/// Response type for sub-connection operations.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnState {
    Alive,
    Disconnected,
}

enum RxState {
    /// Waiting for the length prefix.
    ReadingLen { buf: [u8; MAX_LEN_BYTES], have: usize },
    /// Reading `total` bytes of `sid || body`.
    ReadingBody { total: usize, offset: usize },
}

enum ReadOutcome {
    FrameReady { sid: StreamId, start: usize, end: usize },
    WouldBlock,
    Disconnected,
    Violation(&'static str),
}

/// Non-blocking wrapper around one TCP socket in a multiplex pool.
///
/// Outbound: `enqueue` appends an already-encoded frame to the backlog;
/// `poll_with` flushes it on writable events, one outstanding `write` per
/// tick, FIFO order, byte-exact (no interleaving with another frame).
///
/// Inbound: `poll_with` reads available bytes, reassembles complete frames
/// per the length/stream-id prefix, and invokes the caller's callback with
/// `(sid, body)` for each one assembled. Reassembly never crosses
/// sub-connections.
pub struct SubConnection {
    stream: mio::net::TcpStream,
    token: Token,
    rx_state: RxState,
    rx_buf: Vec<u8>,
    send_backlog: VecDeque<Vec<u8>>,
    /// Byte offset already written out of the backlog's front entry.
    front_offset: usize,
    writable_armed: bool,
    closing: bool,
}

const INITIAL_RX_BUF: usize = 4096;

impl SubConnection {
    /// Wraps `stream` and registers it for readable events under `token`.
    pub(crate) fn new(
        mut stream: mio::net::TcpStream,
        registry: &Registry,
        token: Token,
        socket_buf_size: Option<usize>,
    ) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        if let Some(size) = socket_buf_size {
            set_socket_buf_size(&stream, size);
        }
        registry.register(&mut stream, token, Interest::READABLE)?;
        Ok(Self {
            stream,
            token,
            rx_state: RxState::ReadingLen { buf: [0; MAX_LEN_BYTES], have: 0 },
            rx_buf: vec![0; INITIAL_RX_BUF],
            send_backlog: VecDeque::with_capacity(16),
            front_offset: 0,
            writable_armed: false,
            closing: false,
        })
    }

    /// Drives one sub-connection's readable/writable events.
    ///
    /// `on_frame` is invoked once per fully assembled `(sid, body)` pair.
    /// `body` borrows `self`'s reassembly buffer and is only valid for the
    /// duration of the call.
    #[inline]
    pub(crate) fn poll_with<F>(
        &mut self,
        registry: &Registry,
        ev: &Event,
        on_frame: &mut F,
    ) -> ConnState
    where
        F: FnMut(StreamId, &[u8]),
    {
        if ev.is_readable() {
            loop {
                match self.read_frame() {
                    ReadOutcome::FrameReady { sid, start, end } => {
                        on_frame(sid, &self.rx_buf[start..end]);
                    }
                    ReadOutcome::WouldBlock => break,
                    ReadOutcome::Disconnected => return ConnState::Disconnected,
                    ReadOutcome::Violation(why) => {
                        warn!(why, "sst: protocol violation on receive");
                        return ConnState::Disconnected;
                    }
                }
            }
        }

        if ev.is_writable() && self.drain_backlog(registry) == ConnState::Disconnected {
            return ConnState::Disconnected;
        }

        ConnState::Alive
    }

    /// Appends an already-framed buffer to the outbound backlog and arms
    /// `WRITABLE` interest if it wasn't already.
    #[inline]
    pub(crate) fn enqueue(&mut self, registry: &Registry, frame: Vec<u8>) -> ConnState {
        if self.closing {
            return ConnState::Alive;
        }
        self.send_backlog.push_back(frame);
        self.arm_writable(registry)
    }

    /// Number of frames currently queued for write, used for the
    /// high-water-mark backpressure check on `unreliable` sends.
    #[inline]
    pub(crate) fn queue_depth(&self) -> usize {
        self.send_backlog.len()
    }

    /// Marks this sub-connection for half-close once its backlog drains.
    pub(crate) fn begin_close(&mut self, registry: &Registry) -> ConnState {
        self.closing = true;
        if self.send_backlog.is_empty() {
            self.shutdown_write();
            return ConnState::Alive;
        }
        self.arm_writable(registry)
    }

    pub(crate) fn close(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn shutdown_write(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Write);
    }

    #[inline]
    fn drain_backlog(&mut self, registry: &Registry) -> ConnState {
        while let Some(front) = self.send_backlog.front() {
            match self.stream.write(&front[self.front_offset..]) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) if self.front_offset + n == front.len() => {
                    self.send_backlog.pop_front();
                    self.front_offset = 0;
                }
                Ok(n) => self.front_offset += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(?err, "sst: write from backlog");
                    return ConnState::Disconnected;
                }
            }
        }

        if self.send_backlog.is_empty() {
            if self.writable_armed {
                if let Err(err) =
                    registry.reregister(&mut self.stream, self.token, Interest::READABLE)
                {
                    debug!(?err, "sst: reregister drop writable");
                    return ConnState::Disconnected;
                }
                self.writable_armed = false;
            }
            if self.closing {
                self.shutdown_write();
            }
        }

        ConnState::Alive
    }

    /// Reads a single complete frame if one is present, looping until a
    /// frame is delivered or the socket would block.
    fn read_frame(&mut self) -> ReadOutcome {
        loop {
            match self.rx_state {
                RxState::ReadingLen { mut buf, mut have } => {
                    // One byte at a time: a `read` sized to the remaining
                    // prefix capacity could pull bytes belonging to the
                    // body (or the next frame entirely) out of the socket
                    // before we know the prefix has ended, and those bytes
                    // would have nowhere to go.
                    match self.stream.read(&mut buf[have..have + 1]) {
                        Ok(0) => return ReadOutcome::Disconnected,
                        Ok(n) => {
                            have += n;
                            match codec::scan_varint(&buf[..have], MAX_LEN_BYTES) {
                                VarintScan::Complete(total, _) => {
                                    let total = total as usize;
                                    if total > self.rx_buf.len() {
                                        self.rx_buf.resize(total, 0);
                                    }
                                    if total == 0 {
                                        self.rx_state = RxState::ReadingLen {
                                            buf: [0; MAX_LEN_BYTES],
                                            have: 0,
                                        };
                                        return ReadOutcome::Violation("empty frame");
                                    }
                                    self.rx_state = RxState::ReadingBody { total, offset: 0 };
                                }
                                VarintScan::Incomplete => {
                                    self.rx_state = RxState::ReadingLen { buf, have };
                                    return ReadOutcome::WouldBlock;
                                }
                                VarintScan::TooLong => return ReadOutcome::Violation("bad length"),
                            }
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.rx_state = RxState::ReadingLen { buf, have };
                            return ReadOutcome::WouldBlock;
                        }
                        Err(err) => {
                            debug!(?err, "sst: read length prefix");
                            return ReadOutcome::Disconnected;
                        }
                    }
                }

                RxState::ReadingBody { total, mut offset } => {
                    while offset < total {
                        match self.stream.read(&mut self.rx_buf[offset..total]) {
                            Ok(0) => return ReadOutcome::Disconnected,
                            Ok(n) => offset += n,
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::ReadingBody { total, offset };
                                return ReadOutcome::WouldBlock;
                            }
                            Err(err) => {
                                debug!(?err, "sst: read frame body");
                                return ReadOutcome::Disconnected;
                            }
                        }
                    }

                    let (sid, body) = match codec::split_sid_body(&self.rx_buf[..total]) {
                        Ok(pair) => pair,
                        Err(_) => return ReadOutcome::Violation("bad stream id"),
                    };
                    let body_len = body.len();
                    let start = total - body_len;

                    self.rx_state = RxState::ReadingLen { buf: [0; MAX_LEN_BYTES], have: 0 };
                    return ReadOutcome::FrameReady { sid, start, end: total };
                }
            }
        }
    }

    #[inline]
    fn arm_writable(&mut self, registry: &Registry) -> ConnState {
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(?err, "sst: poll reregister");
                return ConnState::Disconnected;
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }
}

/// Sets `SO_SNDBUF`/`SO_RCVBUF` on `stream`. Best-effort: the kernel may
/// clamp or ignore the requested size, and failures aren't surfaced since
/// the default kernel sizing is an acceptable fallback.
pub(crate) fn set_socket_buf_size(stream: &mio::net::TcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &size as *const _ as *const libc::c_void,
            core::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
