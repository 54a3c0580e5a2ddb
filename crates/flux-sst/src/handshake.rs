//! Raw, non-blocking connect/accept handshake exchanged on each sub-connection
//! before it is promoted to a framed [`crate::subconn::SubConnection`].
//!
//! The handshake never goes through the length-prefixed frame codec — it is
//! a small fixed-size preamble, driven through the same readable/writable
//! event loop as everything else so no blocking I/O ever happens on the
//! reactor thread.

use std::io::{self, Read, Write};

use mio::{Interest, Registry, Token, event::Event};

pub(crate) const MAGIC: &[u8; 3] = b"SST";
pub(crate) const PROTOCOL_VERSION: u8 = 1;
pub(crate) const ACK_BYTE: u8 = 0x01;

/// `magic || version || width || nonce`, sent once by the initiator on the
/// first sub-connection of a session.
pub(crate) fn encode_hello(width: u8, nonce: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(13);
    buf.extend_from_slice(MAGIC);
    buf.push(PROTOCOL_VERSION);
    buf.push(width);
    buf.extend_from_slice(&nonce.to_le_bytes());
    buf
}

/// `version || width`, the acceptor's reply confirming the negotiated width.
pub(crate) fn encode_hello_reply(width: u8) -> Vec<u8> {
    vec![PROTOCOL_VERSION, width]
}

/// `nonce`, sent by the initiator on every sub-connection after the first to
/// associate it with an already-announced session.
pub(crate) fn encode_nonce(nonce: u64) -> Vec<u8> {
    nonce.to_le_bytes().to_vec()
}

pub(crate) fn encode_ack() -> Vec<u8> {
    vec![ACK_BYTE]
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum HandshakeStatus {
    Pending,
    Done,
    Failed,
}

/// One side of a handshake in flight: write `out` fully, then read exactly
/// `want_in` bytes.
pub(crate) struct HandshakeConn {
    stream: mio::net::TcpStream,
    token: Token,
    out: Vec<u8>,
    out_off: usize,
    in_buf: Vec<u8>,
}

impl HandshakeConn {
    pub(crate) fn new(stream: mio::net::TcpStream, token: Token, out: Vec<u8>, want_in: usize) -> Self {
        Self { stream, token, out, out_off: 0, in_buf: Vec::with_capacity(want_in) }
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn received(&self) -> &[u8] {
        &self.in_buf
    }

    pub(crate) fn into_stream(self) -> mio::net::TcpStream {
        self.stream
    }

    /// Drives one readable/writable tick. Returns `Done` once `out` is fully
    /// written and `in_buf` has reached its target length.
    pub(crate) fn poll_with(&mut self, registry: &Registry, ev: &Event) -> HandshakeStatus {
        if ev.is_writable() && self.out_off < self.out.len() {
            loop {
                match self.stream.write(&self.out[self.out_off..]) {
                    Ok(0) => return HandshakeStatus::Failed,
                    Ok(n) => {
                        self.out_off += n;
                        if self.out_off == self.out.len() {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => return HandshakeStatus::Failed,
                }
            }
        }

        if ev.is_readable() {
            let target = self.in_buf.capacity();
            let mut chunk = [0u8; 32];
            while self.in_buf.len() < target {
                let want = (target - self.in_buf.len()).min(chunk.len());
                match self.stream.read(&mut chunk[..want]) {
                    Ok(0) => return HandshakeStatus::Failed,
                    Ok(n) => self.in_buf.extend_from_slice(&chunk[..n]),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => return HandshakeStatus::Failed,
                }
            }
        }

        if self.out_off == self.out.len() && self.in_buf.len() == self.in_buf.capacity() {
            HandshakeStatus::Done
        } else {
            HandshakeStatus::Pending
        }
    }

    pub(crate) fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.stream, self.token, Interest::READABLE | Interest::WRITABLE)
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }
}

pub(crate) const HELLO_LEN: usize = 13; // magic(3) + version(1) + width(1) + nonce(8)
pub(crate) const NONCE_LEN: usize = 8;

#[derive(Debug, Clone, Copy)]
pub(crate) enum InboundOutcome {
    Hello { width: u8, nonce: u64 },
    Nonce(u64),
}

/// Accept-side handshake reader that doesn't know in advance whether the
/// connection is the session-opening one (13-byte hello) or a follow-on
/// sub-connection (8-byte nonce) — it sniffs the first three bytes against
/// [`MAGIC`] to decide, then reads the rest of whichever preamble applies.
pub(crate) struct InboundHandshake {
    stream: mio::net::TcpStream,
    token: Token,
    in_buf: [u8; HELLO_LEN],
    have: usize,
    target: Option<usize>,
    out: Vec<u8>,
    out_off: usize,
}

impl InboundHandshake {
    pub(crate) fn new(stream: mio::net::TcpStream, token: Token) -> Self {
        Self { stream, token, in_buf: [0; HELLO_LEN], have: 0, target: None, out: Vec::new(), out_off: 0 }
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.stream, self.token, Interest::READABLE | Interest::WRITABLE)
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    pub(crate) fn into_stream(self) -> mio::net::TcpStream {
        self.stream
    }

    pub(crate) fn reply_queued(&self) -> bool {
        !self.out.is_empty()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.target.is_some_and(|t| self.have >= t) && self.reply_queued() && self.out_off == self.out.len()
    }

    /// Parses the sniffed preamble once enough bytes have arrived.
    pub(crate) fn outcome(&self) -> Option<InboundOutcome> {
        let target = self.target?;
        if self.have < target {
            return None;
        }
        if target == HELLO_LEN {
            if &self.in_buf[..3] != MAGIC || self.in_buf[3] != PROTOCOL_VERSION {
                return None;
            }
            let width = self.in_buf[4];
            let nonce = u64::from_le_bytes(self.in_buf[5..13].try_into().ok()?);
            Some(InboundOutcome::Hello { width, nonce })
        } else {
            let nonce = u64::from_le_bytes(self.in_buf[..8].try_into().ok()?);
            Some(InboundOutcome::Nonce(nonce))
        }
    }

    pub(crate) fn queue_reply(&mut self, reply: Vec<u8>) {
        self.out = reply;
        self.out_off = 0;
    }

    /// Reads whatever is available, sniffing the preamble length at byte 3.
    pub(crate) fn poll_with(&mut self, readable: bool, writable: bool) -> HandshakeStatus {
        if readable {
            loop {
                if let Some(target) = self.target {
                    if self.have >= target {
                        break;
                    }
                } else if self.have >= 3 {
                    self.target =
                        Some(if &self.in_buf[..3] == MAGIC { HELLO_LEN } else { NONCE_LEN });
                    continue;
                }

                match self.stream.read(&mut self.in_buf[self.have..self.have + 1]) {
                    Ok(0) => return HandshakeStatus::Failed,
                    Ok(_) => self.have += 1,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(_) => return HandshakeStatus::Failed,
                }
            }
        }

        if writable && self.reply_queued() {
            match self.flush_reply() {
                HandshakeStatus::Failed => return HandshakeStatus::Failed,
                HandshakeStatus::Done | HandshakeStatus::Pending => {}
            }
        }

        if self.is_done() { HandshakeStatus::Done } else { HandshakeStatus::Pending }
    }

    /// Attempts to write out a queued reply right away, without waiting for
    /// the next writable event.
    pub(crate) fn flush_reply(&mut self) -> HandshakeStatus {
        while self.out_off < self.out.len() {
            match self.stream.write(&self.out[self.out_off..]) {
                Ok(0) => return HandshakeStatus::Failed,
                Ok(n) => self.out_off += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return HandshakeStatus::Pending,
                Err(_) => return HandshakeStatus::Failed,
            }
        }
        HandshakeStatus::Done
    }
}
