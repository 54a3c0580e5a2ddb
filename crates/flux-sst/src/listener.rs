//! Accept side of session establishment: binds one TCP listener, sniffs each
//! inbound sub-connection's handshake preamble, and groups follow-on
//! sub-connections by the nonce their hello connection announced until the
//! full `width` has arrived.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use mio::{Events, Interest, Poll, Registry, Token};
use tracing::warn;

use crate::config::SstConfig;
use crate::error::SstError;
use crate::handshake::{self, HandshakeStatus, InboundHandshake, InboundOutcome};
use crate::multiplex::MultiplexedSocket;

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Sub-connections observed so far for one not-yet-complete session, keyed
/// by the nonce the initiator's hello announced.
///
/// `width` starts at `usize::MAX` if a nonce-only (follow-on) connection
/// arrives before its session's hello — an out-of-order arrival the active
/// side's sequential `connect()` never produces, but which this listener
/// tolerates rather than rejects.
struct PendingSession {
    width: usize,
    raw_streams: Vec<mio::net::TcpStream>,
}

/// Accepts inbound TCPSST sessions. Drives its own `mio::Poll`; call
/// [`Listener::poll`] from the application's event loop the same way
/// [`MultiplexedSocket::poll`] is driven.
pub struct Listener {
    poll: Poll,
    registry: Registry,
    listener: mio::net::TcpListener,
    next_token: usize,
    inbound_handshakes: HashMap<Token, InboundHandshake>,
    pending_sessions: HashMap<u64, PendingSession>,
    config: SstConfig,
    on_accept: Box<dyn FnMut(Arc<MultiplexedSocket>) + Send>,
    events: Events,
}

impl Listener {
    pub fn bind(
        addr: SocketAddr,
        config: SstConfig,
        on_accept: impl FnMut(Arc<MultiplexedSocket>) + Send + 'static,
    ) -> Result<Self, SstError> {
        let poll = Poll::new().map_err(|_| SstError::ConnectionFailed)?;
        let registry = poll.registry().try_clone().map_err(|_| SstError::ConnectionFailed)?;

        let mut listener =
            mio::net::TcpListener::bind(addr).map_err(|_| SstError::ConnectionFailed)?;
        registry
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(|_| SstError::ConnectionFailed)?;

        Ok(Self {
            poll,
            registry,
            listener,
            next_token: 0,
            inbound_handshakes: HashMap::new(),
            pending_sessions: HashMap::new(),
            config,
            on_accept: Box::new(on_accept),
            events: Events::with_capacity(128),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Drives one non-blocking tick: accepts new raw connections, advances
    /// every handshake in flight, and completes sessions whose sub-connection
    /// count reaches the negotiated width.
    pub fn poll(&mut self) {
        if let Err(err) = self.poll.poll(&mut self.events, Some(std::time::Duration::ZERO)) {
            warn!(?err, "sst: listener poll failed");
            return;
        }

        let hits: Vec<(Token, bool, bool)> =
            self.events.iter().map(|ev| (ev.token(), ev.is_readable(), ev.is_writable())).collect();

        for (token, readable, writable) in hits {
            if token == LISTENER_TOKEN {
                self.accept_new();
            } else {
                self.drive_handshake(token, readable, writable);
            }
        }
    }

    fn accept_new(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    let mut hs = InboundHandshake::new(stream, token);
                    if hs.register(&self.registry).is_err() {
                        continue;
                    }
                    self.inbound_handshakes.insert(token, hs);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(?err, "sst: accept failed");
                    break;
                }
            }
        }
    }

    fn drive_handshake(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(hs) = self.inbound_handshakes.get_mut(&token) else { return };

        if hs.poll_with(readable, writable) == HandshakeStatus::Failed {
            let mut hs = self.inbound_handshakes.remove(&token).expect("just looked up");
            let _ = hs.deregister(&self.registry);
            return;
        }

        if !hs.reply_queued() {
            if let Some(outcome) = hs.outcome() {
                let reply = match outcome {
                    InboundOutcome::Hello { width, .. } => handshake::encode_hello_reply(width),
                    InboundOutcome::Nonce(_) => handshake::encode_ack(),
                };
                hs.queue_reply(reply);
                if hs.flush_reply() == HandshakeStatus::Failed {
                    let mut hs = self.inbound_handshakes.remove(&token).expect("just looked up");
                    let _ = hs.deregister(&self.registry);
                    return;
                }
            }
        }

        let Some(hs) = self.inbound_handshakes.get(&token) else { return };
        if !hs.is_done() {
            return;
        }

        let mut hs = self.inbound_handshakes.remove(&token).expect("just checked is_done");
        let _ = hs.deregister(&self.registry);
        let outcome = hs.outcome();
        let stream = hs.into_stream();

        if let Some(outcome) = outcome {
            self.complete_handshake(stream, outcome);
        }
    }

    fn complete_handshake(&mut self, stream: mio::net::TcpStream, outcome: InboundOutcome) {
        let (nonce, hello_width) = match outcome {
            InboundOutcome::Hello { width, nonce } => (nonce, Some(width as usize)),
            InboundOutcome::Nonce(nonce) => (nonce, None),
        };

        let session = self
            .pending_sessions
            .entry(nonce)
            .or_insert_with(|| PendingSession { width: usize::MAX, raw_streams: Vec::new() });

        if let Some(width) = hello_width {
            session.width = width;
        }
        session.raw_streams.push(stream);

        if session.raw_streams.len() < session.width {
            return;
        }

        let session = self.pending_sessions.remove(&nonce).expect("just matched");
        match MultiplexedSocket::from_accepted(session.raw_streams, self.config.clone()) {
            Ok(socket) => (self.on_accept)(socket),
            Err(err) => warn!(?err, "sst: failed to complete accepted session"),
        }
    }
}
