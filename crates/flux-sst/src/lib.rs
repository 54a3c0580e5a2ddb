//! TCPSST: a framing layer carrying N independently addressable logical
//! byte streams over a small fixed pool of TCP connections between two
//! peers.
//!
//! A [`MultiplexedSocket`] is one peer's side of a session; each
//! [`LogicalStream`] it hands out (via [`MultiplexedSocket::open_stream`] or
//! a [`Listener`]'s accept callback) is an independently flow-controlled
//! byte pipe multiplexed over the underlying sub-connections. [`Listener`]
//! accepts sessions from the passive side.

mod callbacks;
mod codec;
mod config;
mod control;
mod error;
mod handshake;
mod listener;
mod multiplex;
mod stream;
mod subconn;

pub use callbacks::CallbackSet;
pub use codec::{CONTROL_STREAM, StreamId};
pub use config::SstConfig;
pub use error::SstError;
pub use listener::Listener;
pub use multiplex::{MultiplexedSocket, RawRequest, SocketState};
pub use stream::{LogicalStream, Reliability};
