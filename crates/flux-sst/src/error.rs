use thiserror::Error;

/// Errors surfaced at the public boundary of this crate.
///
/// I/O failures on a sub-connection are never turned into one of these for an
/// individual `send` — they are reported asynchronously via
/// [`crate::callbacks::CallbackSet::on_disconnected`] instead. These variants
/// are for calls that fail synchronously.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SstError {
    #[error("connection to peer failed")]
    ConnectionFailed,

    #[error("handshake with peer failed")]
    HandshakeFailed,

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    #[error("stream id space exhausted")]
    StreamIdExhausted,

    #[error("multiplexed socket is not connected")]
    NotConnected,

    #[error("payload too large to frame (>= 2^30 bytes including stream id)")]
    PayloadTooLarge,

    #[error("ordered + unreliable is not a valid reliability combination")]
    IllegalReliability,
}
