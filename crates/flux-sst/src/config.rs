use std::time::Duration;

/// Tunables for a [`crate::multiplex::MultiplexedSocket`] or
/// [`crate::listener::Listener`], set with the `with_*` builder methods.
#[derive(Clone, Copy, Debug)]
pub struct SstConfig {
    pub(crate) width: usize,
    pub(crate) high_water_mark: usize,
    pub(crate) handshake_timeout: Duration,
    pub(crate) close_ack_timeout: Duration,
    pub(crate) socket_buf_size: Option<usize>,
}

impl Default for SstConfig {
    /// Width 3, high-water mark 256 queued frames per sub-connection, 5s
    /// handshake and close-ack timeouts, kernel-default socket buffer sizes.
    fn default() -> Self {
        Self {
            width: 3,
            high_water_mark: 256,
            handshake_timeout: Duration::from_secs(5),
            close_ack_timeout: Duration::from_secs(5),
            socket_buf_size: None,
        }
    }
}

impl SstConfig {
    /// Number of parallel TCP sub-connections to open. Clamped to at least 1.
    pub fn with_width(mut self, width: usize) -> Self {
        self.width = width.max(1);
        self
    }

    /// Per-sub-connection queue depth past which `unreliable` sends are
    /// dropped rather than enqueued.
    pub fn with_high_water_mark(mut self, high_water_mark: usize) -> Self {
        self.high_water_mark = high_water_mark;
        self
    }

    /// Upper bound on how long `connect`/accept handshakes may take before
    /// the socket gives up and moves to `Disconnected`.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Upper bound on how long a locally-initiated stream close waits for
    /// the peer's `ACK_CLOSE` before retiring the stream unconditionally.
    pub fn with_close_ack_timeout(mut self, timeout: Duration) -> Self {
        self.close_ack_timeout = timeout;
        self
    }

    /// `SO_SNDBUF`/`SO_RCVBUF` applied to every sub-connection socket.
    /// Unset by default, leaving the kernel's default sizes in place.
    pub fn with_socket_buf_size(mut self, size: usize) -> Self {
        self.socket_buf_size = Some(size);
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }
}
