//! User-facing callback plumbing for one logical stream.
//!
//! A [`CallbackSet`] is looked up under the stream table's lock, then the
//! `Arc` is cloned and the lock dropped before any closure runs — user code
//! invoked from `on_bytes_received` is free to call back into the owning
//! [`crate::multiplex::MultiplexedSocket`] (e.g. `close()`) without
//! deadlocking on that lock.

use std::sync::Mutex;

type ConnectedFn = Box<dyn FnMut(bool) + Send>;
type BytesFn = Box<dyn FnMut(&[u8]) + Send>;
type DisconnectedFn = Box<dyn FnMut() + Send>;

/// The three callbacks a [`crate::stream::LogicalStream`] delivers to.
///
/// A stream with no `CallbackSet` installed (or one whose entry was removed)
/// is closed for delivery: incoming frames addressed to it are dropped.
pub struct CallbackSet {
    on_connected: Mutex<Option<ConnectedFn>>,
    on_bytes_received: Mutex<BytesFn>,
    on_disconnected: Mutex<Option<DisconnectedFn>>,
}

impl CallbackSet {
    pub fn new(
        on_connected: impl FnMut(bool) + Send + 'static,
        on_bytes_received: impl FnMut(&[u8]) + Send + 'static,
        on_disconnected: impl FnMut() + Send + 'static,
    ) -> Self {
        Self {
            on_connected: Mutex::new(Some(Box::new(on_connected))),
            on_bytes_received: Mutex::new(Box::new(on_bytes_received)),
            on_disconnected: Mutex::new(Some(Box::new(on_disconnected))),
        }
    }

    /// Fires `on_connected` once, synchronously, when
    /// [`crate::multiplex::MultiplexedSocket::add_callbacks`] installs this
    /// set — a `MultiplexedSocket` is only ever observed already `Connected`.
    pub(crate) fn fire_connected(&self, ok: bool) {
        if let Some(cb) = self.on_connected.lock().unwrap().as_mut() {
            cb(ok);
        }
    }

    pub(crate) fn fire_bytes_received(&self, body: &[u8]) {
        (self.on_bytes_received.lock().unwrap())(body);
    }

    /// Fires `on_disconnected` exactly once over the stream's lifetime: the
    /// closure is taken out on first delivery, so races between the
    /// reactor's `Draining` teardown and a local `close()` can't double-fire
    /// it.
    pub(crate) fn fire_disconnected(&self) {
        if let Some(mut cb) = self.on_disconnected.lock().unwrap().take() {
            cb();
        }
    }
}
