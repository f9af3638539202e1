use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Instant;

use crate::client::ClientInner;
use crate::key::ConnectionKey;
use crate::protocol::ProtocolHandle;

/// Receives the holder of a dying connection for recycling. A callback
/// that drops its argument closes the native handle.
pub type ConnectionDyingCallback = Box<dyn FnOnce(ConnectionHolder) + Send + 'static>;

/// Exclusive owner of one native protocol handle.
///
/// Exactly one entity owns a holder at any time: a [`Connection`], an
/// operation that took ownership of one, or a recycle callback. Dropping
/// the holder closes the native handle and releases the client's
/// active-connection slot.
///
/// [`Connection`]: crate::connection::Connection
pub struct ConnectionHolder {
    pub(crate) handle: Box<dyn ProtocolHandle>,
    key: ConnectionKey,
    // The key the connection was opened with; a later change-user rewrites
    // `key` but accounting stays against the original endpoint.
    opened_key: ConnectionKey,
    client: Arc<ClientInner>,
    reusable: bool,
    needs_reset_before_reuse: bool,
    opened_at: Instant,
}

impl ConnectionHolder {
    /// Takes over the active-connection slot reserved by the connect
    /// operation; the slot is released when the holder drops.
    pub(crate) fn new(
        client: Arc<ClientInner>,
        key: ConnectionKey,
        handle: Box<dyn ProtocolHandle>,
    ) -> Self {
        Self {
            handle,
            opened_key: key.clone(),
            key,
            client,
            reusable: true,
            needs_reset_before_reuse: false,
            opened_at: Instant::now(),
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub(crate) fn set_key(&mut self, key: ConnectionKey) {
        self.key = key;
    }

    /// Whether the server session is in a state suitable for reuse.
    pub fn is_reusable(&self) -> bool {
        self.reusable
    }

    pub(crate) fn set_reusable(&mut self, reusable: bool) {
        self.reusable = reusable;
    }

    /// Deferred hygiene marker: the pool must issue a reset before handing
    /// this session out again.
    pub fn needs_reset_before_reuse(&self) -> bool {
        self.needs_reset_before_reuse
    }

    pub(crate) fn set_needs_reset_before_reuse(&mut self) {
        self.needs_reset_before_reuse = true;
    }

    pub(crate) fn clear_needs_reset(&mut self) {
        self.needs_reset_before_reuse = false;
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.handle.in_transaction()
    }
}

impl Debug for ConnectionHolder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHolder")
            .field("key", &self.key)
            .field("reusable", &self.reusable)
            .field("needs_reset_before_reuse", &self.needs_reset_before_reuse)
            .finish()
    }
}

impl Drop for ConnectionHolder {
    fn drop(&mut self) {
        // The native handle closes when the box drops; the client hears
        // about it first so shutdown can account for the close.
        self.client.connection_closed(&self.opened_key);
    }
}
