//! Transport Trait
//!
//! Platform-agnostic abstraction for the raw byte connection beneath the
//! packet protocol (Bluetooth, Wi-Fi, sockets). Implementations live in the
//! platform layers; the link layer only consumes this interface.

use std::rc::Rc;

use crate::error::LinkError;

/// Fallback chunk size when no transport is attached.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// A raw, possibly-transient byte connection.
///
/// Methods take `&self`: transports are shared `Rc` handles and mutate
/// through interior mutability, matching the single-threaded event model of
/// the link layer.
///
/// Write failures are not returned from [`write_data`](Transport::write_data);
/// a failing transport reports through the `transport_closed` event instead,
/// and the reliability layer decides what to do about it.
pub trait Transport {
    /// Returns true if the transport is currently connected.
    fn is_connected(&self) -> bool;

    /// The chunk size this transport prefers for bulk data.
    fn recommended_packet_size(&self) -> usize;

    /// Hands one serialized packet frame to the transport. Completion is
    /// signaled asynchronously through the `transport_sent` event.
    fn write_data(&self, data: &[u8]);

    /// Requests the transport to close. Safe to call when not connected.
    fn close(&self);
}

/// Event sink for transport callbacks.
///
/// The owning event loop delivers transport events through this interface,
/// always passing the originating transport so events from a replaced
/// transport can be recognized and dropped. Events must be delivered from
/// the connection's own execution context, never re-entrantly from inside
/// [`Transport::write_data`].
pub trait TransportEvents {
    /// The transport finished connecting.
    fn transport_connected(&self, source: &Rc<dyn Transport>);

    /// The transport closed, carrying the underlying error if there was one.
    fn transport_closed(&self, source: &Rc<dyn Transport>, error: Option<LinkError>);

    /// One complete packet frame arrived.
    fn transport_received(&self, source: &Rc<dyn Transport>, frame: &[u8]);

    /// The previously written frame has been fully handed off.
    fn transport_sent(&self, source: &Rc<dyn Transport>);
}

/// Identity comparison for shared transport handles.
pub(crate) fn same_transport(a: Option<&Rc<dyn Transport>>, b: Option<&Rc<dyn Transport>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Rc::as_ptr(a) as *const () == Rc::as_ptr(b) as *const (),
        _ => false,
    }
}
