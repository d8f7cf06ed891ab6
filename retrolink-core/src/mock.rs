// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Mock Transport
//!
//! Mock implementation of the Transport trait for testing.
//!
//! Records every written frame and lets tests flip the connection state;
//! tests drive completions by delivering `transport_sent` events themselves,
//! mirroring how a real event loop feeds the packet connection.

use std::cell::{Cell, RefCell};

use crate::transport::{Transport, DEFAULT_PACKET_SIZE};

/// Mock transport for testing.
///
/// # Example
///
/// ```ignore
/// use retrolink_core::{MockTransport, Transport};
///
/// let transport = MockTransport::new();
/// transport.set_connected(true);
/// transport.write_data(&[1, 2, 3]);
/// assert_eq!(transport.written_frames().len(), 1);
/// ```
#[derive(Debug)]
pub struct MockTransport {
    connected: Cell<bool>,
    recommended_packet_size: Cell<usize>,
    /// Frames handed to the transport, in write order.
    written: RefCell<Vec<Vec<u8>>>,
    close_calls: Cell<usize>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Creates a new mock transport, initially disconnected.
    pub fn new() -> Self {
        MockTransport {
            connected: Cell::new(false),
            recommended_packet_size: Cell::new(DEFAULT_PACKET_SIZE),
            written: RefCell::new(Vec::new()),
            close_calls: Cell::new(0),
        }
    }

    /// Flips the connection state without emitting any event.
    pub fn set_connected(&self, connected: bool) {
        self.connected.set(connected);
    }

    /// Overrides the recommended packet size (for chunking tests).
    pub fn set_recommended_packet_size(&self, size: usize) {
        self.recommended_packet_size.set(size);
    }

    /// Returns all frames written so far, in order.
    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        self.written.borrow().clone()
    }

    /// Returns the number of frames written so far.
    pub fn written_count(&self) -> usize {
        self.written.borrow().len()
    }

    /// Clears the recorded frames.
    pub fn clear_written(&self) {
        self.written.borrow_mut().clear();
    }

    /// Returns how many times `close()` was requested.
    pub fn close_calls(&self) -> usize {
        self.close_calls.get()
    }
}

impl Transport for MockTransport {
    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    fn recommended_packet_size(&self) -> usize {
        self.recommended_packet_size.get()
    }

    fn write_data(&self, data: &[u8]) {
        self.written.borrow_mut().push(data.to_vec());
    }

    fn close(&self) {
        self.close_calls.set(self.close_calls.get() + 1);
        self.connected.set(false);
    }
}
