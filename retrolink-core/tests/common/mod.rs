// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common Test Utilities
//!
//! A deterministic harness around one packet connection and its mock
//! transport, plus recording delegates. Tests play the role of the owning
//! event loop: they deliver transport events by hand and observe what the
//! link layer writes.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::Rc;

use retrolink_core::{
    ConnectionDelegate, ConnectionHost, ControlPacket, LinkError, MockTransport, Packet,
    PacketConnection, PacketTag, PeerId, ReliabilityDelegate, Transfer, TransferDelegate,
    TransferDirection, Transport, TransportEvents,
};

/// One packet connection over a mock transport, with bookkeeping to deliver
/// `transport_sent` completions one frame at a time.
pub struct Link {
    pub transport: Rc<MockTransport>,
    pub connection: Rc<PacketConnection>,
    acked: Cell<usize>,
}

impl Link {
    /// A connected link to the given destination peers.
    pub fn new(peers: &[&str]) -> Self {
        let link = Self::disconnected(peers);
        link.transport.set_connected(true);
        link
    }

    /// A link whose transport has not connected yet.
    pub fn disconnected(peers: &[&str]) -> Self {
        let transport = Rc::new(MockTransport::new());
        let connection = Rc::new(PacketConnection::new(
            "conn-test".into(),
            destinations(peers),
            Some(transport.clone() as Rc<dyn Transport>),
        ));
        Link {
            transport,
            connection,
            acked: Cell::new(0),
        }
    }

    pub fn source(&self) -> Rc<dyn Transport> {
        self.transport.clone()
    }

    /// Marks the transport connected and delivers the connected event.
    pub fn connect(&self) {
        self.transport.set_connected(true);
        self.connection.transport_connected(&self.source());
    }

    /// Marks the transport dropped and delivers the closed event.
    pub fn close(&self, error: Option<LinkError>) {
        self.transport.set_connected(false);
        self.connection.transport_closed(&self.source(), error);
    }

    /// Delivers an inbound control packet as a received frame.
    pub fn deliver(&self, packet: &ControlPacket) {
        let frame = packet.encode().unwrap().encode();
        self.connection.transport_received(&self.source(), &frame);
    }

    /// Delivers a raw frame.
    pub fn deliver_frame(&self, frame: &[u8]) {
        self.connection.transport_received(&self.source(), frame);
    }

    /// Acknowledges a single written frame.
    pub fn ack_one(&self) {
        self.acked.set(self.acked.get() + 1);
        self.connection.transport_sent(&self.source());
    }

    /// Acknowledges written frames until the link goes idle, including
    /// frames written in response to earlier acknowledgements.
    pub fn drain(&self) {
        while self.acked.get() < self.transport.written_count() {
            self.ack_one();
        }
    }

    /// Replaces the transport with a fresh, already-connected mock.
    pub fn replace_transport(&mut self) {
        let transport = Rc::new(MockTransport::new());
        transport.set_connected(true);
        self.connection
            .swap_transport(Some(transport.clone() as Rc<dyn Transport>));
        self.transport = transport;
        self.acked.set(0);
    }

    /// All frames written so far, decoded as control packets.
    pub fn control_frames(&self) -> Vec<ControlPacket> {
        self.transport
            .written_frames()
            .iter()
            .map(|frame| ControlPacket::decode(&Packet::decode(frame).unwrap()).unwrap())
            .collect()
    }
}

pub fn destinations(peers: &[&str]) -> BTreeSet<PeerId> {
    peers.iter().map(|peer| peer.to_string()).collect()
}

/// Connection delegate that records every event and optionally claims tags.
#[derive(Default)]
pub struct RecordingConnectionDelegate {
    pub claimed_tags: Vec<PacketTag>,
    pub connected: Cell<usize>,
    pub closed: RefCell<Vec<Option<LinkError>>>,
    pub will_change: Cell<usize>,
    pub all_written: Cell<usize>,
    pub packets: RefCell<Vec<Packet>>,
}

impl RecordingConnectionDelegate {
    pub fn claiming(tags: &[PacketTag]) -> Rc<Self> {
        Rc::new(RecordingConnectionDelegate {
            claimed_tags: tags.to_vec(),
            ..Default::default()
        })
    }
}

impl ConnectionDelegate for RecordingConnectionDelegate {
    fn handled_tags(&self) -> Vec<PacketTag> {
        self.claimed_tags.clone()
    }

    fn handle_packet(&self, packet: Packet) {
        self.packets.borrow_mut().push(packet);
    }

    fn connection_connected(&self) {
        self.connected.set(self.connected.get() + 1);
    }

    fn connection_closed(&self, error: Option<LinkError>) {
        self.closed.borrow_mut().push(error);
    }

    fn transport_will_change(&self) {
        self.will_change.set(self.will_change.get() + 1);
    }

    fn all_packets_written(&self) {
        self.all_written.set(self.all_written.get() + 1);
    }
}

/// Records reliability lifecycle callbacks.
#[derive(Default)]
pub struct RecordingReliabilityDelegate {
    pub connected: Cell<usize>,
    pub closed_expectedly: Cell<usize>,
    pub closed_unexpectedly: RefCell<Vec<Option<LinkError>>>,
}

impl ReliabilityDelegate for RecordingReliabilityDelegate {
    fn connection_connected(&self, _connection: &Rc<PacketConnection>) {
        self.connected.set(self.connected.get() + 1);
    }

    fn connection_closed_expectedly(&self, _connection: &Rc<PacketConnection>) {
        self.closed_expectedly.set(self.closed_expectedly.get() + 1);
    }

    fn connection_closed_unexpectedly(
        &self,
        _connection: &Rc<PacketConnection>,
        error: Option<LinkError>,
    ) {
        self.closed_unexpectedly.borrow_mut().push(error);
    }
}

/// Records what the reliability manager asks of the owning application.
#[derive(Default)]
pub struct RecordingHost {
    pub establish_calls: Cell<usize>,
    pub close_notifications: Cell<usize>,
}

impl ConnectionHost for RecordingHost {
    fn establish_underlying_connection(&self, _connection: &Rc<PacketConnection>) {
        self.establish_calls.set(self.establish_calls.get() + 1);
    }

    fn notify_connection_close(&self, _connection: &Rc<PacketConnection>) {
        self.close_notifications.set(self.close_notifications.get() + 1);
    }
}

/// Records transfer lifecycle callbacks.
#[derive(Default)]
pub struct RecordingTransferDelegate {
    pub started: RefCell<Vec<(String, TransferDirection)>>,
    pub progress: RefCell<Vec<(String, u64)>>,
    pub completed: RefCell<Vec<String>>,
    pub cancelled: RefCell<Vec<String>>,
}

impl TransferDelegate for RecordingTransferDelegate {
    fn transfer_started(&self, transfer: &Rc<Transfer>) {
        self.started
            .borrow_mut()
            .push((transfer.id().to_string(), transfer.direction()));
    }

    fn transfer_progress(&self, transfer: &Rc<Transfer>) {
        self.progress
            .borrow_mut()
            .push((transfer.id().to_string(), transfer.progress()));
    }

    fn transfer_completed(&self, transfer: &Rc<Transfer>) {
        self.completed.borrow_mut().push(transfer.id().to_string());
    }

    fn transfer_cancelled(&self, transfer: &Rc<Transfer>) {
        self.cancelled.borrow_mut().push(transfer.id().to_string());
    }
}
