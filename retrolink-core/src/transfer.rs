// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Transfer Manager
//!
//! Resumable, chunked, queued data transfer over a packet connection.
//!
//! At most one outbound and one inbound transfer are active at a time;
//! further outbound transfers queue strictly FIFO. Chunk sends are driven by
//! the connection's "all packets written" signal, so the manager never
//! floods the transport. When the transport is about to be swapped the
//! manager freezes; after reconnecting, both sides exchange progress reports
//! and the sender resumes exactly where the receiver left off instead of
//! resending bytes.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::ops::Range;
use std::rc::{Rc, Weak};

use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::connection::{ConnectionDelegate, PacketConnection};
use crate::packet::{
    tags, ControlPacket, Packet, PacketTag, ProgressEntry, TransferCancelled, TransferData,
    TransferId, TransferProgress, TransferStarted,
};

/// Produces the bytes of an outbound transfer for an arbitrary sub-range.
///
/// Called once per chunk; after a reconnect the requested range restarts at
/// whatever offset the receiver reported, so suppliers must support random
/// access.
pub type DataSupplier = Box<dyn Fn(Range<u64>) -> Vec<u8>>;

/// Direction of a transfer, from the local point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Inbound,
    Outbound,
}

/// A single chunked transfer.
///
/// Progress counts bytes transmitted (outbound) or received (inbound); the
/// transfer is terminal once progress reaches length.
pub struct Transfer {
    id: TransferId,
    direction: TransferDirection,
    length: u64,
    progress: Cell<u64>,
    interrupted: Cell<bool>,
    cancelled: Cell<bool>,
    supplier: Option<DataSupplier>,
    received: RefCell<Vec<u8>>,
}

impl Transfer {
    fn outbound(length: u64, supplier: DataSupplier) -> Rc<Self> {
        Rc::new(Transfer {
            id: Uuid::new_v4().to_string(),
            direction: TransferDirection::Outbound,
            length,
            progress: Cell::new(0),
            interrupted: Cell::new(false),
            cancelled: Cell::new(false),
            supplier: Some(supplier),
            received: RefCell::new(Vec::new()),
        })
    }

    fn inbound(id: TransferId, length: u64) -> Rc<Self> {
        Rc::new(Transfer {
            id,
            direction: TransferDirection::Inbound,
            length,
            progress: Cell::new(0),
            interrupted: Cell::new(false),
            cancelled: Cell::new(false),
            supplier: None,
            received: RefCell::new(Vec::new()),
        })
    }

    /// The transfer's unique identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    /// Total length in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Bytes transferred so far.
    pub fn progress(&self) -> u64 {
        self.progress.get()
    }

    /// True while the transfer is frozen across a transport swap.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.get()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    pub fn is_complete(&self) -> bool {
        self.progress.get() == self.length
    }

    /// The bytes accumulated by an inbound transfer.
    pub fn received_bytes(&self) -> Vec<u8> {
        self.received.borrow().clone()
    }
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("length", &self.length)
            .field("progress", &self.progress.get())
            .field("interrupted", &self.interrupted.get())
            .field("cancelled", &self.cancelled.get())
            .finish()
    }
}

/// Transfer lifecycle events.
///
/// `transfer_started` fires both when a queued outbound transfer becomes
/// current and when a peer announces a new inbound transfer; the transfer's
/// direction tells them apart.
pub trait TransferDelegate {
    fn transfer_started(&self, transfer: &Rc<Transfer>) {
        let _ = transfer;
    }

    fn transfer_progress(&self, transfer: &Rc<Transfer>) {
        let _ = transfer;
    }

    fn transfer_completed(&self, transfer: &Rc<Transfer>) {
        let _ = transfer;
    }

    fn transfer_cancelled(&self, transfer: &Rc<Transfer>) {
        let _ = transfer;
    }
}

/// Resumable chunked transfer protocol over one packet connection.
pub struct TransferManager {
    connection: Weak<PacketConnection>,
    delegate: RefCell<Option<Weak<dyn TransferDelegate>>>,
    /// Set while the transport is being replaced; freezes all progress
    /// accounting until the post-reconnect progress exchange.
    interrupted: Cell<bool>,
    inbound: RefCell<Option<Rc<Transfer>>>,
    outbound: RefCell<Option<Rc<Transfer>>>,
    pending: RefCell<VecDeque<Rc<Transfer>>>,
}

impl TransferManager {
    /// Creates the manager and registers it as a delegate of `connection`.
    pub fn attach(connection: &Rc<PacketConnection>) -> Rc<Self> {
        let manager = Rc::new(TransferManager {
            connection: Rc::downgrade(connection),
            delegate: RefCell::new(None),
            interrupted: Cell::new(false),
            inbound: RefCell::new(None),
            outbound: RefCell::new(None),
            pending: RefCell::new(VecDeque::new()),
        });
        connection.add_delegate(manager.clone());
        manager
    }

    /// Sets the transfer event delegate.
    pub fn set_delegate(&self, delegate: Weak<dyn TransferDelegate>) {
        *self.delegate.borrow_mut() = Some(delegate);
    }

    /// Queues an outbound transfer. It starts once every earlier transfer
    /// has finished; the returned handle tracks progress and can be passed
    /// to [`cancel`](TransferManager::cancel).
    pub fn start_transfer(&self, length: u64, supplier: DataSupplier) -> Rc<Transfer> {
        let transfer = Transfer::outbound(length, supplier);
        debug!("queued outbound transfer {} ({} bytes)", transfer.id(), length);
        self.pending.borrow_mut().push_back(transfer.clone());
        if let Some(connection) = self.connection.upgrade() {
            connection.pump();
        }
        transfer
    }

    /// Cancels a transfer.
    ///
    /// Queued outbound transfers are removed without wire traffic (the peer
    /// never learned about them); active transfers are cancelled
    /// cooperatively with a cancellation packet.
    pub fn cancel(&self, transfer: &Rc<Transfer>) {
        match transfer.direction() {
            TransferDirection::Inbound => self.cancel_inbound(transfer),
            TransferDirection::Outbound => self.cancel_outbound(transfer),
        }
    }

    /// The active outbound transfer, if any.
    pub fn current_outbound(&self) -> Option<Rc<Transfer>> {
        self.outbound.borrow().clone()
    }

    /// The active inbound transfer, if any.
    pub fn current_inbound(&self) -> Option<Rc<Transfer>> {
        self.inbound.borrow().clone()
    }

    /// Number of outbound transfers waiting for their turn.
    pub fn pending_transfers(&self) -> usize {
        self.pending.borrow().len()
    }

    /// True while transfers are frozen across a transport swap.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.get()
    }

    fn cancel_inbound(&self, transfer: &Rc<Transfer>) {
        let is_current = self
            .inbound
            .borrow()
            .as_ref()
            .is_some_and(|current| Rc::ptr_eq(current, transfer));
        if !is_current {
            warn!(
                "cancel requested for transfer {} which is not the active inbound transfer",
                transfer.id()
            );
            return;
        }
        transfer.cancelled.set(true);
        *self.inbound.borrow_mut() = None;
        self.send(ControlPacket::TransferCancelled(TransferCancelled {
            id: transfer.id().to_string(),
        }));
        self.with_delegate(|d| d.transfer_cancelled(transfer));
    }

    fn cancel_outbound(&self, transfer: &Rc<Transfer>) {
        let queued_position = self
            .pending
            .borrow()
            .iter()
            .position(|queued| Rc::ptr_eq(queued, transfer));
        if let Some(position) = queued_position {
            // never announced on the wire, so the peer is not told
            self.pending.borrow_mut().remove(position);
            transfer.cancelled.set(true);
            debug!("cancelled queued transfer {}", transfer.id());
            self.with_delegate(|d| d.transfer_cancelled(transfer));
            return;
        }

        let is_current = self
            .outbound
            .borrow()
            .as_ref()
            .is_some_and(|current| Rc::ptr_eq(current, transfer));
        if is_current {
            self.send(ControlPacket::TransferCancelled(TransferCancelled {
                id: transfer.id().to_string(),
            }));
            transfer.cancelled.set(true);
            *self.outbound.borrow_mut() = None;
            debug!("cancelled active outbound transfer {}", transfer.id());
            self.with_delegate(|d| d.transfer_cancelled(transfer));
        } else {
            warn!("cancel requested for unknown outbound transfer {}", transfer.id());
        }
    }

    /// Sends the next chunk of the current outbound transfer and completes
    /// it once the final chunk is out.
    fn send_next_chunk(&self, transfer: &Rc<Transfer>) {
        let connection = match self.connection.upgrade() {
            Some(connection) => connection,
            None => return,
        };
        let supplier = match &transfer.supplier {
            Some(supplier) => supplier,
            None => {
                error!("inbound transfer {} held as current outbound", transfer.id());
                return;
            }
        };

        let start = transfer.progress();
        let end = (start + connection.recommended_packet_size() as u64).min(transfer.length());
        let bytes = supplier(start..end);

        if !bytes.is_empty() {
            self.send(ControlPacket::TransferData(TransferData { bytes }));
        }
        transfer.progress.set(end);
        trace!(
            "transfer {} progressed to {}/{} bytes",
            transfer.id(),
            end,
            transfer.length()
        );
        self.with_delegate(|d| d.transfer_progress(transfer));

        if transfer.is_complete() {
            *self.outbound.borrow_mut() = None;
            debug!("outbound transfer {} complete", transfer.id());
            self.with_delegate(|d| d.transfer_completed(transfer));
        }
    }

    fn handle_started(&self, started: TransferStarted) {
        assert!(
            self.inbound.borrow().is_none(),
            "peer started transfer {} while an inbound transfer is active",
            started.id
        );
        let transfer = Transfer::inbound(started.id, started.length);
        debug!(
            "inbound transfer {} started ({} bytes)",
            transfer.id(),
            transfer.length()
        );
        *self.inbound.borrow_mut() = Some(transfer.clone());
        self.with_delegate(|d| d.transfer_started(&transfer));

        if transfer.length() == 0 {
            // nothing follows on the wire for an empty transfer
            *self.inbound.borrow_mut() = None;
            self.with_delegate(|d| d.transfer_completed(&transfer));
        }
    }

    fn handle_data(&self, data: TransferData) {
        let transfer = self
            .inbound
            .borrow()
            .clone()
            .expect("data packet arrived with no active inbound transfer");

        let progressed = transfer.progress() + data.bytes.len() as u64;
        if progressed > transfer.length() {
            warn!(
                "dropping oversized data packet for transfer {} ({} of {} bytes)",
                transfer.id(),
                progressed,
                transfer.length()
            );
            return;
        }
        transfer.received.borrow_mut().extend_from_slice(&data.bytes);
        transfer.progress.set(progressed);
        self.with_delegate(|d| d.transfer_progress(&transfer));

        if transfer.is_complete() {
            *self.inbound.borrow_mut() = None;
            debug!("inbound transfer {} complete", transfer.id());
            self.with_delegate(|d| d.transfer_completed(&transfer));
        }
    }

    fn handle_progress(&self, report: TransferProgress) {
        for entry in &report.entries {
            let current = self.outbound.borrow().clone();
            match current {
                Some(transfer) if transfer.id() == entry.id => {
                    debug!(
                        "outbound transfer {} resynchronized to {} bytes",
                        transfer.id(),
                        entry.progress
                    );
                    transfer.progress.set(entry.progress);
                    transfer.interrupted.set(false);
                }
                _ => error!("progress report for unknown transfer {}", entry.id),
            }
        }
        self.interrupted.set(false);
        if let Some(connection) = self.connection.upgrade() {
            connection.pump();
        }
    }

    fn handle_cancelled(&self, cancelled: TransferCancelled) {
        let outbound = self.outbound.borrow().clone();
        if let Some(transfer) = outbound {
            if transfer.id() == cancelled.id {
                self.cancel_outbound(&transfer);
                return;
            }
        }

        let inbound = self.inbound.borrow().clone();
        if let Some(transfer) = inbound {
            if transfer.id() == cancelled.id {
                transfer.cancelled.set(true);
                *self.inbound.borrow_mut() = None;
                debug!("inbound transfer {} cancelled by peer", transfer.id());
                self.with_delegate(|d| d.transfer_cancelled(&transfer));
                return;
            }
        }

        warn!("cancellation for unknown transfer {}", cancelled.id);
    }

    fn send(&self, packet: ControlPacket) {
        let connection = match self.connection.upgrade() {
            Some(connection) => connection,
            None => return,
        };
        match packet.encode() {
            Ok(packet) => connection.write(packet),
            Err(e) => warn!("failed to encode transfer packet: {}", e),
        }
    }

    fn with_delegate(&self, event: impl FnOnce(&dyn TransferDelegate)) {
        let delegate = self.delegate.borrow().as_ref().and_then(Weak::upgrade);
        if let Some(delegate) = delegate {
            event(&*delegate);
        }
    }
}

impl ConnectionDelegate for TransferManager {
    fn handled_tags(&self) -> Vec<PacketTag> {
        vec![
            tags::TRANSFER_STARTED,
            tags::TRANSFER_DATA,
            tags::TRANSFER_PROGRESS,
            tags::TRANSFER_CANCELLED,
        ]
    }

    fn handle_packet(&self, packet: Packet) {
        match ControlPacket::decode(&packet) {
            Ok(ControlPacket::TransferStarted(started)) => self.handle_started(started),
            Ok(ControlPacket::TransferData(data)) => self.handle_data(data),
            Ok(ControlPacket::TransferProgress(report)) => self.handle_progress(report),
            Ok(ControlPacket::TransferCancelled(cancelled)) => self.handle_cancelled(cancelled),
            Ok(other) => warn!(
                "unexpected control packet {} routed to the transfer manager",
                other.tag()
            ),
            Err(e) => warn!("undecodable transfer packet: {}", e),
        }
    }

    fn transport_will_change(&self) {
        if self.interrupted.get() {
            return;
        }
        self.interrupted.set(true);
        if let Some(transfer) = self.inbound.borrow().as_ref() {
            transfer.interrupted.set(true);
        }
        if let Some(transfer) = self.outbound.borrow().as_ref() {
            transfer.interrupted.set(true);
        }
        debug!("transfers interrupted ahead of a transport swap");
    }

    fn connection_connected(&self) {
        if !self.interrupted.get() {
            return;
        }
        // Tell the peer where our inbound transfer stands so it can realign
        // its send offset; the outbound side stays frozen until the peer's
        // own report arrives.
        let entries = match self.inbound.borrow().as_ref() {
            Some(transfer) => {
                transfer.interrupted.set(false);
                vec![ProgressEntry {
                    id: transfer.id().to_string(),
                    progress: transfer.progress(),
                }]
            }
            None => Vec::new(),
        };
        self.send(ControlPacket::TransferProgress(TransferProgress { entries }));
    }

    fn all_packets_written(&self) {
        if self.interrupted.get() {
            return;
        }

        let current = self.outbound.borrow().clone();
        if let Some(transfer) = current {
            self.send_next_chunk(&transfer);
            return;
        }

        let next = self.pending.borrow_mut().pop_front();
        if let Some(transfer) = next {
            *self.outbound.borrow_mut() = Some(transfer.clone());
            debug!(
                "outbound transfer {} is now current ({} bytes)",
                transfer.id(),
                transfer.length()
            );
            self.with_delegate(|d| d.transfer_started(&transfer));
            self.send(ControlPacket::TransferStarted(TransferStarted {
                id: transfer.id().to_string(),
                length: transfer.length(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_debug_omits_supplier() {
        let transfer = Transfer::outbound(8, Box::new(|_| Vec::new()));
        let debug = format!("{:?}", transfer);
        assert!(debug.contains("Outbound"));
        assert!(!debug.contains("supplier"));
    }

    #[test]
    fn test_inbound_transfer_accumulates() {
        let transfer = Transfer::inbound("t-1".into(), 4);
        transfer.received.borrow_mut().extend_from_slice(&[1, 2]);
        transfer.progress.set(2);

        assert!(!transfer.is_complete());
        assert_eq!(transfer.received_bytes(), vec![1, 2]);
    }
}
