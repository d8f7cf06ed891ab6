// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! RetroLink Core Library
//!
//! Peer-to-peer link layer for the RetroLink frontend: packet framing and
//! dispatch, a close-handshake and bounded-reconnect manager, and a
//! resumable chunked-transfer manager, all above a swappable raw transport.
//!
//! The whole subsystem is single-threaded and event-driven: transport
//! callbacks, timer ticks, and public calls are expected to run serialized
//! on one execution context per connection, and nothing here blocks.
//! "Waiting" is always explicit state — pending queues, interruption flags,
//! an armed retry deadline.

pub mod connection;
pub mod error;
pub mod mock;
pub mod packet;
pub mod reliability;
pub mod transfer;
pub mod transport;

pub use connection::{ConnectionDelegate, ConnectionId, DelegateId, PacketConnection};
pub use error::{LinkError, LinkResult};
pub use mock::MockTransport;
pub use packet::{
    tags, CloseAcknowledge, ControlPacket, Packet, PacketTag, PeerId, ProgressEntry, TransferCancelled,
    TransferData, TransferId, TransferProgress, TransferStarted, TAG_SIZE,
};
pub use reliability::{
    ConnectionHost, LinkState, ReliabilityConfig, ReliabilityDelegate, ReliabilityManager,
};
pub use transfer::{
    DataSupplier, Transfer, TransferDelegate, TransferDirection, TransferManager,
};
pub use transport::{Transport, TransportEvents, DEFAULT_PACKET_SIZE};
