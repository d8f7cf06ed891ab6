// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Packet Types
//!
//! Wire format for the link protocol: a fixed 4-byte type tag followed by a
//! type-specific payload. The payload carries no length prefix; the enclosing
//! transport message framing delimits it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, LinkResult};

/// Unique transfer identifier (UUID v4, string form).
pub type TransferId = String;

/// Identity of a destination peer on a connection.
pub type PeerId = String;

/// Size of the type tag preceding every payload.
pub const TAG_SIZE: usize = 4;

/// A 4-byte packet type tag.
///
/// Control tags are printable four-character codes so log lines stay
/// readable; application packets may claim any tag outside [`tags`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketTag(pub u32);

impl PacketTag {
    /// Creates a tag from a four-character code.
    pub const fn from_fourcc(code: [u8; 4]) -> Self {
        PacketTag(u32::from_be_bytes(code))
    }

    /// Returns the tag as its four raw bytes (big-endian).
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for PacketTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_bytes();
        if bytes.iter().all(|b| b.is_ascii_graphic()) {
            for b in bytes {
                write!(f, "{}", b as char)?;
            }
            Ok(())
        } else {
            write!(f, "{:#010x}", self.0)
        }
    }
}

impl fmt::Debug for PacketTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketTag({})", self)
    }
}

/// Tags of the protocol-control packet set.
pub mod tags {
    use super::PacketTag;

    /// Ask peers to agree to close the connection.
    pub const CLOSE_REQUEST: PacketTag = PacketTag::from_fourcc(*b"CLRQ");
    /// Announce that the sender is closing the connection.
    pub const CLOSE_ANNOUNCE: PacketTag = PacketTag::from_fourcc(*b"CLAN");
    /// Acknowledge a close announcement, carrying the sender's identity.
    pub const CLOSE_ACKNOWLEDGE: PacketTag = PacketTag::from_fourcc(*b"CLAK");
    /// Announce a new outbound transfer (id and total length).
    pub const TRANSFER_STARTED: PacketTag = PacketTag::from_fourcc(*b"TFST");
    /// One chunk of the current transfer.
    pub const TRANSFER_DATA: PacketTag = PacketTag::from_fourcc(*b"TFDA");
    /// Progress report used to realign transfers after a reconnect.
    pub const TRANSFER_PROGRESS: PacketTag = PacketTag::from_fourcc(*b"TFPR");
    /// Cooperative cancellation of a transfer.
    pub const TRANSFER_CANCELLED: PacketTag = PacketTag::from_fourcc(*b"TFCA");
}

/// A framed packet: type tag plus opaque payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// The 4-byte type tag. Uniquely determines the payload layout and
    /// which handler may claim the packet.
    pub tag: PacketTag,
    /// Type-specific payload bytes.
    pub payload: Vec<u8>,
}

impl Packet {
    /// Creates a packet from a tag and payload.
    pub fn new(tag: PacketTag, payload: Vec<u8>) -> Self {
        Packet { tag, payload }
    }

    /// Serializes the packet: tag (big-endian) followed by the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(TAG_SIZE + self.payload.len());
        frame.extend_from_slice(&self.tag.to_bytes());
        frame.extend_from_slice(&self.payload);
        frame
    }

    /// Reconstructs a packet from a received frame.
    pub fn decode(frame: &[u8]) -> LinkResult<Self> {
        let tag = Self::peek_tag(frame).ok_or(LinkError::TruncatedFrame(frame.len()))?;
        Ok(Packet {
            tag,
            payload: frame[TAG_SIZE..].to_vec(),
        })
    }

    /// Reads the type tag of a frame without consuming the payload.
    pub fn peek_tag(frame: &[u8]) -> Option<PacketTag> {
        let bytes: [u8; 4] = frame.get(..TAG_SIZE)?.try_into().ok()?;
        Some(PacketTag(u32::from_be_bytes(bytes)))
    }
}

/// Close acknowledgement payload: the acknowledging peer's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseAcknowledge {
    pub peer: PeerId,
}

/// Announcement of a new transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferStarted {
    pub id: TransferId,
    /// Total transfer length in bytes.
    pub length: u64,
}

/// One chunk of the current transfer. Carries no transfer id: at most one
/// transfer is active per direction, so the id is implicit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferData {
    pub bytes: Vec<u8>,
}

/// Progress of a single transfer, as observed by the sender of the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub id: TransferId,
    /// Bytes received so far.
    pub progress: u64,
}

/// Progress report listing the reporting side's active inbound transfers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub entries: Vec<ProgressEntry>,
}

/// Cooperative cancellation of the named transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCancelled {
    pub id: TransferId,
}

/// The protocol-control packet set.
///
/// Everything the reliability and transfer managers speak; application
/// packets pass through the packet connection untyped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket {
    CloseRequest,
    CloseAnnounce,
    CloseAcknowledge(CloseAcknowledge),
    TransferStarted(TransferStarted),
    TransferData(TransferData),
    TransferProgress(TransferProgress),
    TransferCancelled(TransferCancelled),
}

impl ControlPacket {
    /// Returns the wire tag of this control packet.
    pub fn tag(&self) -> PacketTag {
        match self {
            ControlPacket::CloseRequest => tags::CLOSE_REQUEST,
            ControlPacket::CloseAnnounce => tags::CLOSE_ANNOUNCE,
            ControlPacket::CloseAcknowledge(_) => tags::CLOSE_ACKNOWLEDGE,
            ControlPacket::TransferStarted(_) => tags::TRANSFER_STARTED,
            ControlPacket::TransferData(_) => tags::TRANSFER_DATA,
            ControlPacket::TransferProgress(_) => tags::TRANSFER_PROGRESS,
            ControlPacket::TransferCancelled(_) => tags::TRANSFER_CANCELLED,
        }
    }

    /// Serializes this control packet into a framed [`Packet`].
    pub fn encode(&self) -> LinkResult<Packet> {
        let payload = match self {
            ControlPacket::CloseRequest | ControlPacket::CloseAnnounce => Vec::new(),
            ControlPacket::CloseAcknowledge(p) => serialize(p)?,
            ControlPacket::TransferStarted(p) => serialize(p)?,
            ControlPacket::TransferData(p) => serialize(p)?,
            ControlPacket::TransferProgress(p) => serialize(p)?,
            ControlPacket::TransferCancelled(p) => serialize(p)?,
        };
        Ok(Packet::new(self.tag(), payload))
    }

    /// Reconstructs a control packet from a framed [`Packet`].
    pub fn decode(packet: &Packet) -> LinkResult<Self> {
        match packet.tag {
            tags::CLOSE_REQUEST => Ok(ControlPacket::CloseRequest),
            tags::CLOSE_ANNOUNCE => Ok(ControlPacket::CloseAnnounce),
            tags::CLOSE_ACKNOWLEDGE => {
                Ok(ControlPacket::CloseAcknowledge(deserialize(&packet.payload)?))
            }
            tags::TRANSFER_STARTED => {
                Ok(ControlPacket::TransferStarted(deserialize(&packet.payload)?))
            }
            tags::TRANSFER_DATA => Ok(ControlPacket::TransferData(deserialize(&packet.payload)?)),
            tags::TRANSFER_PROGRESS => {
                Ok(ControlPacket::TransferProgress(deserialize(&packet.payload)?))
            }
            tags::TRANSFER_CANCELLED => {
                Ok(ControlPacket::TransferCancelled(deserialize(&packet.payload)?))
            }
            tag => Err(LinkError::InvalidPacket(format!(
                "not a control packet tag: {}",
                tag
            ))),
        }
    }
}

fn serialize<T: Serialize>(payload: &T) -> LinkResult<Vec<u8>> {
    bincode::serialize(payload).map_err(|e| LinkError::Serialization(e.to_string()))
}

fn deserialize<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> LinkResult<T> {
    bincode::deserialize(payload).map_err(|e| LinkError::InvalidPacket(e.to_string()))
}
