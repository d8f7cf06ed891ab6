// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Reliability Manager
//!
//! Close handshake and bounded reconnect on top of a packet connection.
//!
//! The manager registers itself as a delegate of its packet connection and
//! claims the close-handshake packet tags. All recoverability decisions live
//! here; the connection below never retries anything on its own.

use std::cell::{Cell, RefCell};
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::connection::{ConnectionDelegate, PacketConnection};
use crate::error::LinkError;
use crate::packet::{tags, CloseAcknowledge, ControlPacket, Packet, PacketTag, PeerId};

/// Timing and retry bounds for the reconnect state machine.
#[derive(Debug, Clone)]
pub struct ReliabilityConfig {
    /// Delay before the first reconnect attempt after an unexpected close.
    pub initial_retry_delay: Duration,
    /// Delay between subsequent reconnect attempts.
    pub retry_delay: Duration,
    /// Attempts before the connection is reported closed unexpectedly.
    pub max_reconnect_attempts: u32,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        ReliabilityConfig {
            initial_retry_delay: Duration::from_secs(1),
            retry_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
        }
    }
}

/// Observable state of a managed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// Connected (or awaiting the first transport).
    Connected,
    /// A close handshake is underway.
    Closing,
    /// The transport dropped; reconnect attempts are running.
    Reconnecting { attempt: u32 },
    /// Terminally closed. `expected` is false when retries were exhausted.
    Closed { expected: bool },
}

/// The owning application, asked to produce transports and told when a
/// logical connection is finished.
pub trait ConnectionHost {
    /// Attempt to establish a new underlying transport for the connection.
    /// The outcome arrives later as a transport event; this call never
    /// blocks.
    fn establish_underlying_connection(&self, connection: &Rc<PacketConnection>);

    /// The logical connection is permanently done, successfully or not.
    fn notify_connection_close(&self, connection: &Rc<PacketConnection>);
}

/// Upward-facing connection lifecycle events.
pub trait ReliabilityDelegate {
    /// The connection (re)connected.
    fn connection_connected(&self, connection: &Rc<PacketConnection>) {
        let _ = connection;
    }

    /// The connection closed as the result of a completed close handshake.
    fn connection_closed_expectedly(&self, connection: &Rc<PacketConnection>) {
        let _ = connection;
    }

    /// The connection closed and could not be re-established. Carries the
    /// error captured when the transport first dropped, if any.
    fn connection_closed_unexpectedly(
        &self,
        connection: &Rc<PacketConnection>,
        error: Option<LinkError>,
    ) {
        let _ = (connection, error);
    }
}

/// Deadline-based retry timer. The owning event loop drives it through
/// [`ReliabilityManager::tick`]; nothing fires on its own.
#[derive(Default)]
struct RetryTimer {
    deadline: Cell<Option<Instant>>,
}

impl RetryTimer {
    fn arm(&self, now: Instant, delay: Duration) {
        self.deadline.set(Some(now + delay));
    }

    fn cancel(&self) {
        self.deadline.set(None);
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline.get()
    }

    fn fire_if_due(&self, now: Instant) -> bool {
        match self.deadline.get() {
            Some(deadline) if now >= deadline => {
                self.deadline.set(None);
                true
            }
            _ => false,
        }
    }
}

/// Close handshake + bounded reconnect for one packet connection.
pub struct ReliabilityManager {
    connection: Weak<PacketConnection>,
    host: Weak<dyn ConnectionHost>,
    delegate: RefCell<Option<Weak<dyn ReliabilityDelegate>>>,
    config: ReliabilityConfig,
    /// Identity carried in our close acknowledgements.
    local_peer: PeerId,
    /// Fixed at construction: whether this connection reconnects on drops.
    expects_reconnect: bool,
    close_requested: Cell<bool>,
    expecting_close: Cell<bool>,
    reconnect_attempts: Cell<u32>,
    acks_received: RefCell<BTreeSet<PeerId>>,
    /// Last observed close error, reported only if every reconnect fails.
    last_error: RefCell<Option<LinkError>>,
    /// Some(expected) once the connection is terminally closed.
    finished: Cell<Option<bool>>,
    retry_timer: RetryTimer,
}

impl ReliabilityManager {
    /// Creates the manager and registers it as a delegate of `connection`.
    pub fn attach(
        connection: &Rc<PacketConnection>,
        host: Weak<dyn ConnectionHost>,
        local_peer: PeerId,
        expects_reconnect: bool,
        config: ReliabilityConfig,
    ) -> Rc<Self> {
        let manager = Rc::new(ReliabilityManager {
            connection: Rc::downgrade(connection),
            host,
            delegate: RefCell::new(None),
            config,
            local_peer,
            expects_reconnect,
            close_requested: Cell::new(false),
            expecting_close: Cell::new(false),
            reconnect_attempts: Cell::new(0),
            acks_received: RefCell::new(BTreeSet::new()),
            last_error: RefCell::new(None),
            finished: Cell::new(None),
            retry_timer: RetryTimer::default(),
        });
        connection.add_delegate(manager.clone());
        manager
    }

    /// Sets the upward event delegate.
    pub fn set_delegate(&self, delegate: Weak<dyn ReliabilityDelegate>) {
        *self.delegate.borrow_mut() = Some(delegate);
    }

    /// Current observable state, derived from the handshake and retry
    /// bookkeeping.
    pub fn state(&self) -> LinkState {
        if let Some(expected) = self.finished.get() {
            return LinkState::Closed { expected };
        }
        if self.retry_timer.deadline().is_some() {
            return LinkState::Reconnecting {
                attempt: self.reconnect_attempts.get(),
            };
        }
        if self.expecting_close.get() || self.close_requested.get() {
            return LinkState::Closing;
        }
        LinkState::Connected
    }

    /// Number of reconnect attempts since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.get()
    }

    /// True once a close is mutually agreed or announced by a peer.
    pub fn is_expecting_close(&self) -> bool {
        self.expecting_close.get()
    }

    /// The armed retry deadline, for event loops that schedule wakeups.
    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_timer.deadline()
    }

    /// The last close error observed on the transport.
    pub fn last_error(&self) -> Option<LinkError> {
        self.last_error.borrow().clone()
    }

    /// Initiates closing the connection.
    ///
    /// Reconnect-capable connections announce the close outright (we are
    /// leaving for good; the announce gives peers a chance to acknowledge),
    /// others ask their peers to agree first.
    pub fn close_connection(&self) {
        self.close_requested.set(true);
        if self.expects_reconnect {
            self.send(ControlPacket::CloseAnnounce);
        } else {
            self.send(ControlPacket::CloseRequest);
        }
    }

    /// Drives the retry timer. Call with the current time from the owning
    /// event loop; fires at most one reconnect attempt per call.
    pub fn tick(&self, now: Instant) {
        if self.retry_timer.fire_if_due(now) {
            self.attempt_reconnect(now);
        }
    }

    fn attempt_reconnect(&self, now: Instant) {
        let connection = match self.connection.upgrade() {
            Some(connection) => connection,
            None => {
                self.retry_timer.cancel();
                return;
            }
        };
        if connection.is_connected() {
            // Raced with a connect that succeeded before the timer fired.
            return;
        }

        let attempt = self.reconnect_attempts.get() + 1;
        self.reconnect_attempts.set(attempt);

        if attempt > self.config.max_reconnect_attempts {
            self.retry_timer.cancel();
            self.finished.set(Some(false));
            debug!(
                "connection {} gave up after {} reconnect attempts",
                connection.id(),
                self.config.max_reconnect_attempts
            );
            if let Some(host) = self.host.upgrade() {
                host.notify_connection_close(&connection);
            }
            let error = self.last_error.borrow().clone();
            self.with_delegate(|d| d.connection_closed_unexpectedly(&connection, error.clone()));
        } else {
            // The timer drives retries, not the outcome of the attempt: a
            // slow attempt that eventually connects can be retried once more
            // before the counter resets on the connected event.
            self.retry_timer.arm(now, self.config.retry_delay);
            debug!(
                "reconnect attempt {} of {} for connection {}",
                attempt,
                self.config.max_reconnect_attempts,
                connection.id()
            );
            if let Some(host) = self.host.upgrade() {
                host.establish_underlying_connection(&connection);
            }
        }
    }

    fn send(&self, packet: ControlPacket) {
        let connection = match self.connection.upgrade() {
            Some(connection) => connection,
            None => return,
        };
        match packet.encode() {
            Ok(packet) => connection.write(packet),
            Err(e) => warn!("failed to encode control packet: {}", e),
        }
    }

    fn with_delegate(&self, event: impl FnOnce(&dyn ReliabilityDelegate)) {
        let delegate = self.delegate.borrow().as_ref().and_then(Weak::upgrade);
        if let Some(delegate) = delegate {
            event(&*delegate);
        }
    }

    fn handle_close_acknowledge(&self, ack: CloseAcknowledge) {
        let connection = match self.connection.upgrade() {
            Some(connection) => connection,
            None => return,
        };
        if !connection.destinations().contains(&ack.peer) {
            warn!("close acknowledged by unknown peer {}", ack.peer);
            return;
        }
        let complete = {
            let mut acks = self.acks_received.borrow_mut();
            acks.insert(ack.peer);
            // exact equality: a strict subset of acknowledgements is not
            // progress towards closing
            *acks == *connection.destinations()
        };
        if complete {
            debug!(
                "close acknowledged by all destinations on connection {}",
                connection.id()
            );
            self.expecting_close.set(true);
            connection.disconnect_transport();
        }
    }
}

impl ConnectionDelegate for ReliabilityManager {
    fn handled_tags(&self) -> Vec<PacketTag> {
        vec![tags::CLOSE_REQUEST, tags::CLOSE_ANNOUNCE, tags::CLOSE_ACKNOWLEDGE]
    }

    fn handle_packet(&self, packet: Packet) {
        match ControlPacket::decode(&packet) {
            Ok(ControlPacket::CloseRequest) => {
                // peer-initiated agreement: answer with our own announcement
                self.send(ControlPacket::CloseAnnounce);
            }
            Ok(ControlPacket::CloseAnnounce) => {
                self.expecting_close.set(true);
                self.send(ControlPacket::CloseAcknowledge(CloseAcknowledge {
                    peer: self.local_peer.clone(),
                }));
            }
            Ok(ControlPacket::CloseAcknowledge(ack)) => self.handle_close_acknowledge(ack),
            Ok(other) => warn!(
                "unexpected control packet {} routed to the reliability manager",
                other.tag()
            ),
            Err(e) => warn!("undecodable close-handshake packet: {}", e),
        }
    }

    fn connection_connected(&self) {
        *self.last_error.borrow_mut() = None;
        self.reconnect_attempts.set(0);
        self.retry_timer.cancel();
        let connection = match self.connection.upgrade() {
            Some(connection) => connection,
            None => return,
        };
        debug!("connection {} connected", connection.id());
        self.with_delegate(|d| d.connection_connected(&connection));
    }

    fn connection_closed(&self, error: Option<LinkError>) {
        if self.finished.get().is_some() {
            return;
        }
        *self.last_error.borrow_mut() = error;
        let connection = match self.connection.upgrade() {
            Some(connection) => connection,
            None => return,
        };
        if self.expecting_close.get() {
            self.retry_timer.cancel();
            self.finished.set(Some(true));
            debug!("connection {} closed expectedly", connection.id());
            if let Some(host) = self.host.upgrade() {
                host.notify_connection_close(&connection);
            }
            self.with_delegate(|d| d.connection_closed_expectedly(&connection));
        } else {
            debug!(
                "connection {} closed unexpectedly, scheduling reconnect",
                connection.id()
            );
            self.retry_timer
                .arm(Instant::now(), self.config.initial_retry_delay);
        }
    }
}

// INLINE_TEST_REQUIRED: Tests the private retry timer
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_timer_fires_once_per_arm() {
        let timer = RetryTimer::default();
        let now = Instant::now();

        timer.arm(now, Duration::from_secs(1));
        assert!(!timer.fire_if_due(now));
        assert!(timer.fire_if_due(now + Duration::from_secs(2)));
        // consumed: does not fire again until re-armed
        assert!(!timer.fire_if_due(now + Duration::from_secs(3)));
    }

    #[test]
    fn test_retry_timer_cancel() {
        let timer = RetryTimer::default();
        let now = Instant::now();

        timer.arm(now, Duration::from_secs(1));
        timer.cancel();
        assert!(!timer.fire_if_due(now + Duration::from_secs(2)));
        assert_eq!(timer.deadline(), None);
    }
}
