//! Logical connections
//!
//! A [`Connection`] is one multiplexed flow inside a tunnel: an integer
//! identifier, a half-close state machine, a two-source suspension gate,
//! and an ordered event channel to the task that owns the flow's external
//! endpoint (a relay socket on the server, the flow handle on the client).
//!
//! # Half-close state machine
//!
//! The close state only ever moves toward `All`:
//!
//! | current | read | write | all |
//! |---------|------|-------|-----|
//! | `None`  | `Read` | `Write` | `All` |
//! | `Read`  | `Read` | `All` | `All` |
//! | `Write` | `All` | `Write` | `All` |
//! | `All`   | `All` | `All` | `All` |
//!
//! Applying a direction different from the current partial state collapses
//! to `All` even when the two directions would not logically compose; the
//! peer depends on that collapse.

use std::sync::Arc;
use std::sync::Weak;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use super::Tunnel;
use crate::config::TunnelConfiguration;
use crate::message::{CloseDirection, ResultCode};

/// An event delivered to the task owning a flow's external endpoint
///
/// Events for one connection arrive in the order the peer sent the
/// corresponding messages.
#[derive(Debug)]
pub enum FlowEvent {
    /// Payload bytes for a stream flow
    Data(Bytes),
    /// Payload bytes for a datagram flow, with the peer endpoint
    Datagram {
        /// Datagram payload
        data: Bytes,
        /// Peer host
        host: String,
        /// Peer port
        port: u16,
    },
    /// A batch of raw IP packets
    Packets {
        /// One raw IP packet each
        packets: Vec<Bytes>,
        /// AF family per packet, same length as `packets`
        protocols: Vec<i64>,
    },
    /// The flow was closed in the given direction
    Close(CloseDirection),
    /// Answer to an open attempt (client side)
    OpenResult {
        /// Outcome of the open
        code: ResultCode,
        /// Tunnel network settings, for IP flows
        configuration: Option<TunnelConfiguration>,
    },
}

/// Compute the next close state for an applied direction
const fn advance(current: CloseDirection, direction: CloseDirection) -> CloseDirection {
    match (current, direction) {
        (current, CloseDirection::None) => current,
        (CloseDirection::None, direction) => direction,
        (CloseDirection::All, _) => CloseDirection::All,
        (CloseDirection::Read, CloseDirection::Read) => CloseDirection::Read,
        (CloseDirection::Write, CloseDirection::Write) => CloseDirection::Write,
        // different direction than current collapses to all
        _ => CloseDirection::All,
    }
}

/// Why a flow is locally suspended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SuspendState {
    /// The peer sent a suspend message
    peer: bool,
    /// The tunnel's outbound save queue is non-empty
    transport: bool,
}

impl SuspendState {
    const fn is_suspended(self) -> bool {
        self.peer || self.transport
    }
}

/// One multiplexed flow inside a tunnel
#[derive(Debug)]
pub struct Connection {
    identifier: u32,
    exclusive: bool,
    tunnel: Mutex<Weak<Tunnel>>,
    close_state: watch::Sender<CloseDirection>,
    suspend: watch::Sender<SuspendState>,
    events: mpsc::UnboundedSender<FlowEvent>,
}

impl Connection {
    /// Create a connection and the receiving end of its event channel
    ///
    /// The connection does nothing until registered with a tunnel via
    /// [`Tunnel::insert_connection`](super::Tunnel::insert_connection).
    /// An `exclusive` connection closes its tunnel when it fully closes.
    #[must_use]
    pub fn channel(
        identifier: u32,
        exclusive: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<FlowEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (close_state, _) = watch::channel(CloseDirection::None);
        let (suspend, _) = watch::channel(SuspendState::default());
        let connection = Arc::new(Self {
            identifier,
            exclusive,
            tunnel: Mutex::new(Weak::new()),
            close_state,
            suspend,
            events,
        });
        (connection, receiver)
    }

    /// The flow identifier
    #[must_use]
    pub fn identifier(&self) -> u32 {
        self.identifier
    }

    /// Whether closing this flow closes its tunnel
    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// The owning tunnel, if this connection is still registered
    #[must_use]
    pub fn tunnel(&self) -> Option<Arc<Tunnel>> {
        self.tunnel.lock().upgrade()
    }

    /// Current close state
    #[must_use]
    pub fn close_direction(&self) -> CloseDirection {
        *self.close_state.borrow()
    }

    /// Whether the read side is closed
    #[must_use]
    pub fn closed_for_read(&self) -> bool {
        self.close_direction().closes_read()
    }

    /// Whether the write side is closed
    #[must_use]
    pub fn closed_for_write(&self) -> bool {
        self.close_direction().closes_write()
    }

    /// Watch close-state transitions
    #[must_use]
    pub fn watch_close(&self) -> watch::Receiver<CloseDirection> {
        self.close_state.subscribe()
    }

    /// Whether the flow is locally suspended (either source)
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.suspend.borrow().is_suspended()
    }

    /// Wait until the flow is not suspended
    ///
    /// Returns immediately when unsuspended. Cancel-safe.
    pub async fn readable(&self) {
        let mut rx = self.suspend.subscribe();
        loop {
            if !rx.borrow_and_update().is_suspended() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Advance the close state; returns true on the transition into `All`
    pub(crate) fn advance_close(&self, direction: CloseDirection) -> bool {
        let mut became_fully_closed = false;
        self.close_state.send_modify(|current| {
            let next = advance(*current, direction);
            became_fully_closed =
                next == CloseDirection::All && *current != CloseDirection::All;
            *current = next;
        });
        became_fully_closed
    }

    pub(crate) fn bind_tunnel(&self, tunnel: &Arc<Tunnel>) {
        *self.tunnel.lock() = Arc::downgrade(tunnel);
    }

    pub(crate) fn clear_tunnel(&self) {
        *self.tunnel.lock() = Weak::new();
    }

    pub(crate) fn set_peer_suspended(&self, suspended: bool) {
        self.suspend.send_modify(|state| state.peer = suspended);
    }

    pub(crate) fn set_transport_suspended(&self, suspended: bool) {
        self.suspend
            .send_modify(|state| state.transport = suspended);
    }

    /// Deliver an event to the owning task; delivery failures mean the
    /// task is gone and are ignored
    pub(crate) fn deliver(&self, event: FlowEvent) {
        let _ = self.events.send(event);
    }

    /// Locally tear the flow down: fully closed, back-reference cleared,
    /// owning task notified, suspension lifted so waiters wake
    ///
    /// Sends nothing to the peer. Idempotent.
    pub(crate) fn abort(&self) {
        self.advance_close(CloseDirection::All);
        self.clear_tunnel();
        self.suspend.send_modify(|state| {
            state.peer = false;
            state.transport = false;
        });
        self.deliver(FlowEvent::Close(CloseDirection::All));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_table() {
        use CloseDirection::{All, None, Read, Write};
        let cases = [
            (None, Read, Read),
            (None, Write, Write),
            (None, All, All),
            (Read, Read, Read),
            (Read, Write, All),
            (Read, All, All),
            (Write, Read, All),
            (Write, Write, Write),
            (Write, All, All),
            (All, Read, All),
            (All, Write, All),
            (All, All, All),
            // direction none is a no-op from every state
            (None, None, None),
            (Read, None, Read),
            (Write, None, Write),
            (All, None, All),
        ];
        for (current, direction, expected) in cases {
            assert_eq!(
                advance(current, direction),
                expected,
                "advance({current:?}, {direction:?})"
            );
        }
    }

    #[test]
    fn test_monotonicity() {
        use CloseDirection::{All, None, Read, Write};
        // from any reachable state, applying any direction never yields a
        // less-closed state
        fn rank(direction: CloseDirection) -> u8 {
            use CloseDirection::{All, None, Read, Write};
            match direction {
                None => 0,
                Read | Write => 1,
                All => 2,
            }
        }
        for current in [None, Read, Write, All] {
            for direction in [None, Read, Write, All] {
                assert!(rank(advance(current, direction)) >= rank(current));
            }
        }
    }

    #[test]
    fn test_advance_close_reports_transition_once() {
        let (connection, _rx) = Connection::channel(9, false);
        assert!(!connection.advance_close(CloseDirection::Read));
        assert_eq!(connection.close_direction(), CloseDirection::Read);
        assert!(connection.closed_for_read());
        assert!(!connection.closed_for_write());

        assert!(connection.advance_close(CloseDirection::Write));
        assert_eq!(connection.close_direction(), CloseDirection::All);

        // already fully closed: no second transition
        assert!(!connection.advance_close(CloseDirection::All));
    }

    #[test]
    fn test_suspension_sources_combine() {
        let (connection, _rx) = Connection::channel(1, false);
        assert!(!connection.is_suspended());

        connection.set_peer_suspended(true);
        assert!(connection.is_suspended());
        connection.set_transport_suspended(true);
        connection.set_peer_suspended(false);
        // still suspended through the transport source
        assert!(connection.is_suspended());
        connection.set_transport_suspended(false);
        assert!(!connection.is_suspended());
    }

    #[tokio::test]
    async fn test_readable_waits_for_resume() {
        let (connection, _rx) = Connection::channel(1, false);
        connection.set_peer_suspended(true);

        let waiter = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.readable().await })
        };
        // the waiter must be blocked
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        connection.set_peer_suspended(false);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("readable did not resolve")
            .unwrap();
    }

    #[test]
    fn test_abort_is_idempotent_and_delivers_close() {
        let (connection, mut rx) = Connection::channel(3, false);
        connection.set_peer_suspended(true);

        connection.abort();
        connection.abort();

        assert_eq!(connection.close_direction(), CloseDirection::All);
        assert!(connection.tunnel().is_none());
        assert!(!connection.is_suspended());
        assert!(matches!(
            rx.try_recv(),
            Ok(FlowEvent::Close(CloseDirection::All))
        ));
    }
}
