//! Tunnel core
//!
//! A [`Tunnel`] owns one reliable byte channel and multiplexes logical
//! flows over it. This module ties together the pieces:
//!
//! - [`connection`]: per-flow half-close state, suspension, event delivery
//! - [`dispatch`]: routing of decoded messages to flows or the role handler
//! - [`transport`]: the framed read loop and the save-queue flusher
//! - [`registry`]: the process-wide tunnel list used for shutdown
//!
//! # Backpressure
//!
//! All outbound messages go through [`Tunnel::write_message`]. When the
//! transport does not accept a whole frame synchronously, the remainder is
//! parked in the tunnel save queue and **every** member flow is suspended;
//! the flusher resumes them all once the queue drains. While the save
//! queue is non-empty, every member connection is suspended — that
//! invariant is what keeps a slow tunnel from buffering without bound.

pub mod connection;
pub(crate) mod dispatch;
mod registry;
mod transport;

pub use connection::{Connection, FlowEvent};
pub use registry::{active_tunnel_count, close_all_tunnels};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use crate::config::TunnelConfiguration;
use crate::io::{QueuedWriter, WriteOutcome};
use crate::message::{encode_frame, CloseDirection, Command, Message};

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Receiver of tunnel lifecycle events
///
/// All methods have empty defaults; implement what you need.
pub trait TunnelDelegate: Send + Sync {
    /// The tunnel transport is attached and running
    fn tunnel_opened(&self) {}

    /// The tunnel closed; fires exactly once
    fn tunnel_closed(&self) {}

    /// The peer delivered tunnel network settings
    fn configuration_received(&self, _configuration: TunnelConfiguration) {}
}

/// A delegate that ignores every event
pub struct NoDelegate;

impl TunnelDelegate for NoDelegate {}

impl<T: TunnelDelegate + ?Sized> TunnelDelegate for Arc<T> {
    fn tunnel_opened(&self) {
        (**self).tunnel_opened();
    }

    fn tunnel_closed(&self) {
        (**self).tunnel_closed();
    }

    fn configuration_received(&self, configuration: TunnelConfiguration) {
        (**self).configuration_received(configuration);
    }
}

/// The role-specific half of message handling
///
/// The dispatch core is identical on both endpoints; the role handler is
/// the sole point of asymmetry. The server role recognizes `open` and
/// `fetchConfiguration`; the client role recognizes `openResult` and
/// `fetchConfiguration` responses.
#[async_trait]
pub trait RoleHandler: Send + Sync {
    /// Handle a message the dispatch core did not consume
    ///
    /// `connection` is the resolved flow for commands that carried a known
    /// identifier, `None` for `open`, `dns`, and unresolved identifiers.
    async fn handle_unrouted(
        &self,
        tunnel: &Arc<Tunnel>,
        command: Command,
        message: Message,
        connection: Option<Arc<Connection>>,
    );
}

struct TunnelState {
    connections: HashMap<u32, Arc<Connection>>,
    sink: Option<QueuedWriter<BoxWriter>>,
    queue_suspended: bool,
}

/// One multiplexing tunnel over a reliable byte channel
pub struct Tunnel {
    id: u64,
    role: Box<dyn RoleHandler>,
    delegate: Box<dyn TunnelDelegate>,
    state: Mutex<TunnelState>,
    writable: Notify,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Tunnel {
    /// Create a tunnel and register it in the process-wide list
    ///
    /// The tunnel is inert until [`start`](Self::start) attaches a
    /// transport.
    #[must_use]
    pub fn new(role: Box<dyn RoleHandler>, delegate: Box<dyn TunnelDelegate>) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let tunnel = Arc::new(Self {
            id: registry::next_tunnel_id(),
            role,
            delegate,
            state: Mutex::new(TunnelState {
                connections: HashMap::new(),
                sink: None,
                queue_suspended: false,
            }),
            writable: Notify::new(),
            shutdown,
            closed: AtomicBool::new(false),
        });
        registry::register(&tunnel);
        tunnel
    }

    /// Attach the transport and spawn the read and flush loops
    ///
    /// Must be called at most once.
    pub fn start<S>(self: &Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        {
            let mut state = self.state.lock();
            if state.sink.is_some() {
                warn!(tunnel = self.id, "transport already attached");
                return;
            }
            state.sink = Some(QueuedWriter::new(Box::new(writer)));
        }
        self.delegate.tunnel_opened();
        tokio::spawn(transport::read_loop(
            Arc::clone(self),
            Box::new(reader) as BoxReader,
        ));
        tokio::spawn(transport::flush_loop(Arc::clone(self)));
    }

    /// The tunnel's process-unique id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the tunnel has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of registered flows
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Bytes parked in the tunnel save queue
    #[must_use]
    pub fn pending_outbound_bytes(&self) -> usize {
        self.state
            .lock()
            .sink
            .as_ref()
            .map_or(0, QueuedWriter::queued_bytes)
    }

    /// Look up a flow by identifier
    #[must_use]
    pub fn connection(&self, identifier: u32) -> Option<Arc<Connection>> {
        self.state.lock().connections.get(&identifier).cloned()
    }

    /// Register a flow
    ///
    /// Returns false when the tunnel is closed or the identifier is taken.
    /// A flow registered while the save queue is non-empty joins in the
    /// suspended state.
    pub fn insert_connection(self: &Arc<Self>, connection: &Arc<Connection>) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut state = self.state.lock();
        if state.connections.contains_key(&connection.identifier()) {
            return false;
        }
        connection.bind_tunnel(self);
        if state.queue_suspended {
            connection.set_transport_suspended(true);
        }
        state
            .connections
            .insert(connection.identifier(), Arc::clone(connection));
        true
    }

    /// Serialize and send a message
    ///
    /// Bytes the transport does not accept synchronously are parked in the
    /// save queue and every flow is suspended until it drains. A transport
    /// write error closes the tunnel. Returns false only when the message
    /// failed to serialize.
    pub fn write_message(&self, message: &Message) -> bool {
        let frame = match encode_frame(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(tunnel = self.id, "failed to encode message: {}", e);
                return false;
            }
        };
        self.send_frame(frame);
        true
    }

    fn send_frame(&self, frame: Bytes) {
        enum AfterWrite {
            Done,
            WakeFlusher,
            Fatal(std::io::Error),
        }

        let after = {
            let mut state = self.state.lock();
            let Some(sink) = state.sink.as_mut() else {
                debug!(tunnel = self.id, "dropping frame: transport not attached");
                return;
            };
            match sink.write_or_queue(frame) {
                Ok(WriteOutcome::Complete) => AfterWrite::Done,
                Ok(WriteOutcome::Queued) => {
                    if !state.queue_suspended {
                        state.queue_suspended = true;
                        for connection in state.connections.values() {
                            connection.set_transport_suspended(true);
                        }
                    }
                    AfterWrite::WakeFlusher
                }
                Err(e) => AfterWrite::Fatal(e),
            }
        };

        match after {
            AfterWrite::Done => {}
            AfterWrite::WakeFlusher => self.writable.notify_one(),
            AfterWrite::Fatal(e) => {
                warn!(tunnel = self.id, "transport write failed: {}", e);
                self.close();
            }
        }
    }

    /// Called by the flusher once the save queue drained
    pub(crate) fn queue_drained(&self) {
        let mut state = self.state.lock();
        if state.queue_suspended && state.sink.as_ref().is_none_or(QueuedWriter::is_idle) {
            state.queue_suspended = false;
            for connection in state.connections.values() {
                connection.set_transport_suspended(false);
            }
        }
    }

    /// Apply a close direction to a flow's state machine
    ///
    /// On the transition into fully-closed: an exclusive flow closes the
    /// tunnel, any other flow is removed from the registry and its
    /// back-reference cleared (exactly once). `None` is a no-op.
    pub fn close_connection(&self, connection: &Arc<Connection>, direction: CloseDirection) {
        if direction == CloseDirection::None {
            return;
        }
        let became_fully_closed = connection.advance_close(direction);
        connection.deliver(FlowEvent::Close(direction));
        if became_fully_closed {
            self.finish_connection(connection);
        }
    }

    /// Locally abort a flow: no close message, queued output dropped
    pub fn abort_connection(&self, connection: &Arc<Connection>) {
        let became_fully_closed = connection.advance_close(CloseDirection::All);
        connection.abort();
        if became_fully_closed {
            self.finish_connection(connection);
        }
    }

    fn finish_connection(&self, connection: &Arc<Connection>) {
        if connection.is_exclusive() {
            debug!(
                tunnel = self.id,
                flow = connection.identifier(),
                "exclusive flow closed, closing tunnel"
            );
            self.close();
        } else {
            self.state
                .lock()
                .connections
                .remove(&connection.identifier());
            connection.clear_tunnel();
        }
    }

    /// Close the tunnel
    ///
    /// Aborts every member flow (dropping their queued output), clears the
    /// registry and the tunnel save queue, unregisters the tunnel from the
    /// process-wide list, and fires the delegate's closed callback exactly
    /// once. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(tunnel = self.id, "closing tunnel");
        let connections = {
            let mut state = self.state.lock();
            state.sink = None;
            state.queue_suspended = false;
            std::mem::take(&mut state.connections)
        };
        for connection in connections.values() {
            connection.abort();
        }
        registry::unregister(self.id);
        let _ = self.shutdown.send(true);
        self.writable.notify_one();
        self.delegate.tunnel_closed();
    }

    pub(crate) fn role(&self) -> &dyn RoleHandler {
        self.role.as_ref()
    }

    /// The lifecycle delegate
    #[must_use]
    pub fn delegate(&self) -> &dyn TunnelDelegate {
        self.delegate.as_ref()
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn writable_notify(&self) -> &Notify {
        &self.writable
    }

    pub(crate) fn poll_drain_sink(
        &self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let mut state = self.state.lock();
        match state.sink.as_mut() {
            Some(sink) => sink.poll_drain(cx),
            None => std::task::Poll::Ready(Ok(())),
        }
    }

    /// Handle one decoded inbound message
    pub async fn handle_message(self: &Arc<Self>, message: Message) {
        dispatch::dispatch(self, message).await;
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        // a tunnel dropped without close() must still leave the registry
        if !self.closed.load(Ordering::SeqCst) {
            registry::unregister(self.id);
        }
    }
}
