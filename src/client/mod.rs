//! Tunnel client
//!
//! [`TunnelClient`] drives the client side of the protocol: it opens flows
//! over an established transport, completes them against the server's
//! `openResult`, and surfaces pushed configuration through the tunnel
//! delegate. [`ClientFlow`] is the per-flow handle; [`run_packet_flow`]
//! pumps an IP flow against a platform packet source.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, warn};

use crate::config::TunnelConfiguration;
use crate::discovery;
use crate::error::{ConnectionError, RelayError, TunnelError};
use crate::message::{CloseDirection, Command, Message, ResultCode};
use crate::packet_flow::{send_packet_batches, PacketFlow};
use crate::tunnel::{Connection, FlowEvent, RoleHandler, Tunnel, TunnelDelegate};

/// The client side of the tunnel protocol
pub struct TunnelClient {
    tunnel: Arc<Tunnel>,
    next_identifier: AtomicU32,
}

impl TunnelClient {
    /// Run the client protocol over an established transport
    pub fn new<S>(stream: S, delegate: Box<dyn TunnelDelegate>) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    {
        let tunnel = Tunnel::new(Box::new(ClientRole), delegate);
        tunnel.start(stream);
        Self {
            tunnel,
            next_identifier: AtomicU32::new(1),
        }
    }

    /// Connect to a server given as a colon-separated `host:port` literal
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for a malformed address and `Io` when the
    /// TCP connect fails.
    pub async fn connect(
        server: &str,
        delegate: Box<dyn TunnelDelegate>,
    ) -> Result<Self, TunnelError> {
        let (host, port) = discovery::parse_server_address(server)?;
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        Ok(Self::new(stream, delegate))
    }

    /// The underlying tunnel
    #[must_use]
    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    /// Close the tunnel and every flow on it
    pub fn close(&self) {
        self.tunnel.close();
    }

    /// Open a TCP stream flow to `host:port`
    ///
    /// # Errors
    ///
    /// Returns `RelayError` when the server answers with a failure code
    /// and `ConnectionError` when the tunnel closes first.
    pub async fn open_stream(&self, host: &str, port: u16) -> Result<ClientFlow, TunnelError> {
        let identifier = self.next_identifier();
        let (flow, _) = self
            .open(
                identifier,
                Message::open_stream(identifier, host, port),
                host,
                port,
            )
            .await?;
        Ok(flow)
    }

    /// Open a UDP datagram flow
    ///
    /// # Errors
    ///
    /// As for [`open_stream`](Self::open_stream).
    pub async fn open_datagram(&self) -> Result<ClientFlow, TunnelError> {
        let identifier = self.next_identifier();
        let (flow, _) = self
            .open(identifier, Message::open_datagram(identifier), "", 0)
            .await?;
        Ok(flow)
    }

    /// Open an IP packet flow
    ///
    /// On success also returns the tunnel network settings the server
    /// attached, including the assigned address.
    ///
    /// # Errors
    ///
    /// As for [`open_stream`](Self::open_stream).
    pub async fn open_packet_flow(
        &self,
    ) -> Result<(ClientFlow, Option<TunnelConfiguration>), TunnelError> {
        let identifier = self.next_identifier();
        self.open(identifier, Message::open_packets(identifier), "", 0)
            .await
    }

    /// Ask the server for the tunnel configuration
    ///
    /// The response arrives through the delegate's
    /// `configuration_received`.
    pub fn fetch_configuration(&self) -> bool {
        self.tunnel.write_message(&Message::fetch_configuration())
    }

    fn next_identifier(&self) -> u32 {
        self.next_identifier.fetch_add(1, Ordering::Relaxed)
    }

    async fn open(
        &self,
        identifier: u32,
        message: Message,
        host: &str,
        port: u16,
    ) -> Result<(ClientFlow, Option<TunnelConfiguration>), TunnelError> {
        let (connection, mut events) = Connection::channel(identifier, false);
        if !self.tunnel.insert_connection(&connection) {
            return Err(ConnectionError::Closed { identifier }.into());
        }
        if !self.tunnel.write_message(&message) {
            self.tunnel.abort_connection(&connection);
            return Err(RelayError::internal("failed to encode open message").into());
        }

        loop {
            match events.recv().await {
                None => return Err(ConnectionError::Closed { identifier }.into()),
                Some(FlowEvent::OpenResult {
                    code: ResultCode::Success,
                    configuration,
                }) => {
                    debug!(flow = identifier, "flow open");
                    return Ok((
                        ClientFlow {
                            tunnel: Arc::clone(&self.tunnel),
                            connection,
                            events,
                        },
                        configuration,
                    ));
                }
                Some(FlowEvent::OpenResult { code, .. }) => {
                    debug!(flow = identifier, "open failed: {}", code);
                    self.tunnel.abort_connection(&connection);
                    return Err(RelayError::from_result_code(code, host, port).into());
                }
                Some(FlowEvent::Close(_)) => {
                    return Err(ConnectionError::Closed { identifier }.into());
                }
                Some(event) => {
                    warn!(flow = identifier, "event before open result: {:?}", event);
                }
            }
        }
    }
}

/// Handle to one open flow
pub struct ClientFlow {
    tunnel: Arc<Tunnel>,
    connection: Arc<Connection>,
    events: UnboundedReceiver<FlowEvent>,
}

impl std::fmt::Debug for ClientFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientFlow")
            .field("identifier", &self.identifier())
            .finish()
    }
}

impl ClientFlow {
    /// The flow identifier
    #[must_use]
    pub fn identifier(&self) -> u32 {
        self.connection.identifier()
    }

    /// The flow's connection state
    #[must_use]
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Send stream bytes; false once the write side is closed
    pub fn send(&self, data: Bytes) -> bool {
        if self.connection.closed_for_write() {
            return false;
        }
        self.tunnel
            .write_message(&Message::data_message(self.identifier(), data))
    }

    /// Send a datagram to `host:port`; false once the write side is closed
    pub fn send_to(&self, data: Bytes, host: &str, port: u16) -> bool {
        if self.connection.closed_for_write() {
            return false;
        }
        self.tunnel
            .write_message(&Message::datagram_message(self.identifier(), data, host, port))
    }

    /// Send raw IP packets, applying the wire batch caps
    pub fn send_packets(&self, packets: Vec<Bytes>, protocols: Vec<i64>) -> bool {
        if self.connection.closed_for_write() || packets.len() != protocols.len() {
            return false;
        }
        send_packet_batches(&self.tunnel, self.identifier(), packets, protocols);
        true
    }

    /// Receive the next flow event
    ///
    /// Returns `None` once the flow is gone and drained.
    pub async fn recv(&mut self) -> Option<FlowEvent> {
        self.events.recv().await
    }

    /// Close the flow in the given direction
    ///
    /// Sends the close to the peer and applies the same direction to the
    /// local state machine.
    pub fn close(&self, direction: CloseDirection) {
        self.tunnel
            .write_message(&Message::close(self.identifier(), direction));
        self.tunnel.close_connection(&self.connection, direction);
    }
}

/// Pump an IP flow against a platform packet source until either side
/// closes
///
/// Packets arriving from the tunnel are written to the source; batches
/// read from the source are sent into the tunnel under the wire batch
/// caps.
pub async fn run_packet_flow(flow: ClientFlow, source: Arc<dyn PacketFlow>) {
    let ClientFlow {
        tunnel,
        connection,
        mut events,
    } = flow;
    let identifier = connection.identifier();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                None | Some(FlowEvent::Close(_)) => {
                    debug!(flow = identifier, "packet flow finished");
                    return;
                }
                Some(FlowEvent::Packets { packets, protocols }) => {
                    if let Err(e) = source.write_packets(packets, protocols).await {
                        warn!(flow = identifier, "packet sink failed: {}", e);
                        tunnel.write_message(&Message::close(identifier, CloseDirection::All));
                        tunnel.abort_connection(&connection);
                        return;
                    }
                }
                Some(_) => {}
            },
            captured = async {
                connection.readable().await;
                source.read_packets().await
            } => match captured {
                Ok((packets, protocols)) => {
                    if packets.len() == protocols.len() {
                        send_packet_batches(&tunnel, identifier, packets, protocols);
                    } else {
                        warn!(flow = identifier, "dropping mismatched batch from the packet source");
                    }
                }
                Err(e) => {
                    warn!(flow = identifier, "packet source failed: {}", e);
                    tunnel.write_message(&Message::close(identifier, CloseDirection::All));
                    tunnel.abort_connection(&connection);
                    return;
                }
            },
        }
    }
}

/// Client half of the dispatch asymmetry
struct ClientRole;

#[async_trait]
impl RoleHandler for ClientRole {
    async fn handle_unrouted(
        &self,
        tunnel: &Arc<Tunnel>,
        command: Command,
        message: Message,
        connection: Option<Arc<Connection>>,
    ) {
        match command {
            Command::OpenResult => {
                let Some(connection) = connection else {
                    warn!(tunnel = tunnel.id(), "open result for an unknown flow");
                    return;
                };
                // missing or invalid result codes read as internal errors
                let code = message.result_code().unwrap_or(ResultCode::Internal);
                let configuration = message.configuration().and_then(|entries| {
                    match TunnelConfiguration::from_value(entries) {
                        Ok(configuration) => Some(configuration),
                        Err(e) => {
                            warn!(tunnel = tunnel.id(), "bad configuration in open result: {}", e);
                            None
                        }
                    }
                });
                connection.deliver(FlowEvent::OpenResult {
                    code,
                    configuration,
                });
            }
            Command::FetchConfiguration => {
                let Some(entries) = message.configuration() else {
                    debug!(tunnel = tunnel.id(), "configuration response without payload");
                    return;
                };
                match TunnelConfiguration::from_value(entries) {
                    Ok(configuration) => {
                        tunnel.delegate().configuration_received(configuration);
                    }
                    Err(e) => {
                        warn!(tunnel = tunnel.id(), "bad configuration payload: {}", e);
                    }
                }
            }
            Command::Dns => {
                debug!(tunnel = tunnel.id(), "dns sub-protocol not implemented");
            }
            other => {
                debug!(tunnel = tunnel.id(), "ignoring {} message", other);
            }
        }
    }
}
