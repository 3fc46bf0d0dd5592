//! Tunnel server
//!
//! Accepts tunnel transports, answers `open` requests by spawning the
//! matching flow relay, and serves the configuration to clients (minus
//! the address pool, which clients never see).
//!
//! # Modules
//!
//! - [`pool`]: the client address pool
//! - [`tcp_relay`] / [`udp_relay`] / [`ip_relay`]: the three flow relays

pub mod pool;

mod ip_relay;
mod tcp_relay;
mod udp_relay;

pub use pool::AddressPool;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::config::TunnelConfiguration;
use crate::error::ConfigError;
use crate::message::{AppFlowKind, Command, Message, ResultCode, TunnelLayer};
use crate::packet_flow::PacketFlow;
use crate::tunnel::{Connection, NoDelegate, RoleHandler, Tunnel, TunnelDelegate};

/// The server side of the tunnel protocol
pub struct TunnelServer {
    config: Arc<TunnelConfiguration>,
    pool: Option<Arc<AddressPool>>,
    packet_flow: Option<Arc<dyn PacketFlow>>,
}

impl TunnelServer {
    /// Create a server from a validated configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the configured address pool is invalid.
    pub fn new(config: TunnelConfiguration) -> Result<Self, ConfigError> {
        config.validate()?;
        let pool = config
            .ipv4
            .as_ref()
            .and_then(|ipv4| ipv4.pool.as_ref())
            .map(|range| AddressPool::new(range.start_address, range.end_address))
            .transpose()?
            .map(Arc::new);
        Ok(Self {
            config: Arc::new(config),
            pool,
            packet_flow: None,
        })
    }

    /// Attach the host packet interface used by IP flows
    ///
    /// Without one, IP-flow opens are answered with `internal-error`.
    #[must_use]
    pub fn with_packet_flow(mut self, packet_flow: Arc<dyn PacketFlow>) -> Self {
        self.packet_flow = Some(packet_flow);
        self
    }

    /// The server's address pool, when one is configured
    #[must_use]
    pub fn pool(&self) -> Option<&Arc<AddressPool>> {
        self.pool.as_ref()
    }

    /// Serve one tunnel over an established transport
    pub fn serve<S>(&self, stream: S, delegate: Box<dyn TunnelDelegate>) -> Arc<Tunnel>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let role = ServerRole {
            config: Arc::clone(&self.config),
            pool: self.pool.clone(),
            packet_flow: self.packet_flow.clone(),
        };
        let tunnel = Tunnel::new(Box::new(role), delegate);
        tunnel.start(stream);
        tunnel
    }

    /// Accept tunnels from a listener until it fails
    ///
    /// # Errors
    ///
    /// Returns the listener's error.
    pub async fn run(&self, listener: TcpListener) -> std::io::Result<()> {
        info!("Listening on {}", listener.local_addr()?);
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    info!("Tunnel transport accepted from {}", peer);
                    self.serve(stream, Box::new(NoDelegate));
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    return Err(e);
                }
            }
        }
    }
}

/// Server half of the dispatch asymmetry
struct ServerRole {
    config: Arc<TunnelConfiguration>,
    pool: Option<Arc<AddressPool>>,
    packet_flow: Option<Arc<dyn PacketFlow>>,
}

#[async_trait]
impl RoleHandler for ServerRole {
    async fn handle_unrouted(
        &self,
        tunnel: &Arc<Tunnel>,
        command: Command,
        message: Message,
        _connection: Option<Arc<Connection>>,
    ) {
        match command {
            Command::Open => self.handle_open(tunnel, &message),
            Command::FetchConfiguration => {
                debug!(tunnel = tunnel.id(), "serving configuration");
                let view = self.config.client_view(None);
                tunnel.write_message(&Message::configuration_response(view.to_value()));
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

impl ServerRole {
    fn handle_open(&self, tunnel: &Arc<Tunnel>, message: &Message) {
        let Some(identifier) = message.identifier() else {
            warn!(tunnel = tunnel.id(), "open without an identifier");
            return;
        };
        if tunnel.connection(identifier).is_some() {
            warn!(
                tunnel = tunnel.id(),
                flow = identifier,
                "open for an identifier already in use"
            );
            tunnel.write_message(&Message::open_result(
                identifier,
                ResultCode::InvalidParameter,
            ));
            return;
        }

        let layer = message.tunnel_layer().unwrap_or_default();
        match layer {
            TunnelLayer::App => match message.app_flow_kind() {
                Some(AppFlowKind::Tcp) => {
                    let (Some(host), Some(port)) = (message.host(), message.port()) else {
                        warn!(
                            tunnel = tunnel.id(),
                            flow = identifier,
                            "stream open without host and port"
                        );
                        tunnel.write_message(&Message::open_result(
                            identifier,
                            ResultCode::InvalidParameter,
                        ));
                        return;
                    };
                    let (connection, events) = Connection::channel(identifier, false);
                    tunnel.insert_connection(&connection);
                    tcp_relay::spawn(
                        Arc::clone(tunnel),
                        connection,
                        events,
                        host.to_owned(),
                        port,
                    );
                }
                Some(AppFlowKind::Udp) => {
                    let (connection, events) = Connection::channel(identifier, false);
                    tunnel.insert_connection(&connection);
                    udp_relay::spawn(Arc::clone(tunnel), connection, events);
                }
                None => {
                    warn!(
                        tunnel = tunnel.id(),
                        flow = identifier,
                        "app-layer open without a valid flow type"
                    );
                    tunnel.write_message(&Message::open_result(
                        identifier,
                        ResultCode::InvalidParameter,
                    ));
                }
            },
            TunnelLayer::Ip => {
                let (Some(pool), Some(packet_flow)) = (&self.pool, &self.packet_flow) else {
                    warn!(
                        tunnel = tunnel.id(),
                        flow = identifier,
                        "IP flow open without a pool or packet interface"
                    );
                    tunnel.write_message(&Message::open_result(
                        identifier,
                        ResultCode::Internal,
                    ));
                    return;
                };
                let (connection, events) = Connection::channel(identifier, false);
                tunnel.insert_connection(&connection);
                ip_relay::spawn(
                    Arc::clone(tunnel),
                    connection,
                    events,
                    Arc::clone(pool),
                    Arc::clone(packet_flow),
                    Arc::clone(&self.config),
                );
            }
        }
    }
}
