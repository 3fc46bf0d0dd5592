//! IP flow relay
//!
//! Bridges one IP-layer flow to the host's packet interface. Opening the
//! flow leases a virtual IPv4 address from the pool and answers
//! `openResult(success)` carrying the client view of the configuration
//! with the leased address injected. The lease is returned to the pool on
//! every exit path.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info_span, warn, Instrument};

use crate::config::TunnelConfiguration;
use crate::message::{CloseDirection, Message, ResultCode};
use crate::packet_flow::{send_packet_batches, PacketFlow};
use crate::server::pool::AddressPool;
use crate::tunnel::{Connection, FlowEvent, Tunnel};

/// Returns the leased address to the pool when the relay exits
struct AddressLease {
    pool: Arc<AddressPool>,
    address: Ipv4Addr,
}

impl Drop for AddressLease {
    fn drop(&mut self) {
        self.pool.deallocate(self.address);
    }
}

/// Spawn the relay for a freshly opened IP flow
pub(crate) fn spawn(
    tunnel: Arc<Tunnel>,
    connection: Arc<Connection>,
    events: UnboundedReceiver<FlowEvent>,
    pool: Arc<AddressPool>,
    packet_flow: Arc<dyn PacketFlow>,
    config: Arc<TunnelConfiguration>,
) {
    let span = info_span!(
        "ip_relay",
        tunnel = tunnel.id(),
        flow = connection.identifier(),
    );
    tokio::spawn(run(tunnel, connection, events, pool, packet_flow, config).instrument(span));
}

async fn run(
    tunnel: Arc<Tunnel>,
    connection: Arc<Connection>,
    mut events: UnboundedReceiver<FlowEvent>,
    pool: Arc<AddressPool>,
    packet_flow: Arc<dyn PacketFlow>,
    config: Arc<TunnelConfiguration>,
) {
    let identifier = connection.identifier();
    let Some(address) = pool.allocate() else {
        warn!("address pool exhausted");
        tunnel.write_message(&Message::open_result(identifier, ResultCode::Internal));
        tunnel.abort_connection(&connection);
        return;
    };
    let _lease = AddressLease {
        pool: Arc::clone(&pool),
        address,
    };

    let settings = config.client_view(Some(address));
    tunnel.write_message(&Message::open_result_with_configuration(
        identifier,
        ResultCode::Success,
        settings.to_value(),
    ));
    debug!("flow open, assigned {}", address);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                None => return,
                Some(FlowEvent::Packets { packets, protocols }) => {
                    if let Err(e) = packet_flow.write_packets(packets, protocols).await {
                        warn!("packet write failed: {}", e);
                    }
                }
                Some(FlowEvent::Close(_)) => {
                    debug!("flow closed, releasing {}", address);
                    tunnel.abort_connection(&connection);
                    return;
                }
                Some(FlowEvent::Data(_) | FlowEvent::Datagram { .. }) => {
                    warn!("unexpected stream data on an IP flow");
                }
                Some(FlowEvent::OpenResult { .. }) => {}
            },
            captured = async {
                connection.readable().await;
                packet_flow.read_packets().await
            } => match captured {
                Ok((packets, protocols)) => {
                    if packets.len() == protocols.len() {
                        send_packet_batches(&tunnel, identifier, packets, protocols);
                    } else {
                        warn!(
                            packets = packets.len(),
                            protocols = protocols.len(),
                            "dropping mismatched batch from the packet source"
                        );
                    }
                }
                Err(e) => {
                    warn!("packet source failed: {}", e);
                    tunnel.write_message(&Message::close(identifier, CloseDirection::All));
                    tunnel.abort_connection(&connection);
                    return;
                }
            },
        }
    }
}
