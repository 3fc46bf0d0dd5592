//! UDP flow relay
//!
//! Bridges one app-layer UDP flow to arbitrary remote endpoints. The
//! socket is created (and `openResult(success)` sent) immediately; every
//! data message from the peer must carry `host` and `port`, and every
//! inbound datagram is sent back tagged with its source endpoint. There is
//! no half-close: any close terminates the relay.

use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info_span, warn, Instrument};

use crate::message::{CloseDirection, Message, ResultCode};
use crate::tunnel::{Connection, FlowEvent, Tunnel};

const MAX_DATAGRAM: usize = 65_535;

/// Spawn the relay for a freshly opened UDP flow
pub(crate) fn spawn(
    tunnel: Arc<Tunnel>,
    connection: Arc<Connection>,
    events: UnboundedReceiver<FlowEvent>,
) {
    let span = info_span!(
        "udp_relay",
        tunnel = tunnel.id(),
        flow = connection.identifier(),
    );
    tokio::spawn(run(tunnel, connection, events).instrument(span));
}

async fn run(
    tunnel: Arc<Tunnel>,
    connection: Arc<Connection>,
    mut events: UnboundedReceiver<FlowEvent>,
) {
    let identifier = connection.identifier();
    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("failed to create UDP socket: {}", e);
            tunnel.write_message(&Message::open_result(identifier, ResultCode::Internal));
            tunnel.abort_connection(&connection);
            return;
        }
    };

    tunnel.write_message(&Message::open_result(identifier, ResultCode::Success));
    debug!("flow open");

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            event = events.recv() => match event {
                None => return,
                Some(FlowEvent::Datagram { data, host, port }) => {
                    if let Err(e) = socket.send_to(&data, (host.as_str(), port)).await {
                        warn!("send to {}:{} failed: {}", host, port, e);
                    }
                }
                Some(FlowEvent::Data(_)) => {
                    warn!("dropping datagram without an endpoint");
                }
                Some(FlowEvent::Close(_)) => {
                    debug!("flow closed");
                    tunnel.abort_connection(&connection);
                    return;
                }
                Some(FlowEvent::Packets { .. } | FlowEvent::OpenResult { .. }) => {}
            },
            received = async {
                connection.readable().await;
                socket.recv_from(&mut buf).await
            } => match received {
                Ok((n, from)) => {
                    tunnel.write_message(&Message::datagram_message(
                        identifier,
                        Bytes::copy_from_slice(&buf[..n]),
                        &from.ip().to_string(),
                        from.port(),
                    ));
                }
                Err(e) => {
                    warn!("recv failed: {}", e);
                    tunnel.write_message(&Message::close(identifier, CloseDirection::All));
                    tunnel.abort_connection(&connection);
                    return;
                }
            },
        }
    }
}
