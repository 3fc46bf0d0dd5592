//! Message dispatch
//!
//! Routes each decoded message either to the flow named by its
//! `identifier` or to the tunnel's role handler. The routing rules are
//! identical on both endpoints; only the role handler differs.

use std::sync::Arc;

use tracing::{debug, warn};

use super::connection::FlowEvent;
use super::Tunnel;
use crate::message::{CloseDirection, Command, Message};

pub(crate) async fn dispatch(tunnel: &Arc<Tunnel>, message: Message) {
    let command = match message.command() {
        Ok(command) => command,
        Err(e) => {
            // the wire decoder already rejects these; messages built
            // in-process are merely dropped
            warn!(tunnel = tunnel.id(), "discarding message: {}", e);
            return;
        }
    };

    // open and dns never resolve a connection
    if matches!(command, Command::Open | Command::Dns) {
        tunnel
            .role()
            .handle_unrouted(tunnel, command, message, None)
            .await;
        return;
    }

    let connection = message
        .identifier()
        .and_then(|identifier| tunnel.connection(identifier));
    let Some(connection) = connection else {
        // the role handler may still act (e.g. fetch-configuration)
        tunnel
            .role()
            .handle_unrouted(tunnel, command, message, None)
            .await;
        return;
    };

    match command {
        Command::Data => {
            let Some(data) = message.data() else {
                warn!(
                    tunnel = tunnel.id(),
                    flow = connection.identifier(),
                    "data message without payload"
                );
                return;
            };
            match (message.host(), message.port()) {
                (Some(host), Some(port)) => connection.deliver(FlowEvent::Datagram {
                    data,
                    host: host.to_owned(),
                    port,
                }),
                _ => connection.deliver(FlowEvent::Data(data)),
            }
        }
        Command::Suspend => connection.set_peer_suspended(true),
        Command::Resume => connection.set_peer_suspended(false),
        Command::Close => {
            // missing or invalid close-type means close everything
            let direction = message.close_type().unwrap_or(CloseDirection::All);
            debug!(
                tunnel = tunnel.id(),
                flow = connection.identifier(),
                ?direction,
                "peer closed flow"
            );
            tunnel.close_connection(&connection, direction);
        }
        Command::Packets => {
            let (Some(packets), Some(protocols)) = (message.packets(), message.protocols())
            else {
                warn!(
                    tunnel = tunnel.id(),
                    flow = connection.identifier(),
                    "packets message without packet or protocol list"
                );
                return;
            };
            if packets.len() != protocols.len() {
                warn!(
                    tunnel = tunnel.id(),
                    flow = connection.identifier(),
                    packets = packets.len(),
                    protocols = protocols.len(),
                    "dropping mismatched packet batch"
                );
                return;
            }
            connection.deliver(FlowEvent::Packets { packets, protocols });
        }
        _ => {
            tunnel
                .role()
                .handle_unrouted(tunnel, command, message, Some(connection))
                .await;
        }
    }
}
