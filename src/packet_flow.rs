//! Host packet interface for IP flows
//!
//! IP-layer flows move raw IP packets between the tunnel and the host's
//! packet source: the platform VPN interface on the client, the host IP
//! stack on the server. Both are external collaborators modeled by the
//! [`PacketFlow`] trait, a paired reader/writer of `(packets, protocols)`
//! batches.

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use crate::message::Message;
use crate::tunnel::Tunnel;

/// Maximum packets carried by one `packets` message
pub const MAX_PACKETS_PER_MESSAGE: usize = 32;

/// Maximum size of a single tunneled packet
pub const MAX_PACKET_SIZE: usize = 8192;

/// A paired reader/writer of raw IP packets
///
/// `protocols` carries the address-family number for the packet at the
/// same index; the two lists are always the same length.
#[async_trait]
pub trait PacketFlow: Send + Sync {
    /// Read the next batch of packets from the host
    ///
    /// # Errors
    ///
    /// Returns the underlying source's error; the owning flow is aborted.
    async fn read_packets(&self) -> io::Result<(Vec<Bytes>, Vec<i64>)>;

    /// Write a batch of packets to the host
    ///
    /// # Errors
    ///
    /// Returns the underlying sink's error.
    async fn write_packets(&self, packets: Vec<Bytes>, protocols: Vec<i64>) -> io::Result<()>;
}

/// Send a packet batch over the tunnel for one flow, applying the batch
/// caps: oversized packets are dropped, and at most
/// [`MAX_PACKETS_PER_MESSAGE`] packets travel per message.
pub(crate) fn send_packet_batches(
    tunnel: &Tunnel,
    identifier: u32,
    packets: Vec<Bytes>,
    protocols: Vec<i64>,
) {
    let mut batch_packets = Vec::with_capacity(packets.len().min(MAX_PACKETS_PER_MESSAGE));
    let mut batch_protocols = Vec::with_capacity(batch_packets.capacity());

    for (packet, protocol) in packets.into_iter().zip(protocols) {
        if packet.len() > MAX_PACKET_SIZE {
            warn!(
                flow = identifier,
                size = packet.len(),
                "dropping oversized packet"
            );
            continue;
        }
        batch_packets.push(packet);
        batch_protocols.push(protocol);
        if batch_packets.len() == MAX_PACKETS_PER_MESSAGE {
            tunnel.write_message(&Message::packets_message(
                identifier,
                std::mem::take(&mut batch_packets),
                std::mem::take(&mut batch_protocols),
            ));
        }
    }
    if !batch_packets.is_empty() {
        tunnel.write_message(&Message::packets_message(
            identifier,
            batch_packets,
            batch_protocols,
        ));
    }
}
