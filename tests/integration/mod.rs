//! Integration test modules and shared fixtures

mod backpressure;
mod e2e;
mod lifecycle;

use std::io;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use simple_tunnel::{
    FlowEvent, PacketFlow, TunnelClient, TunnelConfiguration, TunnelDelegate, TunnelServer,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A client/server tunnel pair joined by an in-memory duplex channel
pub fn tunnel_pair(
    server: &TunnelServer,
) -> (TunnelClient, Arc<simple_tunnel::Tunnel>) {
    let (client_end, server_end) = tokio::io::duplex(65_536);
    let server_tunnel = server.serve(server_end, Box::new(simple_tunnel::NoDelegate));
    let client = TunnelClient::new(client_end, Box::new(simple_tunnel::NoDelegate));
    (client, server_tunnel)
}

/// Poll a condition until it holds or the suite timeout expires
pub async fn wait_for(mut predicate: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Receive the next flow event or panic on timeout
pub async fn recv_event(flow: &mut simple_tunnel::ClientFlow) -> FlowEvent {
    tokio::time::timeout(TIMEOUT, flow.recv())
        .await
        .expect("timed out waiting for a flow event")
        .expect("flow event channel closed")
}

/// Delegate recording lifecycle events for assertions
#[derive(Default)]
pub struct RecordingDelegate {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub configurations: Mutex<Vec<TunnelConfiguration>>,
}

impl TunnelDelegate for RecordingDelegate {
    fn tunnel_opened(&self) {
        self.opened.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn tunnel_closed(&self) {
        self.closed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }

    fn configuration_received(&self, configuration: TunnelConfiguration) {
        self.configurations.lock().push(configuration);
    }
}

/// A packet source that never produces and swallows every write
pub struct IdlePacketFlow;

#[async_trait]
impl PacketFlow for IdlePacketFlow {
    async fn read_packets(&self) -> io::Result<(Vec<Bytes>, Vec<i64>)> {
        std::future::pending().await
    }

    async fn write_packets(&self, _packets: Vec<Bytes>, _protocols: Vec<i64>) -> io::Result<()> {
        Ok(())
    }
}

/// A packet source driven by channels, for observing both directions
pub struct ChannelPacketFlow {
    incoming: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<Bytes>, Vec<i64>)>>,
    written: mpsc::UnboundedSender<(Vec<Bytes>, Vec<i64>)>,
}

impl ChannelPacketFlow {
    /// Returns the flow plus a sender injecting host packets and a
    /// receiver observing packets written to the host
    pub fn new() -> (
        Arc<Self>,
        mpsc::UnboundedSender<(Vec<Bytes>, Vec<i64>)>,
        mpsc::UnboundedReceiver<(Vec<Bytes>, Vec<i64>)>,
    ) {
        let (inject, incoming) = mpsc::unbounded_channel();
        let (written, observe) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                incoming: tokio::sync::Mutex::new(incoming),
                written,
            }),
            inject,
            observe,
        )
    }
}

#[async_trait]
impl PacketFlow for ChannelPacketFlow {
    async fn read_packets(&self) -> io::Result<(Vec<Bytes>, Vec<i64>)> {
        match self.incoming.lock().await.recv().await {
            Some(batch) => Ok(batch),
            None => std::future::pending().await,
        }
    }

    async fn write_packets(&self, packets: Vec<Bytes>, protocols: Vec<i64>) -> io::Result<()> {
        let _ = self.written.send((packets, protocols));
        Ok(())
    }
}
