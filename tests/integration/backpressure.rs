//! Transport backpressure and framing-failure tests

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::AsyncReadExt;

use simple_tunnel::message::encode_frame;
use simple_tunnel::{Connection, Message, TunnelClient, TunnelConfiguration, TunnelServer};

use super::{wait_for, RecordingDelegate};

#[tokio::test]
async fn backpressure_suspends_all_flows_until_drained() {
    // a transport whose peer is not reading: writes stall after 16 KiB
    let (client_end, mut server_end) = tokio::io::duplex(16_384);
    let client = TunnelClient::new(client_end, Box::new(simple_tunnel::NoDelegate));
    let tunnel = Arc::clone(client.tunnel());

    let (first, _first_events) = Connection::channel(7, false);
    let (second, _second_events) = Connection::channel(8, false);
    assert!(tunnel.insert_connection(&first));
    assert!(tunnel.insert_connection(&second));

    // 64 KiB cannot fit: the remainder lands in the save queue
    let payload = Bytes::from(vec![0x5a; 64 * 1024]);
    assert!(tunnel.write_message(&Message::data_message(7, payload)));

    assert!(tunnel.pending_outbound_bytes() > 0);
    assert!(first.is_suspended(), "flows must suspend while queued");
    assert!(second.is_suspended());

    // a flow registered during the stall joins suspended
    let (late, _late_events) = Connection::channel(9, false);
    assert!(tunnel.insert_connection(&late));
    assert!(late.is_suspended());

    // drain the transport; the flusher must resume every flow
    let reader = tokio::spawn(async move {
        let mut sink = vec![0u8; 16_384];
        loop {
            match server_end.read(&mut sink).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        }
    });

    wait_for(|| tunnel.pending_outbound_bytes() == 0).await;
    wait_for(|| !first.is_suspended() && !second.is_suspended() && !late.is_suspended()).await;

    tunnel.close();
    reader.await.unwrap();
}

#[tokio::test]
async fn oversize_frame_closes_tunnel_once() {
    let server = TunnelServer::new(TunnelConfiguration::default()).unwrap();
    let delegate = Arc::new(RecordingDelegate::default());

    let (client_end, server_end) = tokio::io::duplex(4096);
    let server_tunnel = server.serve(server_end, Box::new(Arc::clone(&delegate)));

    // a frame claiming a megabyte is rejected before any payload is read
    let (mut read_half, mut write_half) = tokio::io::split(client_end);
    tokio::io::AsyncWriteExt::write_all(&mut write_half, &1_000_000u32.to_le_bytes())
        .await
        .unwrap();

    wait_for(|| server_tunnel.is_closed()).await;
    wait_for(|| delegate.closed.load(std::sync::atomic::Ordering::SeqCst) == 1).await;

    // the transport is dead: reads terminate
    let mut buf = [0u8; 16];
    let _ = read_half.read(&mut buf).await;

    // the callback fired exactly once
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(delegate.closed.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn undersized_length_field_closes_tunnel() {
    let server = TunnelServer::new(TunnelConfiguration::default()).unwrap();
    let delegate = Arc::new(RecordingDelegate::default());

    let (client_end, server_end) = tokio::io::duplex(4096);
    let server_tunnel = server.serve(server_end, Box::new(Arc::clone(&delegate)));

    let (_read_half, mut write_half) = tokio::io::split(client_end);
    tokio::io::AsyncWriteExt::write_all(&mut write_half, &3u32.to_le_bytes())
        .await
        .unwrap();

    wait_for(|| server_tunnel.is_closed()).await;
}

#[tokio::test]
async fn transport_eof_closes_tunnel_and_aborts_flows() {
    let server = TunnelServer::new(TunnelConfiguration::default()).unwrap();
    let delegate = Arc::new(RecordingDelegate::default());

    let (client_end, server_end) = tokio::io::duplex(4096);
    let server_tunnel = server.serve(server_end, Box::new(Arc::clone(&delegate)));

    // a well-formed frame keeps the tunnel alive
    let frame = encode_frame(&Message::fetch_configuration()).unwrap();
    let mut client_end = client_end;
    tokio::io::AsyncWriteExt::write_all(&mut client_end, &frame)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!server_tunnel.is_closed());

    // dropping our end is EOF at a frame boundary
    drop(client_end);
    wait_for(|| server_tunnel.is_closed()).await;
    assert_eq!(server_tunnel.connection_count(), 0);
}
