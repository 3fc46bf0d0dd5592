//! End-to-end data-path tests
//!
//! A real client and server engine joined by an in-memory transport, with
//! real loopback sockets behind the server relays.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpListener, UdpSocket};

use simple_tunnel::{
    CloseDirection, FlowEvent, TunnelClient, TunnelConfiguration, TunnelServer,
};

use super::{recv_event, tunnel_pair, ChannelPacketFlow, RecordingDelegate};

async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

fn plain_server() -> TunnelServer {
    TunnelServer::new(TunnelConfiguration::default()).unwrap()
}

#[tokio::test]
async fn e2e_tcp_echo_through_tunnel() {
    let echo = spawn_echo_server().await;
    let server = plain_server();
    let (client, _server_tunnel) = tunnel_pair(&server);

    let mut flow = client
        .open_stream(&echo.ip().to_string(), echo.port())
        .await
        .expect("open failed");

    assert!(flow.send(Bytes::from_static(b"hello")));

    let mut received = Vec::new();
    while received.len() < 5 {
        match recv_event(&mut flow).await {
            FlowEvent::Data(data) => received.extend_from_slice(&data),
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(received, b"hello");
}

#[tokio::test]
async fn e2e_tcp_per_flow_ordering() {
    let echo = spawn_echo_server().await;
    let server = plain_server();
    let (client, _server_tunnel) = tunnel_pair(&server);

    let mut flow = client
        .open_stream(&echo.ip().to_string(), echo.port())
        .await
        .unwrap();

    for chunk in [&b"one "[..], b"two ", b"three"] {
        assert!(flow.send(Bytes::copy_from_slice(chunk)));
    }

    let expected = b"one two three";
    let mut received = Vec::new();
    while received.len() < expected.len() {
        match recv_event(&mut flow).await {
            FlowEvent::Data(data) => received.extend_from_slice(&data),
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(received, expected);
}

#[tokio::test]
async fn e2e_tcp_remote_eof_half_closes() {
    let echo = spawn_echo_server().await;
    let server = plain_server();
    let (client, _server_tunnel) = tunnel_pair(&server);

    let mut flow = client
        .open_stream(&echo.ip().to_string(), echo.port())
        .await
        .unwrap();

    assert!(flow.send(Bytes::from_static(b"bye")));
    // finish our sending side; the echo server will then hit EOF and stop
    flow.close(CloseDirection::Write);
    assert!(!flow.send(Bytes::from_static(b"late")));

    let mut received = Vec::new();
    loop {
        match recv_event(&mut flow).await {
            FlowEvent::Data(data) => received.extend_from_slice(&data),
            FlowEvent::Close(direction) => {
                // the server reports remote EOF as a write-side close
                assert!(direction.closes_write());
                break;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(received, b"bye");
}

#[tokio::test]
async fn e2e_tcp_open_refused() {
    // bind a listener, learn its port, then drop it so connects are refused
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let server = plain_server();
    let (client, _server_tunnel) = tunnel_pair(&server);

    let result = client
        .open_stream(&addr.ip().to_string(), addr.port())
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn e2e_udp_round_trip() {
    let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = remote.local_addr().unwrap();

    let server = plain_server();
    let (client, _server_tunnel) = tunnel_pair(&server);

    let mut flow = client.open_datagram().await.expect("open failed");

    assert!(flow.send_to(
        Bytes::from_static(b"\x01\x02"),
        &remote_addr.ip().to_string(),
        remote_addr.port(),
    ));

    let mut buf = [0u8; 64];
    let (n, relay_addr) = tokio::time::timeout(super::TIMEOUT, remote.recv_from(&mut buf))
        .await
        .expect("no datagram reached the remote")
        .unwrap();
    assert_eq!(&buf[..n], b"\x01\x02");

    remote.send_to(b"\xff", relay_addr).await.unwrap();
    match recv_event(&mut flow).await {
        FlowEvent::Datagram { data, host, port } => {
            assert_eq!(data.as_ref(), b"\xff");
            assert_eq!(host, remote_addr.ip().to_string());
            assert_eq!(port, remote_addr.port());
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn e2e_fetch_configuration_strips_pool() {
    let config = simple_tunnel::load_config_str(
        r#"{
            "IPv4": {
                "Address": "10.0.0.254",
                "Netmask": "255.255.0.0",
                "Pool": { "StartAddress": "10.0.0.1", "EndAddress": "10.0.0.100" }
            },
            "DNS": { "Servers": ["10.0.0.53"], "SearchDomains": ["example.com"] }
        }"#,
    )
    .unwrap();
    let server = TunnelServer::new(config).unwrap();

    let delegate = Arc::new(RecordingDelegate::default());
    let (client_end, server_end) = tokio::io::duplex(65_536);
    let _server_tunnel = server.serve(server_end, Box::new(simple_tunnel::NoDelegate));
    let client = TunnelClient::new(client_end, Box::new(Arc::clone(&delegate)));

    assert!(client.fetch_configuration());

    super::wait_for(|| !delegate.configurations.lock().is_empty()).await;
    let received = delegate.configurations.lock().pop().unwrap();
    let ipv4 = received.ipv4.expect("IPv4 section missing");
    assert!(ipv4.pool.is_none(), "clients must never see the pool");
    assert_eq!(ipv4.address.unwrap().to_string(), "10.0.0.254");
    assert_eq!(received.dns.unwrap().servers, vec!["10.0.0.53"]);
}

#[tokio::test]
async fn e2e_ip_flow_moves_packets_both_ways() {
    let config = simple_tunnel::load_config_str(
        r#"{ "IPv4": { "Pool": { "StartAddress": "10.0.0.1", "EndAddress": "10.0.0.8" } } }"#,
    )
    .unwrap();
    let (packet_flow, inject, mut written) = ChannelPacketFlow::new();
    let server = TunnelServer::new(config).unwrap().with_packet_flow(packet_flow);
    let (client, _server_tunnel) = tunnel_pair(&server);

    let (mut flow, settings) = client.open_packet_flow().await.expect("open failed");
    let settings = settings.expect("no settings delivered");
    assert_eq!(
        settings.ipv4.unwrap().address.unwrap().to_string(),
        "10.0.0.1"
    );

    // client → server → host stack
    assert!(flow.send_packets(vec![Bytes::from_static(b"\x45\x00\x00\x14")], vec![2]));
    let (packets, protocols) = tokio::time::timeout(super::TIMEOUT, written.recv())
        .await
        .expect("no packets reached the host side")
        .unwrap();
    assert_eq!(packets[0].as_ref(), b"\x45\x00\x00\x14");
    assert_eq!(protocols, vec![2]);

    // host stack → server → client
    inject
        .send((vec![Bytes::from_static(b"\x60\x00\x00\x00")], vec![30]))
        .unwrap();
    match recv_event(&mut flow).await {
        FlowEvent::Packets { packets, protocols } => {
            assert_eq!(packets[0].as_ref(), b"\x60\x00\x00\x00");
            assert_eq!(protocols, vec![30]);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}
