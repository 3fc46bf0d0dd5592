//! Flow lifecycle tests: half-close collapse and address assignment

use std::sync::Arc;

use tokio::net::TcpListener;

use simple_tunnel::{CloseDirection, TunnelConfiguration, TunnelServer};

use super::{tunnel_pair, wait_for, IdlePacketFlow};

#[tokio::test]
async fn half_close_collapses_and_removes_connection() {
    // a remote that accepts and holds the socket open
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let server = TunnelServer::new(TunnelConfiguration::default()).unwrap();
    let (client, server_tunnel) = tunnel_pair(&server);

    let flow = client
        .open_stream(&addr.ip().to_string(), addr.port())
        .await
        .unwrap();
    let identifier = flow.identifier();

    let connection = server_tunnel
        .connection(identifier)
        .expect("flow not registered on the server");
    assert_eq!(connection.close_direction(), CloseDirection::None);

    // read-close: the flow stays registered, half closed
    flow.close(CloseDirection::Read);
    wait_for(|| connection.close_direction() == CloseDirection::Read).await;
    assert!(server_tunnel.connection(identifier).is_some());

    // a different direction collapses to fully closed and removes it
    flow.close(CloseDirection::Write);
    wait_for(|| server_tunnel.connection(identifier).is_none()).await;
    assert_eq!(connection.close_direction(), CloseDirection::All);
    assert!(connection.tunnel().is_none());

    // the tunnel itself survives the flow
    assert!(!server_tunnel.is_closed());
}

fn pooled_server(start: &str, end: &str) -> TunnelServer {
    let config = simple_tunnel::load_config_str(&format!(
        r#"{{ "IPv4": {{ "Pool": {{ "StartAddress": "{start}", "EndAddress": "{end}" }} }} }}"#,
    ))
    .unwrap();
    TunnelServer::new(config)
        .unwrap()
        .with_packet_flow(Arc::new(IdlePacketFlow))
}

#[tokio::test]
async fn address_assignment_exhaustion_and_reuse() {
    let server = pooled_server("10.0.0.1", "10.0.0.3");
    let (client, _server_tunnel) = tunnel_pair(&server);

    let mut flows = Vec::new();
    for expected in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
        let (flow, settings) = client.open_packet_flow().await.expect("open failed");
        let address = settings
            .expect("no settings delivered")
            .ipv4
            .expect("no IPv4 section")
            .address
            .expect("no address assigned");
        assert_eq!(address.to_string(), expected);
        flows.push(flow);
    }

    // the pool is exhausted: a fourth open fails with internal-error
    let error = client.open_packet_flow().await.unwrap_err();
    assert!(matches!(
        error,
        simple_tunnel::TunnelError::Relay(simple_tunnel::RelayError::Internal(_))
    ));

    // closing the first flow returns its address
    let first = flows.remove(0);
    first.close(CloseDirection::All);
    let pool = Arc::clone(server.pool().unwrap());
    wait_for(|| pool.allocated() == 2).await;

    let (_flow, settings) = client.open_packet_flow().await.expect("reopen failed");
    assert_eq!(
        settings.unwrap().ipv4.unwrap().address.unwrap().to_string(),
        "10.0.0.1"
    );
}

#[tokio::test]
async fn closing_the_tunnel_releases_every_lease() {
    let server = pooled_server("10.0.0.1", "10.0.0.8");
    let (client, server_tunnel) = tunnel_pair(&server);

    for _ in 0..3 {
        client.open_packet_flow().await.expect("open failed");
    }
    let pool = Arc::clone(server.pool().unwrap());
    assert_eq!(pool.allocated(), 3);

    server_tunnel.close();
    wait_for(|| pool.allocated() == 0).await;
}
