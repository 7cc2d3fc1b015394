#![allow(clippy::unwrap_used)]

use bytes::Bytes;
use cnp_core::NodeId;
use cnp_network::{TcpTransport, Transport, TransportConfig, TransportEvent};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

#[tokio::test]
async fn test_frames_cross_loopback_in_order() {
    let (a, _a_events) = TcpTransport::bind(loopback(), TransportConfig::default())
        .await
        .unwrap();
    let (b, mut b_events) = TcpTransport::bind(loopback(), TransportConfig::default())
        .await
        .unwrap();

    let to_b = NodeId::new(b.local_addr(), 1);
    a.send(&to_b, Bytes::from_static(b"one"));
    a.send(&to_b, Bytes::from_static(b"two"));

    for expected in [&b"one"[..], &b"two"[..]] {
        let event = timeout(Duration::from_secs(5), b_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, TransportEvent::Frame(Bytes::copy_from_slice(expected)));
    }

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_refused_connection_reports_unreachable() {
    // Grab a free port, then release it so nothing is listening there.
    let probe = tokio::net::TcpListener::bind(loopback()).await.unwrap();
    let dead_addr = probe.local_addr().unwrap();
    drop(probe);

    let config = TransportConfig::default().with_connect_timeout(Duration::from_millis(500));
    let (a, mut a_events) = TcpTransport::bind(loopback(), config).await.unwrap();

    let dead = NodeId::new(dead_addr, 7);
    a.send(&dead, Bytes::from_static(b"anyone?"));

    let event = timeout(Duration::from_secs(5), a_events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, TransportEvent::Unreachable(dead));
    a.shutdown();
}
