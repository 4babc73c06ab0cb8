//! End-to-end coverage for reload broker connection admission
//! (`spec.md` §8 scenario 6).

use std::net::SocketAddr;
use templar::broker::Broker;
use templar::config::BrokerConfig;

#[tokio::test]
async fn connections_beyond_the_global_cap_are_rejected_and_slots_are_reclaimed() {
    let config = BrokerConfig {
        max_global_connections: 2,
        max_connections_per_remote: 10,
        ..Default::default()
    };
    let broker = Broker::new(config);
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let bound = broker.start(addr).await.unwrap();
    let url = format!("ws://{bound}/");

    let (first, _) = tokio_tungstenite::connect_async(url.as_str()).await.expect("first connection accepted");
    let (second, _) = tokio_tungstenite::connect_async(url.as_str()).await.expect("second connection accepted");

    // Give the broker's accept loop a moment to register both connections.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(broker.connection_count(), 2);

    let third = tokio_tungstenite::connect_async(url.as_str()).await;
    assert!(third.is_err(), "third connection should be rejected over the global cap");

    drop(first);
    drop(second);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(broker.connection_count(), 0);

    let (fourth, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .expect("a freed slot should admit a new connection");
    drop(fourth);

    broker.stop();
}
