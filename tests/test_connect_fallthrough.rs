//! Connection fall-through behavior when brokers are unreachable
//!
//! These tests use loopback ports with no listener so they hold whether or
//! not a real broker is running on the machine.

use adaptivemq::session::SessionManager;
use std::time::{Duration, Instant};
use tokio::time::timeout;

fn unreachable_brokers() -> Vec<String> {
    // Nothing listens on these ports; connects are refused immediately.
    vec![
        "mqtt://127.0.0.1:9".to_string(),
        "mqtt://127.0.0.1:10".to_string(),
        "mqtt://127.0.0.1:11".to_string(),
    ]
}

#[tokio::test]
async fn test_connect_exhausts_candidates_and_returns_false() {
    let manager = SessionManager::new("fallthrough-test", "./persist", "sensor");
    manager.set_brokers(&unreachable_brokers());

    let connected = timeout(Duration::from_secs(40), manager.connect())
        .await
        .expect("connect should finish well inside the per-broker deadlines");

    assert!(!connected, "no broker is listening, connect must fail");
    assert!(!manager.is_connected());

    // Every candidate was tried once and marked unavailable.
    for broker in manager.broker_stats() {
        assert!(!broker.available, "{} should be unavailable", broker.uri);
        assert_eq!(broker.score, 0.0);
    }

    // Nothing was published, so nothing queued.
    assert_eq!(manager.queued_message_count(), 0);
}

#[tokio::test]
async fn test_connect_with_refused_ports_fails_fast() {
    let manager = SessionManager::new("fallthrough-fast", "./persist", "sensor");
    manager.set_brokers(&unreachable_brokers());

    let start = Instant::now();
    let connected = manager.connect().await;
    assert!(!connected);

    // Refused connections fail long before the 10 s ConnAck deadline each.
    assert!(
        start.elapsed() < Duration::from_secs(31),
        "fall-through took {:?}",
        start.elapsed()
    );
}

#[tokio::test]
async fn test_connect_is_idempotent_while_disconnected() {
    let manager = SessionManager::new("fallthrough-idem", "./persist", "sensor");
    manager.set_brokers(&["mqtt://127.0.0.1:9".to_string()]);

    assert!(!manager.connect().await);
    // Second attempt sees an empty available set and fails immediately.
    assert!(!manager.connect().await);
    assert!(!manager.is_connected());
}

#[tokio::test]
async fn test_disconnect_after_failed_connect_is_safe() {
    let manager = SessionManager::new("fallthrough-disc", "./persist", "sensor");
    manager.set_brokers(&["mqtt://127.0.0.1:9".to_string()]);

    let _ = manager.connect().await;
    manager.disconnect().await;
    manager.disconnect().await;
    assert!(!manager.is_connected());
}

#[tokio::test]
async fn test_first_registered_broker_is_current_before_connect() {
    let manager = SessionManager::new("fallthrough-current", "./persist", "sensor");
    manager.add_broker("mqtt://127.0.0.1:9");
    manager.add_broker("mqtt://127.0.0.1:10");

    assert_eq!(
        manager.current_broker_uri().as_deref(),
        Some("mqtt://127.0.0.1:9")
    );
}
