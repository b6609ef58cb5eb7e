//! Active broker measurements
//!
//! Each probe connects an ephemeral client, performs one measurement with
//! its own deadline, and disconnects. Probes drive their event loop inline;
//! nothing here outlives the measurement.

use crate::session::link::{broker_address, unix_millis};
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

pub(crate) const LATENCY_TOPIC: &str = "test/latency";
pub(crate) const BANDWIDTH_TOPIC: &str = "test/bandwidth";
pub(crate) const CONNECTION_COUNT_TOPIC: &str = "$SYS/brokers/+/stats/connections/count";

const PROBE_QOS: QoS = QoS::AtLeastOnce;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const LATENCY_DEADLINE: Duration = Duration::from_secs(5);
const BANDWIDTH_DEADLINE: Duration = Duration::from_secs(10);
const CONNECTION_DEADLINE: Duration = Duration::from_secs(5);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(1);

pub(crate) const BANDWIDTH_MESSAGE_COUNT: usize = 10;
pub(crate) const BANDWIDTH_MESSAGE_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid broker URI: {0}")]
    InvalidUri(String),

    #[error("broker refused probe connection: {0:?}")]
    Refused(ConnectReturnCode),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("probe request failed")]
    Client(#[from] rumqttc::ClientError),

    #[error("probe connection failed")]
    Link(#[from] rumqttc::ConnectionError),
}

/// Ephemeral client plus the event loop it polls.
struct ProbeClient {
    client: AsyncClient,
    event_loop: EventLoop,
}

impl ProbeClient {
    /// Connect with a clean session and a unique monitor id, waiting for
    /// the ConnAck within the probe connect deadline.
    async fn connect(uri: &str) -> Result<Self, ProbeError> {
        let (host, port, tls) = broker_address(uri)
            .map_err(|_| ProbeError::InvalidUri(uri.to_string()))?;
        let mut options = MqttOptions::new(format!("monitor-{}", unix_millis()), host, port);
        if tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        options.set_clean_session(true);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, mut event_loop) = AsyncClient::new(options, 16);
        let handshake = tokio::time::timeout(CONNECT_TIMEOUT, async {
            loop {
                if let Event::Incoming(Packet::ConnAck(ack)) = event_loop.poll().await? {
                    return if ack.code == ConnectReturnCode::Success {
                        Ok(())
                    } else {
                        Err(ProbeError::Refused(ack.code))
                    };
                }
            }
        })
        .await;

        match handshake {
            Ok(Ok(())) => Ok(Self { client, event_loop }),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(ProbeError::Timeout("probe connack")),
        }
    }

    /// Wait for the SubAck confirming a just-issued subscribe.
    async fn await_suback(&mut self) -> Result<(), ProbeError> {
        loop {
            if let Event::Incoming(Packet::SubAck(_)) = self.event_loop.poll().await? {
                return Ok(());
            }
        }
    }

    /// Best-effort disconnect; drains the loop briefly so the packet makes
    /// it onto the wire.
    async fn shutdown(mut self) {
        let _ = self.client.disconnect().await;
        let _ = tokio::time::timeout(SHUTDOWN_DRAIN, async {
            while self.event_loop.poll().await.is_ok() {}
        })
        .await;
    }
}

/// Round-trip time in milliseconds of a self-loop publish: subscribe to the
/// latency topic, publish a timestamped payload, and clock its return. The
/// subscription is acknowledged before the probe publish goes out.
pub(crate) async fn measure_latency(uri: &str) -> Result<f64, ProbeError> {
    let mut probe = ProbeClient::connect(uri).await?;
    let measurement = tokio::time::timeout(LATENCY_DEADLINE, async {
        probe.client.subscribe(LATENCY_TOPIC, PROBE_QOS).await?;
        probe.await_suback().await?;

        let payload = format!("latency-probe:{}", unix_millis());
        let sent_at = Instant::now();
        probe
            .client
            .publish(LATENCY_TOPIC, PROBE_QOS, false, payload)
            .await?;

        loop {
            if let Event::Incoming(Packet::Publish(publish)) = probe.event_loop.poll().await? {
                if publish.topic == LATENCY_TOPIC {
                    return Ok(sent_at.elapsed().as_secs_f64() * 1000.0);
                }
            }
        }
    })
    .await;
    probe.shutdown().await;

    match measurement {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout("latency loopback")),
    }
}

/// Sustained publish throughput in bytes/second: a burst of QoS 1 messages
/// timed from the first send to the last acknowledgement.
pub(crate) async fn measure_bandwidth(uri: &str) -> Result<f64, ProbeError> {
    let mut probe = ProbeClient::connect(uri).await?;
    let measurement = tokio::time::timeout(BANDWIDTH_DEADLINE, async {
        let payload = vec![b'A'; BANDWIDTH_MESSAGE_SIZE];
        let started_at = Instant::now();
        for _ in 0..BANDWIDTH_MESSAGE_COUNT {
            probe
                .client
                .publish(BANDWIDTH_TOPIC, PROBE_QOS, false, payload.clone())
                .await?;
        }

        let mut acknowledged = 0usize;
        loop {
            match probe.event_loop.poll().await? {
                Event::Incoming(Packet::PubAck(_)) => {
                    acknowledged += 1;
                    if acknowledged == BANDWIDTH_MESSAGE_COUNT {
                        break;
                    }
                }
                _ => {}
            }
        }

        let elapsed_ms = started_at.elapsed().as_millis().max(1) as f64;
        let total_bytes = (BANDWIDTH_MESSAGE_COUNT * BANDWIDTH_MESSAGE_SIZE) as f64;
        Ok(total_bytes * 1000.0 / elapsed_ms)
    })
    .await;
    probe.shutdown().await;

    match measurement {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout("bandwidth acknowledgements")),
    }
}

/// Broker-reported client count from the `$SYS` stats topic. Best effort:
/// brokers without `$SYS` support simply report 0.
pub(crate) async fn fetch_connection_count(uri: &str) -> Result<u32, ProbeError> {
    let mut probe = ProbeClient::connect(uri).await?;
    let measurement = tokio::time::timeout(CONNECTION_DEADLINE, async {
        probe
            .client
            .subscribe(CONNECTION_COUNT_TOPIC, PROBE_QOS)
            .await?;
        probe.await_suback().await?;

        loop {
            if let Event::Incoming(Packet::Publish(publish)) = probe.event_loop.poll().await? {
                let text = String::from_utf8_lossy(&publish.payload);
                return Ok(match text.trim().parse::<u32>() {
                    Ok(count) => count,
                    Err(_) => {
                        warn!(topic = %publish.topic, payload = %text, "unparsable connection count");
                        0
                    }
                });
            }
        }
    })
    .await;
    probe.shutdown().await;

    match measurement {
        Ok(result) => result,
        Err(_) => {
            debug!(uri, "no $SYS connection stats delivered");
            Ok(0)
        }
    }
}
