//! One active broker connection
//!
//! An [`ActiveLink`] owns an `AsyncClient` plus the task that drives its
//! event loop. The session manager creates a fresh link per connection
//! attempt and destroys it on disconnect or swap; a link never reconnects
//! on its own, it dies and reports.

use super::events::{route_event, LinkEvent};
use crate::error::SessionError;
use crate::queue::Message;
use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, Transport};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Cap on waiting for the driver task to wind down during close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection configuration forwarded verbatim to every (re)connect.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// Deadline for the broker's ConnAck.
    pub connect_timeout: Duration,
    /// Maximum inbound/outbound packet size in bytes.
    pub max_packet_size: usize,
    pub credentials: Option<(String, String)>,
    pub last_will: Option<Message>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            connect_timeout: Duration::from_secs(10),
            max_packet_size: 256 * 1024,
            credentials: None,
            last_will: None,
        }
    }
}

/// Host, port, and TLS flag extracted from a broker URI.
pub(crate) fn broker_address(uri: &str) -> Result<(String, u16, bool), SessionError> {
    let url = url::Url::parse(uri).map_err(|_| SessionError::InvalidBrokerUri(uri.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| SessionError::InvalidBrokerUri(uri.to_string()))?
        .to_string();
    let tls = matches!(url.scheme(), "mqtts" | "ssl");
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });
    Ok((host, port, tls))
}

/// Milliseconds since the unix epoch, used to make client ids unique per
/// connection attempt so a swap cannot collide with the broker-side ghost
/// of the previous session.
pub(crate) fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

/// Build `MqttOptions` for one connection attempt.
pub(crate) fn configure_mqtt_options(
    client_id: &str,
    uri: &str,
    options: &ConnectOptions,
) -> Result<MqttOptions, SessionError> {
    let (host, port, tls) = broker_address(uri)?;

    let unique_id = format!("{client_id}-{}", unix_millis());
    let mut mqtt_options = MqttOptions::new(unique_id, host, port);

    if tls {
        mqtt_options.set_transport(Transport::tls_with_default_config());
    }

    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_session(options.clean_session);
    mqtt_options.set_max_packet_size(options.max_packet_size, options.max_packet_size);

    if let Some((username, password)) = &options.credentials {
        mqtt_options.set_credentials(username, password);
    }

    if let Some(will) = &options.last_will {
        mqtt_options.set_last_will(LastWill::new(
            &will.topic,
            will.payload.clone(),
            will.qos,
            will.retained,
        ));
    }

    Ok(mqtt_options)
}

/// Where the driver task reports link activity. Callbacks capture a weak
/// back-reference to the session manager so the link never keeps it alive.
pub(crate) struct LinkCallbacks {
    pub on_connection_lost: Arc<dyn Fn(String) + Send + Sync>,
    pub on_message: Arc<dyn Fn(&str, &[u8]) + Send + Sync>,
    pub on_delivery: Arc<dyn Fn(u16) + Send + Sync>,
}

#[derive(Debug, Clone, PartialEq)]
enum LinkState {
    Connecting,
    Up,
    Down(String),
}

pub(crate) struct ActiveLink {
    pub uri: String,
    pub client: AsyncClient,
    shutdown_tx: watch::Sender<bool>,
    driver: JoinHandle<()>,
}

impl ActiveLink {
    /// Connect to one broker: spawn the event-loop driver and wait for the
    /// ConnAck within the configured deadline.
    pub(crate) async fn open(
        uri: &str,
        client_id: &str,
        options: &ConnectOptions,
        callbacks: LinkCallbacks,
    ) -> Result<Self, SessionError> {
        let mqtt_options = configure_mqtt_options(client_id, uri, options)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, 16);

        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let driver = tokio::spawn(drive(
            event_loop,
            uri.to_string(),
            state_tx,
            shutdown_rx,
            callbacks,
        ));

        if let Err(reason) = wait_for_ready(state_rx, options.connect_timeout).await {
            let _ = shutdown_tx.send(true);
            driver.abort();
            return Err(SessionError::ConnectionFailed {
                uri: uri.to_string(),
                reason,
            });
        }

        Ok(Self {
            uri: uri.to_string(),
            client,
            shutdown_tx,
            driver,
        })
    }

    /// Tear the link down: best-effort MQTT disconnect, then a bounded wait
    /// for the driver. The caller clears its connected flag first so the
    /// driver's death is not reported as a lost connection.
    pub(crate) async fn close(self) {
        let _ = self.client.disconnect().await;
        let _ = self.shutdown_tx.send(true);

        let mut driver = self.driver;
        if tokio::time::timeout(CLOSE_TIMEOUT, &mut driver).await.is_err() {
            warn!(uri = %self.uri, "link driver did not stop in time, aborting");
            driver.abort();
        }
    }
}

async fn wait_for_ready(
    mut state_rx: watch::Receiver<LinkState>,
    deadline: Duration,
) -> Result<(), String> {
    let wait = tokio::time::timeout(deadline, async {
        loop {
            match state_rx.borrow_and_update().clone() {
                LinkState::Up => return Ok(()),
                LinkState::Down(reason) => return Err(reason),
                LinkState::Connecting => {}
            }
            if state_rx.changed().await.is_err() {
                return Err("link driver exited".to_string());
            }
        }
    })
    .await;

    match wait {
        Ok(result) => result,
        Err(_) => Err("timed out waiting for broker acknowledgement".to_string()),
    }
}

/// Event-loop driver. Lives until the link is closed, the broker
/// disconnects, or the connection errors; a deliberate close suppresses the
/// connection-lost report via the shutdown flag and the manager's own
/// connected flag.
async fn drive(
    mut event_loop: EventLoop,
    uri: String,
    state_tx: watch::Sender<LinkState>,
    mut shutdown_rx: watch::Receiver<bool>,
    callbacks: LinkCallbacks,
) {
    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                // A dropped sender means the link itself is gone.
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!(%uri, "link driver shutting down");
                    break;
                }
            }

            polled = event_loop.poll() => match polled {
                Ok(event) => match route_event(&event) {
                    LinkEvent::ConnAck { code } => {
                        if code == rumqttc::ConnectReturnCode::Success {
                            let _ = state_tx.send(LinkState::Up);
                        } else {
                            let _ = state_tx
                                .send(LinkState::Down(format!("broker refused connection: {code:?}")));
                            break;
                        }
                    }
                    LinkEvent::MessageArrived { topic, payload } => {
                        (callbacks.on_message)(&topic, &payload);
                    }
                    LinkEvent::DeliveryAck { pkid } => {
                        (callbacks.on_delivery)(pkid);
                    }
                    LinkEvent::BrokerDisconnect => {
                        let _ = state_tx.send(LinkState::Down("broker disconnected".to_string()));
                        (callbacks.on_connection_lost)("broker disconnected".to_string());
                        break;
                    }
                    LinkEvent::SubAck { .. } | LinkEvent::Ignored => {}
                },
                Err(error) => {
                    let reason = error.to_string();
                    let _ = state_tx.send(LinkState::Down(reason.clone()));
                    if !*shutdown_rx.borrow() {
                        (callbacks.on_connection_lost)(reason);
                    }
                    break;
                }
            }
        }
    }
    debug!(%uri, "link driver stopped");
}
