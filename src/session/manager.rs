//! Session orchestrator
//!
//! Owns the single active broker link, the offline queue, and the broker
//! registry, and drives the connection state machine: ordered fall-through
//! on connect, hot swap to the best-scoring broker on monitor advice, and
//! queue replay on every successful (re)connect.

use super::link::{ActiveLink, ConnectOptions, LinkCallbacks};
use crate::config::PublisherConfig;
use crate::error::SessionError;
use crate::monitor::Monitor;
use crate::queue::{Message, OfflineQueue};
use crate::registry::{BrokerRecord, BrokerRegistry};
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Pause after every candidate broker has failed before the swap path may
/// run again. Keeps a flapping network from turning into a connect spin.
const EXHAUSTED_BACKOFF: Duration = Duration::from_secs(5);

/// What happened to a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the active client.
    Forwarded,
    /// Captured in the offline queue for replay after reconnection.
    Queued,
}

pub type ConnectionLostCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type ConnectedCallback = Arc<dyn Fn() + Send + Sync>;
pub type MessageArrivedCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;
pub type DeliveryCompleteCallback = Arc<dyn Fn(u16) + Send + Sync>;

#[derive(Default)]
struct UserCallbacks {
    connection_lost: Mutex<Option<ConnectionLostCallback>>,
    connected: Mutex<Option<ConnectedCallback>>,
    message_arrived: Mutex<Option<MessageArrivedCallback>>,
    delivery_complete: Mutex<Option<DeliveryCompleteCallback>>,
}

struct SessionInner {
    client_id: String,
    /// Opaque path handed through configuration; the client library in use
    /// has no file persistence hook, so it is carried, not consumed.
    persistence_dir: String,
    registry: Arc<BrokerRegistry>,
    monitor: Monitor,
    queue: Mutex<OfflineQueue>,
    link: AsyncMutex<Option<ActiveLink>>,
    connect_options: Mutex<ConnectOptions>,
    connected: AtomicBool,
    connecting: AtomicBool,
    callbacks: UserCallbacks,
}

/// The connection-oriented object the application sees: publish, subscribe,
/// connect, disconnect. Behind it the manager binds to exactly one broker
/// at a time and migrates when the monitor finds a sufficiently better one.
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(
        client_id: impl Into<String>,
        persistence_dir: impl Into<String>,
        category: &str,
    ) -> Self {
        let registry = Arc::new(BrokerRegistry::new(category));
        let inner = Arc::new(SessionInner {
            client_id: client_id.into(),
            persistence_dir: persistence_dir.into(),
            monitor: Monitor::new(registry.clone()),
            registry,
            queue: Mutex::new(OfflineQueue::default()),
            link: AsyncMutex::new(None),
            connect_options: Mutex::new(ConnectOptions::default()),
            connected: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            callbacks: UserCallbacks::default(),
        });

        // The monitor holds only weak back-references; dropping the manager
        // must be enough to let everything unwind.
        let weak = Arc::downgrade(&inner);
        inner
            .monitor
            .set_metrics_updated_callback(Arc::new(move |uri, latency, bandwidth, connections| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_metrics_updated(uri, latency, bandwidth, connections);
                }
            }));
        let weak = Arc::downgrade(&inner);
        inner
            .monitor
            .set_broker_switch_callback(Arc::new(move |uri| {
                if let Some(inner) = weak.upgrade() {
                    SessionInner::handle_switch_suggestion(inner, uri.to_string());
                }
            }));

        Self { inner }
    }

    /// Build a manager from configuration, registering its broker list.
    pub fn from_config(config: &PublisherConfig) -> Self {
        let manager = Self::new(
            config.publisher.client_id.clone(),
            config.publisher.persistence_dir.clone(),
            &config.publisher.category,
        );
        manager.set_brokers(&config.brokers.uris);
        manager
    }

    pub fn persistence_dir(&self) -> &str {
        &self.inner.persistence_dir
    }

    // Registry pass-throughs. All safe before `connect()`.

    pub fn add_broker(&self, uri: &str) {
        self.inner.registry.add(uri);
    }

    pub fn remove_broker(&self, uri: &str) {
        self.inner.registry.remove(uri);
    }

    pub fn set_brokers(&self, uris: &[String]) {
        self.inner.registry.clear();
        for uri in uris {
            self.inner.registry.add(uri);
        }
    }

    pub fn broker_stats(&self) -> Vec<BrokerRecord> {
        self.inner.registry.all()
    }

    pub fn current_broker_uri(&self) -> Option<String> {
        self.inner.registry.current_uri()
    }

    pub fn set_connect_options(&self, options: ConnectOptions) {
        *self.inner.connect_options.lock().unwrap() = options;
    }

    /// Try every available broker in registration order; true on the first
    /// success. Idempotent: while connected or mid-attempt it just reports
    /// the current connectedness. A success replays the offline queue.
    pub async fn connect(&self) -> bool {
        let inner = &self.inner;
        if inner.connected.load(Ordering::SeqCst) || inner.connecting.swap(true, Ordering::SeqCst) {
            return inner.connected.load(Ordering::SeqCst);
        }

        let mut link_slot = inner.link.lock().await;
        let candidates = inner.registry.available_uris();
        if candidates.is_empty() {
            warn!("no available brokers to connect to");
            inner.connecting.store(false, Ordering::SeqCst);
            return false;
        }

        let total = candidates.len();
        for (attempt, uri) in candidates.iter().enumerate() {
            info!(%uri, attempt = attempt + 1, total, "attempting initial connection");
            match SessionInner::try_open_link(inner, uri).await {
                Ok(link) => {
                    inner.registry.set_current(uri);
                    inner.flush_queue(&link).await;
                    *link_slot = Some(link);
                    inner.connected.store(true, Ordering::SeqCst);
                    inner.connecting.store(false, Ordering::SeqCst);
                    drop(link_slot);
                    info!(%uri, "connected");
                    inner.fire_connected();
                    return true;
                }
                Err(error) => {
                    warn!(%uri, %error, "initial connection failed");
                    inner.registry.mark_unavailable(uri);
                }
            }
        }

        warn!("all brokers failed the initial connection");
        inner.connecting.store(false, Ordering::SeqCst);
        false
    }

    /// Tear down the active link. Safe when not connected.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        let mut link_slot = inner.link.lock().await;
        inner.connected.store(false, Ordering::SeqCst);
        inner.connecting.store(false, Ordering::SeqCst);
        if let Some(link) = link_slot.take() {
            info!(uri = %link.uri, "disconnecting");
            link.close().await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Publish, or capture for later. Never errors: while disconnected, or
    /// when the forward fails, the message lands in the offline queue.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
        retained: bool,
    ) -> PublishOutcome {
        self.publish_message(Message::new(topic, payload, qos, retained))
            .await
    }

    /// Pre-built message variant of [`publish`](Self::publish).
    pub async fn publish_message(&self, message: Message) -> PublishOutcome {
        let inner = &self.inner;
        if !inner.connected.load(Ordering::SeqCst) {
            inner.enqueue(message);
            return PublishOutcome::Queued;
        }

        let link_slot = inner.link.lock().await;
        let Some(link) = link_slot.as_ref() else {
            drop(link_slot);
            inner.enqueue(message);
            return PublishOutcome::Queued;
        };

        match link
            .client
            .publish(
                &message.topic,
                message.qos,
                message.retained,
                message.payload.clone(),
            )
            .await
        {
            Ok(()) => PublishOutcome::Forwarded,
            Err(error) => {
                warn!(topic = %message.topic, %error, "publish failed, queueing");
                drop(link_slot);
                inner.enqueue(message);
                PublishOutcome::Queued
            }
        }
    }

    /// Subscribe on the active link. Fails fast while disconnected.
    pub async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), SessionError> {
        let link_slot = self.inner.link.lock().await;
        let link = self.inner.active_link(&link_slot)?;
        link.client
            .subscribe(topic, qos)
            .await
            .map_err(|source| SessionError::SubscribeFailed {
                topic: topic.to_string(),
                source,
            })
    }

    /// Unsubscribe on the active link. Fails fast while disconnected.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), SessionError> {
        let link_slot = self.inner.link.lock().await;
        let link = self.inner.active_link(&link_slot)?;
        link.client
            .unsubscribe(topic)
            .await
            .map_err(|source| SessionError::UnsubscribeFailed {
                topic: topic.to_string(),
                source,
            })
    }

    pub fn queued_message_count(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    pub fn clear_queue(&self) {
        self.inner.queue.lock().unwrap().clear();
    }

    pub fn start_monitoring(&self) {
        self.inner.monitor.start();
    }

    pub async fn stop_monitoring(&self) {
        self.inner.monitor.stop().await;
    }

    pub fn is_monitoring(&self) -> bool {
        self.inner.monitor.is_running()
    }

    // Callback registration. Callbacks are delivered on the link driver's
    // task and must not block.

    pub fn set_connection_lost_callback(&self, callback: ConnectionLostCallback) {
        *self.inner.callbacks.connection_lost.lock().unwrap() = Some(callback);
    }

    pub fn set_connected_callback(&self, callback: ConnectedCallback) {
        *self.inner.callbacks.connected.lock().unwrap() = Some(callback);
    }

    pub fn set_message_arrived_callback(&self, callback: MessageArrivedCallback) {
        *self.inner.callbacks.message_arrived.lock().unwrap() = Some(callback);
    }

    pub fn set_delivery_complete_callback(&self, callback: DeliveryCompleteCallback) {
        *self.inner.callbacks.delivery_complete.lock().unwrap() = Some(callback);
    }
}

impl SessionInner {
    fn active_link<'a>(
        &self,
        link_slot: &'a Option<ActiveLink>,
    ) -> Result<&'a ActiveLink, SessionError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SessionError::NotConnected);
        }
        link_slot.as_ref().ok_or(SessionError::NotConnected)
    }

    fn enqueue(&self, message: Message) {
        let mut queue = self.queue.lock().unwrap();
        queue.push(message);
        debug!(queued = queue.len(), "publish captured offline");
    }

    /// Open a fresh link whose driver reports back through weak references.
    async fn try_open_link(inner: &Arc<Self>, uri: &str) -> Result<ActiveLink, SessionError> {
        let options = inner.connect_options.lock().unwrap().clone();

        let weak = Arc::downgrade(inner);
        let on_connection_lost: Arc<dyn Fn(String) + Send + Sync> = Arc::new(move |reason| {
            if let Some(inner) = weak.upgrade() {
                SessionInner::handle_connection_lost(inner, reason);
            }
        });

        let weak = Arc::downgrade(inner);
        let on_message: Arc<dyn Fn(&str, &[u8]) + Send + Sync> = Arc::new(move |topic, payload| {
            if let Some(inner) = weak.upgrade() {
                inner.fire_message_arrived(topic, payload);
            }
        });

        let weak = Arc::downgrade(inner);
        let on_delivery: Arc<dyn Fn(u16) + Send + Sync> = Arc::new(move |pkid| {
            if let Some(inner) = weak.upgrade() {
                inner.fire_delivery_complete(pkid);
            }
        });

        ActiveLink::open(
            uri,
            &inner.client_id,
            &options,
            LinkCallbacks {
                on_connection_lost,
                on_message,
                on_delivery,
            },
        )
        .await
    }

    /// Replay queued publishes in FIFO order; the first failure leaves the
    /// remaining entries (including the failed one) queued.
    async fn flush_queue(&self, link: &ActiveLink) {
        loop {
            let next = self.queue.lock().unwrap().front();
            let Some(message) = next else { break };
            let sent = link
                .client
                .publish(
                    &message.topic,
                    message.qos,
                    message.retained,
                    message.payload.clone(),
                )
                .await;
            match sent {
                Ok(()) => {
                    self.queue.lock().unwrap().pop_front();
                    debug!(topic = %message.topic, "replayed queued publish");
                }
                Err(error) => {
                    warn!(topic = %message.topic, %error, "queue replay stopped");
                    break;
                }
            }
        }
    }

    /// Driver-thread entry for a dead link. Only the first report after a
    /// connected period acts; deliberate closes cleared the flag already.
    fn handle_connection_lost(inner: Arc<Self>, reason: String) {
        if !inner.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        warn!(%reason, "connection lost");
        inner.fire_connection_lost(&reason);
        tokio::spawn(async move {
            SessionInner::switch_to_best_broker(&inner).await;
        });
    }

    fn handle_metrics_updated(
        &self,
        uri: &str,
        latency_ms: f64,
        bandwidth_bps: f64,
        connections: u32,
    ) {
        debug!(
            uri,
            latency_ms, bandwidth_bps, connections, "broker metrics updated"
        );
    }

    /// Monitor-thread entry for a switch suggestion.
    fn handle_switch_suggestion(inner: Arc<Self>, uri: String) {
        if !inner.registry.should_switch() {
            return;
        }
        if inner.connecting.load(Ordering::SeqCst) {
            debug!("switch suggested while a connection attempt is in flight, skipping");
            return;
        }
        info!(%uri, "switching to better broker");
        tokio::spawn(async move {
            SessionInner::switch_to_best_broker(&inner).await;
        });
    }

    /// The swap/reconnect path: destroy the active link, then fall through
    /// the candidates starting from the best-scoring one. Re-entry while an
    /// attempt is in flight is a no-op.
    async fn switch_to_best_broker(inner: &Arc<Self>) {
        if inner.connecting.swap(true, Ordering::SeqCst) {
            debug!("already connecting, skipping switch");
            return;
        }

        let mut link_slot = inner.link.lock().await;
        inner.connected.store(false, Ordering::SeqCst);
        if let Some(old) = link_slot.take() {
            // In-flight publishes on the old link are abandoned here.
            info!(uri = %old.uri, "tearing down current link");
            old.close().await;
        }

        let candidates = inner.swap_candidates();
        if candidates.is_empty() {
            warn!("no available brokers to switch to");
            inner.connecting.store(false, Ordering::SeqCst);
            return;
        }

        let total = candidates.len();
        for (attempt, uri) in candidates.iter().enumerate() {
            info!(%uri, attempt = attempt + 1, total, "trying broker");
            match SessionInner::try_open_link(inner, uri).await {
                Ok(link) => {
                    inner.registry.set_current(uri);
                    inner.flush_queue(&link).await;
                    *link_slot = Some(link);
                    inner.connected.store(true, Ordering::SeqCst);
                    inner.connecting.store(false, Ordering::SeqCst);
                    drop(link_slot);
                    info!(%uri, "reconnected");
                    inner.fire_connected();
                    return;
                }
                Err(error) => {
                    warn!(%uri, %error, "broker failed during switch");
                    inner.registry.mark_unavailable(uri);
                }
            }
        }

        drop(link_slot);
        warn!(
            backoff = ?EXHAUSTED_BACKOFF,
            "every candidate broker failed, backing off"
        );
        tokio::time::sleep(EXHAUSTED_BACKOFF).await;
        inner.connecting.store(false, Ordering::SeqCst);
    }

    /// Best-scoring broker first, then the remaining available brokers in
    /// registration order.
    fn swap_candidates(&self) -> Vec<String> {
        let mut candidates = self.registry.available_uris();
        if let Some(best) = self.registry.best() {
            if let Some(position) = candidates.iter().position(|uri| *uri == best.uri) {
                let best_uri = candidates.remove(position);
                candidates.insert(0, best_uri);
            }
        }
        candidates
    }

    fn fire_connection_lost(&self, reason: &str) {
        let callback = self.callbacks.connection_lost.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(reason);
        }
    }

    fn fire_connected(&self) {
        let callback = self.callbacks.connected.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn fire_message_arrived(&self, topic: &str, payload: &[u8]) {
        let callback = self.callbacks.message_arrived.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(topic, payload);
        }
    }

    fn fire_delivery_complete(&self, pkid: u16) {
        let callback = self.callbacks.delivery_complete.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(pkid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new("test-publisher", "./persist", "sensor")
    }

    #[tokio::test]
    async fn test_new_manager_is_idle() {
        let manager = manager();
        assert!(!manager.is_connected());
        assert!(!manager.is_monitoring());
        assert_eq!(manager.queued_message_count(), 0);
        assert!(manager.current_broker_uri().is_none());
    }

    #[tokio::test]
    async fn test_set_brokers_registers_in_order() {
        let manager = manager();
        manager.set_brokers(&[
            "mqtt://a:1883".to_string(),
            "mqtt://b:1883".to_string(),
            "mqtt://a:1883".to_string(),
        ]);
        let stats = manager.broker_stats();
        let uris: Vec<&str> = stats.iter().map(|b| b.uri.as_str()).collect();
        assert_eq!(uris, vec!["mqtt://a:1883", "mqtt://b:1883"]);
        assert_eq!(manager.current_broker_uri().as_deref(), Some("mqtt://a:1883"));
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_queues() {
        let manager = manager();
        let outcome = manager
            .publish("sensors/temp", "21.5", QoS::AtLeastOnce, false)
            .await;
        assert_eq!(outcome, PublishOutcome::Queued);
        assert_eq!(manager.queued_message_count(), 1);
    }

    #[tokio::test]
    async fn test_queue_bounded_under_publish_flood() {
        let manager = manager();
        for n in 0..1100u32 {
            manager
                .publish("sensors/temp", n.to_le_bytes().to_vec(), QoS::AtLeastOnce, false)
                .await;
        }
        assert_eq!(manager.queued_message_count(), 1000);
        manager.clear_queue();
        assert_eq!(manager.queued_message_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_fails_fast_when_disconnected() {
        let manager = manager();
        let result = manager.subscribe("sensors/#", QoS::AtLeastOnce).await;
        assert!(matches!(result, Err(SessionError::NotConnected)));
        let result = manager.unsubscribe("sensors/#").await;
        assert!(matches!(result, Err(SessionError::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_with_no_brokers_fails() {
        let manager = manager();
        assert!(!manager.connect().await);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_is_safe_when_not_connected() {
        let manager = manager();
        manager.disconnect().await;
        manager.disconnect().await;
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_callbacks_can_be_registered() {
        let manager = manager();
        manager.set_connection_lost_callback(Arc::new(|_| {}));
        manager.set_connected_callback(Arc::new(|| {}));
        manager.set_message_arrived_callback(Arc::new(|_, _| {}));
        manager.set_delivery_complete_callback(Arc::new(|_| {}));
    }

    #[test]
    fn test_swap_candidates_put_best_first() {
        let manager = manager();
        manager.set_brokers(&[
            "mqtt://a:1883".to_string(),
            "mqtt://b:1883".to_string(),
            "mqtt://c:1883".to_string(),
        ]);
        let registry = &manager.inner.registry;
        registry.update_metrics("mqtt://a:1883", 80.0, 0.0, 0);
        registry.update_metrics("mqtt://b:1883", 10.0, 2_000_000.0, 5);
        registry.update_metrics("mqtt://c:1883", 50.0, 0.0, 0);
        assert_eq!(
            manager.inner.swap_candidates(),
            vec!["mqtt://b:1883", "mqtt://a:1883", "mqtt://c:1883"]
        );
    }
}
