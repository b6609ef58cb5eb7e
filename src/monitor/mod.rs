//! Background broker monitoring
//!
//! A single worker task wakes every tick, runs whichever measurement
//! classes are due against every registered broker, folds the results into
//! the registry, and tells the session manager when a better broker exists.

pub(crate) mod probe;

pub use probe::ProbeError;

use crate::registry::BrokerRegistry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Main loop cadence.
const TICK: Duration = Duration::from_secs(20);
/// Per-class gates, measured from the previous run of that class.
const LATENCY_INTERVAL: Duration = Duration::from_secs(5);
const BANDWIDTH_INTERVAL: Duration = Duration::from_secs(10);
const CONNECTION_INTERVAL: Duration = Duration::from_secs(15);
/// Worst-case wind-down is one in-flight probe; anything past this is stuck.
const STOP_TIMEOUT: Duration = Duration::from_secs(30);

pub type BrokerSwitchCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type MetricsUpdatedCallback = Arc<dyn Fn(&str, f64, f64, u32) + Send + Sync>;

#[derive(Default)]
struct MonitorCallbacks {
    broker_switch: Mutex<Option<BrokerSwitchCallback>>,
    metrics_updated: Mutex<Option<MetricsUpdatedCallback>>,
}

struct Worker {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Periodic measurement worker over the shared broker registry.
pub struct Monitor {
    registry: Arc<BrokerRegistry>,
    callbacks: Arc<MonitorCallbacks>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<Worker>>,
}

impl Monitor {
    pub fn new(registry: Arc<BrokerRegistry>) -> Self {
        Self {
            registry,
            callbacks: Arc::new(MonitorCallbacks::default()),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }

    pub fn set_broker_switch_callback(&self, callback: BrokerSwitchCallback) {
        *self.callbacks.broker_switch.lock().unwrap() = Some(callback);
    }

    pub fn set_metrics_updated_callback(&self, callback: MetricsUpdatedCallback) {
        *self.callbacks.metrics_updated.lock().unwrap() = Some(callback);
    }

    /// Spawn the worker. No-op while already running.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(
            self.registry.clone(),
            self.callbacks.clone(),
            self.running.clone(),
            shutdown_rx,
        ));
        *self.worker.lock().unwrap() = Some(Worker {
            shutdown_tx,
            handle,
        });
        info!("broker monitor started");
    }

    /// Signal the worker and join it. In-flight probes finish or time out;
    /// the stop flag is honored between every per-broker operation.
    pub async fn stop(&self) {
        let worker = self.worker.lock().unwrap().take();
        let Some(worker) = worker else { return };
        let _ = worker.shutdown_tx.send(true);

        let mut handle = worker.handle;
        if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
            warn!("monitor worker did not stop in time, aborting");
            handle.abort();
        }
        self.running.store(false, Ordering::SeqCst);
        info!("broker monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// True when a measurement class is due again.
fn due(last_run: Instant, interval: Duration, now: Instant) -> bool {
    now.duration_since(last_run) >= interval
}

/// Sleep that wakes early on the stop signal. Returns false when stopping.
async fn interruptible_sleep(shutdown_rx: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => {
            changed.is_ok() && !*shutdown_rx.borrow()
        }
        _ = tokio::time::sleep(period) => true,
    }
}

async fn run(
    registry: Arc<BrokerRegistry>,
    callbacks: Arc<MonitorCallbacks>,
    running: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut last_latency = Instant::now();
    let mut last_bandwidth = Instant::now();
    let mut last_connections = Instant::now();

    'ticks: loop {
        if !interruptible_sleep(&mut shutdown_rx, TICK).await {
            break;
        }

        let now = Instant::now();

        if due(last_latency, LATENCY_INTERVAL, now) {
            if !latency_pass(&registry, &callbacks, &shutdown_rx).await {
                break 'ticks;
            }
            last_latency = now;
        }

        if due(last_bandwidth, BANDWIDTH_INTERVAL, now) {
            if !bandwidth_pass(&registry, &callbacks, &shutdown_rx).await {
                break 'ticks;
            }
            last_bandwidth = now;
        }

        if due(last_connections, CONNECTION_INTERVAL, now) {
            if !connection_pass(&registry, &callbacks, &shutdown_rx).await {
                break 'ticks;
            }
            last_connections = now;
        }
    }

    running.store(false, Ordering::SeqCst);
}

async fn latency_pass(
    registry: &Arc<BrokerRegistry>,
    callbacks: &MonitorCallbacks,
    shutdown_rx: &watch::Receiver<bool>,
) -> bool {
    for uri in registry.uris() {
        if *shutdown_rx.borrow() {
            return false;
        }
        match probe::measure_latency(&uri).await {
            Ok(latency_ms) => {
                info!(%uri, latency_ms, "latency measured");
                let (bandwidth_bps, connection_count) = registry
                    .get(&uri)
                    .map(|b| (b.bandwidth_bps, b.connection_count))
                    .unwrap_or_default();
                apply_update(registry, callbacks, &uri, latency_ms, bandwidth_bps, connection_count);
            }
            Err(error) => {
                warn!(%uri, %error, "latency probe failed");
                registry.mark_unavailable(&uri);
            }
        }
    }
    true
}

async fn bandwidth_pass(
    registry: &Arc<BrokerRegistry>,
    callbacks: &MonitorCallbacks,
    shutdown_rx: &watch::Receiver<bool>,
) -> bool {
    for uri in registry.uris() {
        if *shutdown_rx.borrow() {
            return false;
        }
        match probe::measure_bandwidth(&uri).await {
            Ok(bandwidth_bps) => {
                info!(%uri, bandwidth_bps, "bandwidth measured");
                let (latency_ms, connection_count) = registry
                    .get(&uri)
                    .map(|b| (b.latency_ms, b.connection_count))
                    .unwrap_or_default();
                apply_update(registry, callbacks, &uri, latency_ms, bandwidth_bps, connection_count);
            }
            Err(error) => {
                warn!(%uri, %error, "bandwidth probe failed");
                registry.mark_unavailable(&uri);
            }
        }
    }
    true
}

async fn connection_pass(
    registry: &Arc<BrokerRegistry>,
    callbacks: &MonitorCallbacks,
    shutdown_rx: &watch::Receiver<bool>,
) -> bool {
    for uri in registry.uris() {
        if *shutdown_rx.borrow() {
            return false;
        }
        match probe::fetch_connection_count(&uri).await {
            Ok(connection_count) => {
                info!(%uri, connection_count, "connection count read");
                let (latency_ms, bandwidth_bps) = registry
                    .get(&uri)
                    .map(|b| (b.latency_ms, b.bandwidth_bps))
                    .unwrap_or_default();
                apply_update(registry, callbacks, &uri, latency_ms, bandwidth_bps, connection_count);
            }
            // The $SYS tree is optional; a failed read never disqualifies
            // the broker.
            Err(error) => warn!(%uri, %error, "connection count probe failed"),
        }
    }
    true
}

/// Fold one measurement into the registry and notify the session manager.
fn apply_update(
    registry: &Arc<BrokerRegistry>,
    callbacks: &MonitorCallbacks,
    uri: &str,
    latency_ms: f64,
    bandwidth_bps: f64,
    connection_count: u32,
) {
    registry.update_metrics(uri, latency_ms, bandwidth_bps, connection_count);

    let metrics_updated = callbacks.metrics_updated.lock().unwrap().clone();
    if let Some(callback) = metrics_updated {
        callback(uri, latency_ms, bandwidth_bps, connection_count);
    }

    if registry.should_switch() {
        if let Some(best) = registry.best() {
            let broker_switch = callbacks.broker_switch.lock().unwrap().clone();
            if let Some(callback) = broker_switch {
                callback(&best.uri);
            }
        }
    }
}
