//! Self-adaptive MQTT publisher - sample front-end
//!
//! Publishes a numbered message every few seconds while the session layer
//! keeps the connection bound to the best-scoring broker, prints broker
//! statistics periodically, and shuts down cleanly on SIGINT/SIGTERM.

use adaptivemq::observability::init_default_logging;
use adaptivemq::queue::Message;
use adaptivemq::session::{ConnectOptions, SessionManager};
use adaptivemq::PublisherConfig;
use clap::Parser;
use rumqttc::QoS;
use std::path::PathBuf;
use std::process;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{error, info, warn};

const PUBLISH_INTERVAL: Duration = Duration::from_secs(5);
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Self-adaptive MQTT publisher
#[derive(Parser)]
#[command(name = "adaptivemq")]
#[command(about = "Publishes to the best-scoring broker of a candidate pool")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Device category selecting the scoring weight profile
    category: Option<String>,

    /// Candidate broker URIs (defaults to mqtt://localhost:{1883,1884,1885})
    brokers: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_default_logging();

    let mut config = match &cli.config {
        Some(path) => match PublisherConfig::load_from_file(path) {
            Ok(config) => config,
            Err(error) => {
                error!(%error, path = %path.display(), "failed to load configuration");
                process::exit(1);
            }
        },
        None => PublisherConfig::default(),
    };
    if let Some(category) = cli.category {
        config.publisher.category = category;
    }
    if !cli.brokers.is_empty() {
        config.brokers.uris = cli.brokers;
    }

    info!(
        category = %config.publisher.category,
        brokers = ?config.brokers.uris,
        "starting self-adaptive publisher"
    );

    if let Err(error) = std::fs::create_dir_all(&config.publisher.persistence_dir) {
        warn!(%error, dir = %config.publisher.persistence_dir, "could not create persistence directory");
    }

    let manager = SessionManager::from_config(&config);
    manager.set_connect_options(ConnectOptions {
        last_will: Some(Message::new(
            "test/status",
            "publisher disconnected",
            QoS::AtLeastOnce,
            false,
        )),
        ..Default::default()
    });

    manager.set_connection_lost_callback(std::sync::Arc::new(|cause| {
        warn!(cause, "connection lost");
    }));
    manager.set_connected_callback(std::sync::Arc::new(|| {
        info!("connection established");
    }));
    manager.set_message_arrived_callback(std::sync::Arc::new(|topic, payload| {
        info!(topic, payload = %String::from_utf8_lossy(payload), "message received");
    }));

    manager.start_monitoring();

    if !manager.connect().await {
        error!("initial connection failed on every broker");
        manager.stop_monitoring().await;
        process::exit(1);
    }
    info!(
        broker = %manager.current_broker_uri().unwrap_or_default(),
        "initial connection complete"
    );

    run_publish_loop(&manager).await;

    info!("shutting down");
    manager.stop_monitoring().await;
    manager.disconnect().await;
    info!("publisher stopped");
}

async fn run_publish_loop(manager: &SessionManager) {
    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(error) => {
            error!(%error, "failed to install SIGTERM handler");
            return;
        }
    };

    let mut message_count = 0u64;
    let mut last_publish = Instant::now() - PUBLISH_INTERVAL;
    let mut last_stats = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("received SIGINT");
                return;
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                return;
            }
            _ = ticker.tick() => {}
        }

        let now = Instant::now();

        if manager.is_connected() && now.duration_since(last_publish) >= PUBLISH_INTERVAL {
            message_count += 1;
            let payload = format!("Hello from self-adaptive publisher! Message #{message_count}");
            let outcome = manager
                .publish("test/message", payload, QoS::AtLeastOnce, false)
                .await;
            info!(count = message_count, ?outcome, "published");
            last_publish = now;
        }

        if now.duration_since(last_stats) >= STATS_INTERVAL {
            log_stats(manager);
            last_stats = now;
        }

        if !manager.is_connected() {
            info!("disconnected, retrying connection");
            if manager.connect().await {
                info!(
                    broker = %manager.current_broker_uri().unwrap_or_default(),
                    "reconnected"
                );
            }
        }
    }
}

fn log_stats(manager: &SessionManager) {
    info!(
        current = %manager.current_broker_uri().unwrap_or_default(),
        connected = manager.is_connected(),
        queued = manager.queued_message_count(),
        monitoring = manager.is_monitoring(),
        "session status"
    );
    for broker in manager.broker_stats() {
        info!(
            uri = %broker.uri,
            latency_ms = broker.latency_ms,
            bandwidth_bps = broker.bandwidth_bps,
            connections = broker.connection_count,
            score = broker.score,
            available = broker.available,
            "broker"
        );
    }
}
