//! adaptivemq - self-adaptive MQTT publisher layer
//!
//! Fronts a pool of candidate MQTT brokers and transparently steers
//! publish/subscribe traffic to the broker currently judged best by a
//! weighted performance score. The application sees one connection-oriented
//! object; behind it the crate:
//!
//! - probes every candidate's latency, throughput, and reported load on a
//!   periodic schedule ([`monitor`]),
//! - scores candidates under a device-category weight profile ([`scoring`],
//!   [`registry`]),
//! - migrates the active session when another broker sufficiently dominates
//!   the current one, and falls through the candidate list on connection
//!   failure ([`session`]),
//! - queues publishes while no broker is reachable and replays them in
//!   order after reconnection ([`queue`]).
//!
//! # Quick start
//!
//! ```rust,no_run
//! use adaptivemq::{ConnectOptions, SessionManager};
//! use rumqttc::QoS;
//!
//! # tokio_test::block_on(async {
//! let manager = SessionManager::new("my-publisher", "./persist", "camera");
//! manager.set_brokers(&[
//!     "mqtt://localhost:1883".to_string(),
//!     "mqtt://localhost:1884".to_string(),
//! ]);
//! manager.set_connect_options(ConnectOptions::default());
//!
//! manager.start_monitoring();
//! if manager.connect().await {
//!     manager.publish("cameras/front/frame", vec![0u8; 64], QoS::AtLeastOnce, false).await;
//! }
//! # });
//! ```

pub mod config;
pub mod error;
pub mod monitor;
pub mod observability;
pub mod queue;
pub mod registry;
pub mod scoring;
pub mod session;

pub use config::PublisherConfig;
pub use error::SessionError;
pub use monitor::Monitor;
pub use queue::{Message, OfflineQueue};
pub use registry::{BrokerRecord, BrokerRegistry};
pub use scoring::{weights_for_category, ScoreWeights};
pub use session::{ConnectOptions, PublishOutcome, SessionManager};
