//! Adaptive session management
//!
//! Split the way the rest of the crate is: pure decision logic in
//! [`events`], the single-connection plumbing in [`link`], and the
//! orchestration in [`manager`].
//!
//! # Usage
//!
//! ```rust,no_run
//! use adaptivemq::session::SessionManager;
//! use rumqttc::QoS;
//!
//! # tokio_test::block_on(async {
//! let manager = SessionManager::new("my-publisher", "./persist", "sensor");
//! manager.add_broker("mqtt://localhost:1883");
//! manager.add_broker("mqtt://localhost:1884");
//!
//! manager.start_monitoring();
//! if manager.connect().await {
//!     manager.publish("sensors/temp", "21.5", QoS::AtLeastOnce, false).await;
//! }
//! # });
//! ```

pub mod events;
pub(crate) mod link;
pub mod manager;

pub use link::ConnectOptions;
pub use manager::{
    ConnectedCallback, ConnectionLostCallback, DeliveryCompleteCallback, MessageArrivedCallback,
    PublishOutcome, SessionManager,
};
