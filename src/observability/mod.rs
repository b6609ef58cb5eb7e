//! Observability support
//!
//! Currently just structured logging; see [`logging`].

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};
