//! Error types for the public session API

use thiserror::Error;

/// Errors surfaced by [`crate::session::SessionManager`].
///
/// Publishes never produce these: a publish that cannot be forwarded is
/// queued instead. Subscriptions and explicit connection management fail
/// fast.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("not connected to any broker")]
    NotConnected,

    #[error("invalid broker URI: {0}")]
    InvalidBrokerUri(String),

    #[error("connection to {uri} failed: {reason}")]
    ConnectionFailed { uri: String, reason: String },

    #[error("subscribe to {topic} failed")]
    SubscribeFailed {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },

    #[error("unsubscribe from {topic} failed")]
    UnsubscribeFailed {
        topic: String,
        #[source]
        source: rumqttc::ClientError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            SessionError::NotConnected.to_string(),
            "not connected to any broker"
        );
        assert_eq!(
            SessionError::InvalidBrokerUri("nope".into()).to_string(),
            "invalid broker URI: nope"
        );
        let error = SessionError::ConnectionFailed {
            uri: "mqtt://host:1883".into(),
            reason: "timed out".into(),
        };
        assert!(error.to_string().contains("mqtt://host:1883"));
        assert!(error.to_string().contains("timed out"));
    }
}
