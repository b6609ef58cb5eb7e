//! Publisher configuration
//!
//! Loaded from a TOML file; every field has a default so a bare invocation
//! works against local brokers. The CLI may override the category and the
//! broker list.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PublisherConfig {
    #[serde(default)]
    pub publisher: PublisherSection,
    #[serde(default)]
    pub brokers: BrokerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublisherSection {
    /// Base client identifier; each connection attempt appends a unique
    /// suffix.
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Message-persistence directory, created at startup and otherwise
    /// treated as opaque.
    #[serde(default = "default_persistence_dir")]
    pub persistence_dir: String,
    /// Device category selecting the scoring weight profile.
    #[serde(default = "default_category")]
    pub category: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Candidate broker URIs in priority order.
    #[serde(default = "default_broker_uris")]
    pub uris: Vec<String>,
}

fn default_client_id() -> String {
    "adaptive-publisher".to_string()
}

fn default_persistence_dir() -> String {
    "./persist".to_string()
}

fn default_category() -> String {
    "sensor".to_string()
}

fn default_broker_uris() -> Vec<String> {
    vec![
        "mqtt://localhost:1883".to_string(),
        "mqtt://localhost:1884".to_string(),
        "mqtt://localhost:1885".to_string(),
    ]
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            client_id: default_client_id(),
            persistence_dir: default_persistence_dir(),
            category: default_category(),
        }
    }
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            uris: default_broker_uris(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl PublisherConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_full_config_parses() {
        let toml_content = r#"
[publisher]
client_id = "fleet-42"
persistence_dir = "/var/lib/fleet"
category = "camera"

[brokers]
uris = ["mqtt://edge-a:1883", "mqtts://edge-b:8883"]
"#;
        let config: PublisherConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.publisher.client_id, "fleet-42");
        assert_eq!(config.publisher.category, "camera");
        assert_eq!(
            config.brokers.uris,
            vec!["mqtt://edge-a:1883", "mqtts://edge-b:8883"]
        );
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: PublisherConfig = toml::from_str("").unwrap();
        assert_eq!(config.publisher.client_id, "adaptive-publisher");
        assert_eq!(config.publisher.category, "sensor");
        assert_eq!(config.brokers.uris.len(), 3);
        assert_eq!(config.brokers.uris[0], "mqtt://localhost:1883");
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: PublisherConfig = toml::from_str(
            r#"
[publisher]
category = "drone"
"#,
        )
        .unwrap();
        assert_eq!(config.publisher.category, "drone");
        assert_eq!(config.publisher.client_id, "adaptive-publisher");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[publisher]\nclient_id = \"from-disk\"").unwrap();
        let config = PublisherConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.publisher.client_id, "from-disk");
    }

    #[test]
    fn test_missing_file_errors() {
        let result = PublisherConfig::load_from_file(Path::new("/nonexistent/publisher.toml"));
        assert!(matches!(result, Err(ConfigError::FileRead(_))));
    }

    #[test]
    fn test_malformed_toml_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[publisher\nclient_id = ").unwrap();
        let result = PublisherConfig::load_from_file(file.path());
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }
}
