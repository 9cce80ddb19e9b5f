//! Broker connection settings: TOML file, serde defaults, env overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NodeSdkError, Result};
use crate::retry::RetryBackoff;

/// Environment variable overriding [`BrokerConfig::service_url`].
pub const ENV_SERVICE_URL: &str = "NODELINK_SERVICE_URL";
/// Environment variable overriding [`BrokerConfig::topic_data_url`].
pub const ENV_TOPIC_DATA_URL: &str = "NODELINK_TOPIC_DATA_URL";

/// Broker connection settings handed to every protocol run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Endpoint for request/response service calls.
    #[serde(default = "default_service_url")]
    pub service_url: String,

    /// Endpoint for the streamed topic data connection.
    #[serde(default = "default_topic_data_url")]
    pub topic_data_url: String,

    /// Service topic answering the server configuration request.
    #[serde(default = "default_server_config_topic")]
    pub server_config_topic: String,

    /// Bound applied to `implements` waits that do not pass their own.
    /// Unset means wait forever.
    #[serde(default)]
    pub default_wait_timeout_ms: Option<u64>,

    /// Per-call bound for service requests.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Back-off used when retrying failed lifecycle hooks.
    #[serde(default)]
    pub retry: RetryBackoff,
}

fn default_service_url() -> String {
    "http://localhost:8102/services".into()
}
fn default_topic_data_url() -> String {
    "ws://localhost:8104".into()
}
fn default_server_config_topic() -> String {
    nl_protocol::DEFAULT_SERVER_CONFIG_TOPIC.into()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            service_url: default_service_url(),
            topic_data_url: default_topic_data_url(),
            server_config_topic: default_server_config_topic(),
            default_wait_timeout_ms: None,
            request_timeout_ms: default_request_timeout_ms(),
            retry: RetryBackoff::default(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing keys.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NodeSdkError::Config(format!("reading {path}: {e}")))?;
        let config: BrokerConfig = toml::from_str(&content)
            .map_err(|e| NodeSdkError::Config(format!("parsing {path}: {e}")))?;
        Ok(config)
    }

    /// Load from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!(path = %path, error = %e, "using default broker config");
                Self::default()
            }
        }
    }

    /// Override endpoints from `NODELINK_SERVICE_URL` / `NODELINK_TOPIC_DATA_URL`.
    pub fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var(ENV_SERVICE_URL) {
            if !url.is_empty() {
                self.service_url = url;
            }
        }
        if let Ok(url) = std::env::var(ENV_TOPIC_DATA_URL) {
            if !url.is_empty() {
                self.topic_data_url = url;
            }
        }
        self
    }

    pub fn default_wait_timeout(&self) -> Option<Duration> {
        self.default_wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
