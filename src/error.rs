//! Error types for VIRTA

use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;

/// Result type alias for VIRTA operations
pub type Result<T> = std::result::Result<T, VirtaError>;

/// Main error type for VIRTA
///
/// Every variant here is fatal at startup: bad configuration, unreadable TLS
/// material, a refused initial CONNECT, or a health server that cannot bind.
/// After startup, failures are handled locally (retry, breaker, reconnect,
/// per-message diagnostics) and never surface as a `VirtaError`.
#[derive(Error, Debug)]
pub enum VirtaError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Initial broker CONNECT failed
    #[error("broker connect failed: {0}")]
    Connect(#[from] rumqttc::ConnectionError),

    /// Initial broker CONNECT did not complete in time
    #[error("broker connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// MQTT client request error (subscribe at boot)
    #[error("mqtt client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// CA certificate could not be read
    #[error("unreadable TLS material {path}: {source}")]
    TlsMaterial {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// HTTP client construction failed
    #[error("http client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Health server could not bind its port
    #[error("health server bind failed: {0}")]
    Bind(std::io::Error),
}
