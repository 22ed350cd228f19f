//! Environment-backed configuration
//!
//! All knobs come from environment variables with the defaults of the
//! original deployment. Only `INTERNAL_API_SECRET` is required; everything
//! else falls back to a sensible default. Invalid values are startup errors,
//! never silently coerced.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Configuration error
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required variable is absent
    #[error("missing required env var {0}")]
    Missing(&'static str),

    /// A variable is present but unparseable
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

/// Broker session configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub ca_cert_path: Option<PathBuf>,
    /// Subscription pattern, MQTT wildcards allowed
    pub topic: String,
    /// First topic segment accepted by the classifier
    pub sensor_prefix: String,
    pub client_id: String,
    /// Shared-subscription group; when set the subscription is issued as
    /// `$share/<group>/<topic>`
    pub shared_group: Option<String>,
    pub keepalive: Duration,
    /// How long the initial CONNECT may take before startup fails
    pub connect_timeout: Duration,
}

impl BrokerConfig {
    /// The filter actually sent in SUBSCRIBE, shared-group prefix applied.
    pub fn effective_topic(&self) -> String {
        match &self.shared_group {
            Some(group) => format!("$share/{}/{}", group, self.topic),
            None => self.topic.clone(),
        }
    }
}

/// Batching configuration
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush immediately once the buffer reaches this size
    pub size: usize,
    /// Flush whatever is buffered when this window elapses
    pub window: Duration,
}

/// Control-plane endpoint configuration
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub base_url: String,
    /// Shared bearer secret for service-to-service auth
    pub secret: String,
    /// Per-request timeout
    pub timeout: Duration,
}

/// Retry and circuit-breaker tuning
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Attempts beyond the first
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt
    pub retry_base: Duration,
    /// Consecutive failures before the breaker opens
    pub breaker_max_failures: u32,
    /// How long the breaker stays open before admitting a probe
    pub breaker_reset: Duration,
}

/// Full process configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    pub batch: BatchConfig,
    pub control_plane: ControlPlaneConfig,
    pub resilience: ResilienceConfig,
    pub intake_capacity: usize,
    pub health_port: u16,
}

impl Config {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let use_tls = parse_or("BROKER_TLS", env_opt("BROKER_TLS"), false)?;
        let ca_cert_path = env_opt("BROKER_CA_FILE").map(PathBuf::from);
        if use_tls && ca_cert_path.is_none() {
            // With TLS on, the broker is expected to present a cert signed by
            // an operator-supplied CA.
            return Err(ConfigError::Missing("BROKER_CA_FILE"));
        }

        Ok(Self {
            broker: BrokerConfig {
                host: env_or("BROKER_HOST", "localhost"),
                port: parse_or("BROKER_PORT", env_opt("BROKER_PORT"), 1883)?,
                username: env_opt("BROKER_USER"),
                password: env_opt("BROKER_PASS"),
                use_tls,
                ca_cert_path,
                topic: env_or("MQTT_TOPIC", "sensors/#"),
                sensor_prefix: env_or("SENSOR_TOPIC_PREFIX", "sensors"),
                client_id: env_or("MQTT_CLIENT_ID", "virta-ingestor-1"),
                shared_group: env_opt("MQTT_SHARED_GROUP"),
                keepalive: Duration::from_secs(parse_or(
                    "MQTT_KEEPALIVE_SECS",
                    env_opt("MQTT_KEEPALIVE_SECS"),
                    30,
                )?),
                connect_timeout: Duration::from_secs(parse_or(
                    "MQTT_CONNECT_TIMEOUT_SECS",
                    env_opt("MQTT_CONNECT_TIMEOUT_SECS"),
                    10,
                )?),
            },
            batch: BatchConfig {
                size: parse_or("BATCH_SIZE", env_opt("BATCH_SIZE"), 200)?,
                window: Duration::from_millis(parse_or(
                    "BATCH_WINDOW_MS",
                    env_opt("BATCH_WINDOW_MS"),
                    1000,
                )?),
            },
            control_plane: ControlPlaneConfig {
                base_url: env_or("API_SERVICE_URL", "http://localhost:8080"),
                secret: env_opt("INTERNAL_API_SECRET")
                    .ok_or(ConfigError::Missing("INTERNAL_API_SECRET"))?,
                timeout: Duration::from_secs(parse_or(
                    "API_TIMEOUT_SECS",
                    env_opt("API_TIMEOUT_SECS"),
                    30,
                )?),
            },
            resilience: ResilienceConfig {
                max_retries: parse_or("MAX_RETRIES", env_opt("MAX_RETRIES"), 3)?,
                retry_base: Duration::from_millis(parse_or(
                    "RETRY_BASE_MS",
                    env_opt("RETRY_BASE_MS"),
                    1000,
                )?),
                breaker_max_failures: parse_or(
                    "BREAKER_MAX_FAILURES",
                    env_opt("BREAKER_MAX_FAILURES"),
                    5,
                )?,
                breaker_reset: Duration::from_secs(parse_or(
                    "BREAKER_RESET_SECS",
                    env_opt("BREAKER_RESET_SECS"),
                    30,
                )?),
            },
            intake_capacity: parse_or("INTAKE_CAPACITY", env_opt("INTAKE_CAPACITY"), 4096)?,
            health_port: parse_or("HEALTH_PORT", env_opt("HEALTH_PORT"), 8090)?,
        })
    }
}

/// Read a variable, treating empty values as unset.
fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_or(name: &str, default: &str) -> String {
    env_opt(name).unwrap_or_else(|| default.to_string())
}

/// Parse an optional raw value, falling back to a default when absent.
fn parse_or<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr + ParseableFromEnv,
{
    match raw {
        None => Ok(default),
        Some(value) => T::parse_env(&value).ok_or(ConfigError::Invalid { name, value }),
    }
}

/// Env parsing with the original loader's boolean spelling (1/0/true/false).
trait ParseableFromEnv: Sized {
    fn parse_env(value: &str) -> Option<Self>;
}

macro_rules! parse_via_fromstr {
    ($($ty:ty),*) => {
        $(impl ParseableFromEnv for $ty {
            fn parse_env(value: &str) -> Option<Self> {
                value.parse().ok()
            }
        })*
    };
}

parse_via_fromstr!(u16, u32, u64, usize);

impl ParseableFromEnv for bool {
    fn parse_env(value: &str) -> Option<Self> {
        match value {
            "1" | "true" | "TRUE" => Some(true),
            "0" | "false" | "FALSE" => Some(false),
            _ => None,
        }
    }
}
