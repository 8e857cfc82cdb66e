//! Client and server configuration.
//!
//! Configuration is read once from TOML and validated; the resulting structs
//! are never mutated afterwards. Durations are written as (fractional)
//! seconds.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for every configured duration.
const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Error loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// One candidate server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub url: String,
    #[serde(default)]
    pub name: String,
    /// Lower is preferred.
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Handshake timeout; falls back to `websocket.timeout`.
    #[serde(default, with = "secs::option", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, name: impl Into<String>, priority: u32) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
            priority,
            enabled: true,
            timeout: None,
            description: String::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// WebSocket-layer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    #[serde(with = "secs")]
    pub timeout: Duration,
    #[serde(with = "secs")]
    pub ping_interval: Duration,
    #[serde(with = "secs")]
    pub ping_timeout: Duration,
    pub max_message_size: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(10),
            max_message_size: 1024 * 1024,
        }
    }
}

/// Reconnect policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "secs")]
    pub retry_interval: Duration,
    #[serde(with = "secs")]
    pub max_retry_interval: Duration,
    pub exponential_backoff: bool,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_interval: Duration::from_secs(3),
            max_retry_interval: Duration::from_secs(60),
            exponential_backoff: true,
            jitter: true,
        }
    }
}

/// Defaults applied to inference requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    pub max_tokens: u32,
    pub default_system_prompt: String,
    #[serde(with = "secs")]
    pub request_timeout: Duration,
    pub temperature: f32,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            default_system_prompt: "你是一个友好的AI助手。".to_string(),
            request_timeout: Duration::from_secs(30),
            temperature: 0.7,
        }
    }
}

/// Liveness probing of an established connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    #[serde(with = "secs")]
    pub interval: Duration,
    /// How long to wait for a pong after each ping.
    #[serde(with = "secs")]
    pub timeout: Duration,
    pub max_failures: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            max_failures: 5,
        }
    }
}

/// Everything a client needs to connect and stay connected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub servers: Vec<Endpoint>,
    pub websocket: SocketConfig,
    pub retry: RetryConfig,
    pub request: RequestConfig,
    pub health_check: HealthCheckConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::with_endpoints(vec![Endpoint::new("ws://localhost:8000", "local", 1)])
    }
}

impl ClientConfig {
    /// Default settings with the given endpoint list.
    pub fn with_endpoints(servers: Vec<Endpoint>) -> Self {
        Self {
            servers,
            websocket: SocketConfig::default(),
            retry: RetryConfig::default(),
            request: RequestConfig::default(),
            health_check: HealthCheckConfig::default(),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = load_toml(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, server) in self.servers.iter().enumerate() {
            if server.url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("servers[{i}].url is empty")));
            }
            if let Some(timeout) = server.timeout {
                bounded(&format!("servers[{i}].timeout"), timeout)?;
            }
        }
        bounded("retry.max_retry_interval", self.retry.max_retry_interval)?;
        bounded("request.request_timeout", self.request.request_timeout)?;
        bounded("health_check.interval", self.health_check.interval)?;
        bounded("health_check.timeout", self.health_check.timeout)?;
        if self.retry.retry_interval > self.retry.max_retry_interval {
            return Err(ConfigError::Invalid(
                "retry.retry_interval exceeds retry.max_retry_interval".into(),
            ));
        }
        if self.request.request_timeout.is_zero() {
            return Err(ConfigError::Invalid("request.request_timeout must be positive".into()));
        }
        if self.health_check.enabled
            && (self.health_check.interval.is_zero() || self.health_check.max_failures == 0)
        {
            return Err(ConfigError::Invalid(
                "health_check.interval and health_check.max_failures must be positive".into(),
            ));
        }
        self.websocket.validate()
    }

    /// Enabled endpoints in connection order.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        let mut servers: Vec<Endpoint> =
            self.servers.iter().filter(|s| s.enabled).cloned().collect();
        servers.sort_by_key(|s| s.priority);
        servers
    }

    /// Handshake timeout for an endpoint.
    pub fn connect_timeout(&self, endpoint: &Endpoint) -> Duration {
        endpoint.timeout.unwrap_or(self.websocket.timeout)
    }
}

impl SocketConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid("websocket.max_message_size must be positive".into()));
        }
        if self.ping_interval.is_zero() {
            return Err(ConfigError::Invalid("websocket.ping_interval must be positive".into()));
        }
        bounded("websocket.timeout", self.timeout)?;
        bounded("websocket.ping_interval", self.ping_interval)?;
        bounded("websocket.ping_timeout", self.ping_timeout)
    }
}

/// Listener settings for a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub name: String,
    pub websocket: SocketConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: ([0, 0, 0, 0], 8000).into(),
            name: "voicelink".to_string(),
            websocket: SocketConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.websocket.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = load_toml(path.as_ref())?;
        config.websocket.validate()?;
        Ok(config)
    }
}

fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&text)?)
}

fn bounded(name: &str, value: Duration) -> Result<(), ConfigError> {
    if value > MAX_DURATION {
        return Err(ConfigError::Invalid(format!(
            "{name} exceeds {} seconds",
            MAX_DURATION.as_secs()
        )));
    }
    Ok(())
}

fn default_priority() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// Durations as seconds.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_some(&d.as_secs_f64()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<f64>::deserialize(d)?
                .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[servers]]
url = "ws://10.0.0.2:8000"
name = "backup"
priority = 2

[[servers]]
url = "ws://10.0.0.1:8000"
name = "primary"
priority = 1
timeout = 2.5

[[servers]]
url = "ws://10.0.0.3:8000"
name = "retired"
priority = 0
enabled = false

[retry]
max_retries = 4
retry_interval = 1

[health_check]
interval = 10
max_failures = 3
"#;

    #[test]
    fn parses_and_orders_endpoints() {
        let config = ClientConfig::from_toml_str(SAMPLE).unwrap();
        let names: Vec<_> = config.endpoints().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["primary", "backup"]);

        let primary = &config.endpoints()[0];
        assert_eq!(config.connect_timeout(primary), Duration::from_millis(2500));
        let backup = &config.endpoints()[1];
        assert_eq!(config.connect_timeout(backup), Duration::from_secs(60));
    }

    #[test]
    fn missing_sections_take_defaults() {
        let config = ClientConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.retry.max_retries, 4);
        assert_eq!(config.retry.retry_interval, Duration::from_secs(1));
        assert_eq!(config.retry.max_retry_interval, Duration::from_secs(60));
        assert!(config.retry.jitter);
        assert_eq!(config.health_check.timeout, Duration::from_secs(5));
        assert_eq!(config.request, RequestConfig::default());
        assert_eq!(config.websocket.max_message_size, 1_048_576);
    }

    #[test]
    fn rejects_inconsistent_settings() {
        let err = ClientConfig::from_toml_str(
            "[retry]\nretry_interval = 90\nmax_retry_interval = 60\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = ClientConfig::from_toml_str("[[servers]]\nurl = \"\"\n").unwrap_err();
        assert!(err.to_string().contains("servers[0].url"));

        assert!(matches!(
            ClientConfig::from_toml_str("[retry]\nmax_retries = \"many\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn rejects_durations_past_a_year() {
        let err = ClientConfig::from_toml_str("[request]\nrequest_timeout = 1e12\n").unwrap_err();
        assert!(err.to_string().contains("request.request_timeout"));

        let err = ServerConfig::from_toml_str("[websocket]\nping_timeout = 1e12\n").unwrap_err();
        assert!(err.to_string().contains("websocket.ping_timeout"));

        assert!(ClientConfig::from_toml_str("[request]\nrequest_timeout = 3600\n").is_ok());
    }

    #[test]
    fn server_config_defaults() {
        let config = ServerConfig::from_toml_str("bind = \"127.0.0.1:9000\"\n").unwrap();
        assert_eq!(config.bind.port(), 9000);
        assert_eq!(config.name, "voicelink");
        assert_eq!(config.websocket.ping_interval, Duration::from_secs(20));
    }

    #[test]
    fn demo_client_config_matches_defaults() {
        let text = include_str!("../../../demos/voice-client/client.toml");
        let config = ClientConfig::from_toml_str(text).unwrap();
        let names: Vec<_> = config.endpoints().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["local", "backup"]);
        assert_eq!(config.connect_timeout(&config.servers[0]), Duration::from_secs(5));
        assert_eq!(config.websocket, SocketConfig::default());
        assert_eq!(config.retry, RetryConfig::default());
        assert_eq!(config.request, RequestConfig::default());
        assert_eq!(config.health_check, HealthCheckConfig::default());
    }
}
