use http::{HeaderName, HeaderValue};
use std::time::Duration;
use url::Url;

/// Configuration for the realtime client
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Base URL of the backend (http, https, ws or wss)
    pub url: Url,
    /// Path of the realtime socket endpoint, appended to the base URL
    pub realtime_path: String,
    /// API key sent as the `apikey` query parameter
    pub api_key: Option<String>,
    /// Interval between heartbeat frames while connected
    pub heartbeat_interval: Duration,
    /// Backoff settings for reconnection
    pub backoff: BackoffConfig,
    /// Transport-level settings
    pub transport: TransportConfig,
}

impl RealtimeConfig {
    /// Create a new builder for the given base URL
    pub fn builder(url: impl Into<String>) -> RealtimeConfigBuilder {
        RealtimeConfigBuilder {
            url: url.into(),
            realtime_path: "/realtime".to_string(),
            api_key: None,
            heartbeat_interval: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

/// Builder for RealtimeConfig
#[derive(Debug, Clone)]
pub struct RealtimeConfigBuilder {
    url: String,
    realtime_path: String,
    api_key: Option<String>,
    heartbeat_interval: Duration,
    backoff: BackoffConfig,
    transport: TransportConfig,
}

impl RealtimeConfigBuilder {
    /// Set the realtime endpoint path
    pub fn realtime_path(mut self, path: impl Into<String>) -> Self {
        self.realtime_path = path.into();
        self
    }

    /// Set the API key
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the heartbeat interval
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set backoff configuration
    pub fn backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = config;
        self
    }

    /// Set transport configuration
    pub fn transport(mut self, config: TransportConfig) -> Self {
        self.transport = config;
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<RealtimeConfig, ConfigError> {
        let url = Url::parse(&self.url).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(ConfigError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        if self.backoff.max_delay < self.backoff.initial_delay {
            return Err(ConfigError::InvalidBackoff(
                "max_delay must be >= initial_delay".to_string(),
            ));
        }

        if self.backoff.multiplier < 1.0 {
            return Err(ConfigError::InvalidBackoff(
                "multiplier must be >= 1".to_string(),
            ));
        }

        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidHeartbeat(
                "heartbeat_interval cannot be 0".to_string(),
            ));
        }

        Ok(RealtimeConfig {
            url,
            realtime_path: self.realtime_path,
            api_key: self.api_key,
            heartbeat_interval: self.heartbeat_interval,
            backoff: self.backoff,
            transport: self.transport,
        })
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Base URL could not be used
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid heartbeat configuration
    #[error("Invalid heartbeat configuration: {0}")]
    InvalidHeartbeat(String),
}

/// Backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnection attempt
    pub initial_delay: Duration,
    /// Maximum delay between reconnection attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        // Clamp so the cast cannot wrap negative; an infinite product is capped below
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        if self.jitter {
            // Full jitter: random value between 0 and capped_delay
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }
}

/// Settings for the WebSocket transport
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Timeout for establishing a connection (TCP, TLS and upgrade)
    pub connect_timeout: Duration,
    /// Extra headers sent with the upgrade request
    pub headers: Vec<(HeaderName, HeaderValue)>,
    /// Disable Nagle's algorithm on the TCP socket
    pub tcp_nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            headers: Vec::new(),
            tcp_nodelay: true,
        }
    }
}
