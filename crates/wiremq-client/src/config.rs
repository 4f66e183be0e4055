//! Client configuration and URI parsing.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::error::{ClientError, Result};

/// Underlying byte-stream flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// Plain TCP (optionally TLS-wrapped).
    #[default]
    Tcp,
    /// MQTT over WebSocket (optionally TLS-wrapped).
    Ws,
}

/// TLS settings.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Whether to wrap the transport in TLS.
    pub enabled: bool,
    /// Path to a PEM CA certificate. System roots are used when absent.
    pub ca_cert: Option<String>,
    /// Client certificate path for mutual TLS.
    pub client_cert: Option<String>,
    /// Client private key path for mutual TLS.
    pub client_key: Option<String>,
    /// Skip certificate verification. Testing only.
    pub accept_invalid_certs: bool,
    /// SNI name override; defaults to the broker host.
    pub server_name: Option<String>,
}

/// Reconnection backoff parameters.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound on the backoff delay.
    pub max_delay: Duration,
    /// Growth factor applied after each failed attempt.
    pub multiplier: f64,
    /// Randomize each delay within 0.5x..1.5x.
    pub jitter: bool,
    /// Give up after this many attempts (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
            max_attempts: 0,
        }
    }
}

/// Client configuration. Immutable once the client is created.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker hostname or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// TCP or WebSocket framing.
    pub transport: TransportKind,
    /// TLS settings.
    pub tls: TlsConfig,
    /// Client identifier.
    pub client_id: String,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<Vec<u8>>,
    /// Keep-alive interval in seconds (0 = disabled).
    pub keep_alive: u16,
    /// Clean session flag.
    pub clean_session: bool,
    /// Timeout covering TCP/TLS setup and the CONNACK wait.
    pub connect_timeout: Duration,
    /// Interval after which an unacknowledged QoS 1/2 publish is re-sent.
    pub retry_interval: Duration,
    /// Retransmissions before a publish is abandoned.
    pub max_retries: u32,
    /// Bound on the queue of publishes issued while disconnected.
    /// Overflow drops the oldest entry.
    pub offline_queue_limit: usize,
    /// Reconnect automatically after an unexpected transport loss.
    pub auto_reconnect: bool,
    /// Backoff parameters for automatic reconnection.
    pub backoff: BackoffConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            transport: TransportKind::Tcp,
            tls: TlsConfig::default(),
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: true,
            connect_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
            max_retries: 5,
            offline_queue_limit: 128,
            auto_reconnect: true,
            backoff: BackoffConfig::default(),
        }
    }
}

fn uri_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:(mqtts?|wss?)://)?([0-9a-zA-Z_\-\.]+)(?::(\d+))?$")
            .expect("uri pattern is valid")
    })
}

impl ClientConfig {
    /// Create a new config for the given host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Parse a broker URI of the form `scheme://host:port`.
    ///
    /// Accepted schemes: `mqtt`, `mqtts`, `ws`, `wss` (`mqtt` when absent).
    /// `mqtts`/`wss` enable TLS; `ws`/`wss` select the WebSocket transport.
    /// The port defaults to 1883/8883/80/443 by scheme. Anything that does
    /// not match is a configuration error.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let captures = uri_regex()
            .captures(uri)
            .ok_or_else(|| ClientError::Config(format!("invalid broker URI: {uri}")))?;

        let scheme = captures.get(1).map_or("mqtt", |m| m.as_str());
        let host = captures[2].to_string();

        let tls = matches!(scheme, "mqtts" | "wss");
        let transport = if matches!(scheme, "ws" | "wss") {
            TransportKind::Ws
        } else {
            TransportKind::Tcp
        };
        let default_port = match scheme {
            "mqtt" => 1883,
            "mqtts" => 8883,
            "ws" => 80,
            _ => 443,
        };
        let port = match captures.get(3) {
            Some(m) => m
                .as_str()
                .parse::<u16>()
                .map_err(|_| ClientError::Config(format!("invalid port in URI: {uri}")))?,
            None => default_port,
        };

        Ok(Self {
            host,
            port,
            transport,
            tls: TlsConfig {
                enabled: tls,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    /// Set the client ID.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Set username and password.
    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep-alive interval in seconds.
    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set the clean session flag.
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Enable or disable automatic reconnection.
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set reconnection backoff parameters.
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the offline publish queue bound.
    pub fn offline_queue_limit(mut self, limit: usize) -> Self {
        self.offline_queue_limit = limit;
        self
    }

    /// Set the publish retransmission interval and retry bound.
    pub fn publish_retry(mut self, interval: Duration, max_retries: u32) -> Self {
        self.retry_interval = interval;
        self.max_retries = max_retries;
        self
    }
}
