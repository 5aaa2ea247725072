//! Connection and engine configuration.

use alloc::string::String;
use alloc::vec::Vec;

use embassy_time::Duration;

use crate::error::MqttError;
use crate::packet::{Connect, LastWill, QoS};

/// In-flight window used until a `connect` says otherwise.
pub const DEFAULT_MAX_INFLIGHT: u16 = 10;

/// How the event dispatcher treats a host that is slow to consume events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeliveryMode {
    /// Stop processing protocol input until the host makes room in the event channel.
    #[default]
    Block,
    /// Keep processing and hold undelivered events in an unbounded FIFO.
    Buffer,
}

/// Engine-wide settings that do not change between connections.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub delivery_mode: DeliveryMode,
    /// Largest frame accepted from or offered to the broker.
    pub max_packet_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::Block,
            max_packet_size: 64 * 1024,
        }
    }
}

/// The last-will message the broker publishes if the client vanishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Options for one `connect` call.
///
/// Built with [`ConnectOptions::new`] and the `with_*` methods:
///
/// ```ignore
/// let options = ConnectOptions::new("sensor-01")
///     .with_credentials("user", b"secret")
///     .with_keep_alive(Duration::from_secs(30))
///     .with_max_inflight(4);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub will: Option<Will>,
    pub connect_timeout: Duration,
    /// How long a PINGREQ may go unanswered. Defaults to the keep-alive interval.
    pub ping_timeout: Option<Duration>,
    pub auto_reconnect: bool,
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    pub max_inflight: u16,
    /// Resends allowed per message after the first transmission.
    pub max_retries: u32,
    /// Resend interval for unacknowledged messages while the connection stays up.
    pub retry_interval: Option<Duration>,
    /// Queued or in-flight messages older than this fail with `Expired`.
    pub message_retention: Option<Duration>,
    pub jitter_seed: u64,
}

impl ConnectOptions {
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: String::from(client_id),
            username: None,
            password: None,
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            will: None,
            connect_timeout: Duration::from_secs(30),
            ping_timeout: None,
            auto_reconnect: true,
            reconnect_base: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            max_reconnect_attempts: None,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            max_retries: 3,
            retry_interval: None,
            message_retention: None,
            jitter_seed: 0,
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &[u8]) -> Self {
        self.username = Some(String::from(username));
        self.password = Some(password.to_vec());
        self
    }

    pub fn with_username(mut self, username: &str) -> Self {
        self.username = Some(String::from(username));
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn with_will(mut self, topic: &str, payload: &[u8], qos: QoS, retain: bool) -> Self {
        self.will = Some(Will {
            topic: String::from(topic),
            payload: payload.to_vec(),
            qos,
            retain,
        });
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = Some(timeout);
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base = base;
        self.reconnect_max = max;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = Some(attempts);
        self
    }

    pub fn with_max_inflight(mut self, window: u16) -> Self {
        self.max_inflight = window;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    pub fn with_message_retention(mut self, retention: Duration) -> Self {
        self.message_retention = Some(retention);
        self
    }

    pub fn with_jitter_seed(mut self, seed: u64) -> Self {
        self.jitter_seed = seed;
        self
    }

    /// Effective grace period for PINGRESP.
    pub fn ping_grace(&self) -> Duration {
        self.ping_timeout.unwrap_or(self.keep_alive)
    }

    /// Checks the protocol rules the broker would otherwise reject.
    pub fn validate(&self) -> Result<(), MqttError> {
        // MQTT-3.1.3-7: a zero-length client id requires a clean session.
        if self.client_id.is_empty() && !self.clean_session {
            return Err(MqttError::InvalidOptions);
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(MqttError::InvalidOptions);
        }
        if self.keep_alive.as_secs() > u16::MAX as u64 {
            return Err(MqttError::InvalidOptions);
        }
        if self.max_inflight == 0 {
            return Err(MqttError::InvalidOptions);
        }
        if let Some(will) = &self.will {
            crate::topic::validate_topic_name(&will.topic)?;
        }
        Ok(())
    }

    /// The CONNECT packet these options describe.
    pub fn connect_packet(&self) -> Connect<'_> {
        Connect {
            client_id: &self.client_id,
            keep_alive: self.keep_alive.as_secs() as u16,
            clean_session: self.clean_session,
            username: self.username.as_deref(),
            password: self.password.as_deref(),
            will: self.will.as_ref().map(|will| LastWill {
                topic: &will.topic,
                payload: &will.payload,
                qos: will.qos,
                retain: will.retain,
            }),
        }
    }
}
