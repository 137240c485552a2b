//! MQTT broker side
//!
//! [`MqttSession`] owns a single broker connection. [`BrokerClient`] wraps
//! sessions into one logical connection that reconnects on its own and
//! replays every subscription afterwards.

mod client;
pub mod session;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::protocol::{ConnectReturnCode, DecodeError, EncodeError};

pub use client::{BrokerClient, Subscription};
pub use session::MqttSession;

/// Default MQTT port
pub const MQTT_DEFAULT_PORT: u16 = 1883;

/// A message received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

/// Connection parameters for the broker
#[derive(Debug, Clone)]
pub struct MqttOptions {
    /// Broker address (`host[:port]`)
    pub server: String,
    pub client_id: String,
    /// Keep alive interval in seconds (0 disables PINGREQ)
    pub keep_alive: u16,
    /// Time allowed for TCP connect plus CONNACK
    pub connect_timeout: Duration,
    /// Bound on a single publish or subscribe
    pub operation_timeout: Duration,
    /// Pause between reconnect attempts
    pub reconnect_interval: Duration,
}

impl MqttOptions {
    pub fn new(server: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            client_id: client_id.into(),
            keep_alive: 60,
            connect_timeout: Duration::from_secs(2),
            operation_timeout: Duration::from_secs(1),
            reconnect_interval: Duration::from_millis(500),
        }
    }

    /// Broker address with the default port filled in
    pub fn address(&self) -> String {
        if self.server.contains(':') {
            self.server.clone()
        } else {
            format!("{}:{}", self.server, MQTT_DEFAULT_PORT)
        }
    }
}

/// Errors from the broker connection
#[derive(Debug)]
pub enum MqttError {
    /// Operation did not complete within its timeout
    Timeout,
    /// TCP connection could not be established
    ConnectFailed(String),
    /// Broker answered CONNECT with a non-zero return code
    Rejected(ConnectReturnCode),
    /// The session is gone
    ConnectionLost(String),
    /// Broker refused a subscription
    SubscribeRefused(String),
    /// Topic name or filter is not valid
    InvalidTopic(&'static str),
    Encode(EncodeError),
    Decode(DecodeError),
    Io(std::io::Error),
}

impl fmt::Display for MqttError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MqttError::Timeout => write!(f, "Operation timed out"),
            MqttError::ConnectFailed(msg) => write!(f, "Connect failed: {}", msg),
            MqttError::Rejected(code) => write!(f, "Connection refused: {:?}", code),
            MqttError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            MqttError::SubscribeRefused(filter) => {
                write!(f, "Subscription to '{}' refused", filter)
            }
            MqttError::InvalidTopic(msg) => write!(f, "Invalid topic: {}", msg),
            MqttError::Encode(e) => write!(f, "Encode error: {}", e),
            MqttError::Decode(e) => write!(f, "Decode error: {}", e),
            MqttError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for MqttError {}

impl From<std::io::Error> for MqttError {
    fn from(e: std::io::Error) -> Self {
        MqttError::Io(e)
    }
}

impl From<EncodeError> for MqttError {
    fn from(e: EncodeError) -> Self {
        MqttError::Encode(e)
    }
}

impl From<DecodeError> for MqttError {
    fn from(e: DecodeError) -> Self {
        MqttError::Decode(e)
    }
}
