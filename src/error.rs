//! # Error Types
//!
//! This module defines the error types used throughout the client core, from wire-level
//! protocol violations up to the failures surfaced to the host application.

use core::fmt;

/// The primary error enum surfaced to the host, either as a command failure or inside a
/// `DeliveryFailed` / `SubscriptionError` / `ConnectionFailed` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MqttError {
    /// An error occurred in the underlying transport layer.
    Transport,
    /// A protocol-level error occurred, indicating a violation of the MQTT specification.
    Protocol(ProtocolError),
    /// The connection was refused by the broker. The enclosed code provides the reason.
    ConnectRejected(ConnectReturnCode),
    /// No CONNACK arrived within the configured connect timeout.
    ConnectTimeout,
    /// A connection attempt is already in progress.
    AlreadyConnecting,
    /// The client is already connected.
    AlreadyConnected,
    /// The client is not currently connected to the broker.
    NotConnected,
    /// The broker returned a failure code for a subscription.
    SubscribeRejected,
    /// A message exhausted its retry budget without being acknowledged.
    DeliveryAbandoned,
    /// A message outlived the configured retention timeout.
    Expired,
    /// The operation was preempted by a disconnect or shutdown.
    Cancelled,
    /// The reconnect attempt budget ran out.
    ReconnectExhausted,
    /// A topic name or topic filter is not valid.
    InvalidTopic,
    /// The connect options violate a protocol rule.
    InvalidOptions,
}

impl From<ProtocolError> for MqttError {
    fn from(err: ProtocolError) -> Self {
        MqttError::Protocol(err)
    }
}

impl fmt::Display for MqttError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MqttError::Transport => f.write_str("transport failure"),
            MqttError::Protocol(p) => write!(f, "protocol error: {p}"),
            MqttError::ConnectRejected(code) => write!(f, "connection refused: {code}"),
            MqttError::ConnectTimeout => f.write_str("timed out waiting for CONNACK"),
            MqttError::AlreadyConnecting => f.write_str("connection attempt already in progress"),
            MqttError::AlreadyConnected => f.write_str("already connected"),
            MqttError::NotConnected => f.write_str("not connected"),
            MqttError::SubscribeRejected => f.write_str("subscription rejected by broker"),
            MqttError::DeliveryAbandoned => f.write_str("delivery abandoned after retries"),
            MqttError::Expired => f.write_str("message expired before delivery"),
            MqttError::Cancelled => f.write_str("operation cancelled"),
            MqttError::ReconnectExhausted => f.write_str("reconnect attempts exhausted"),
            MqttError::InvalidTopic => f.write_str("invalid topic"),
            MqttError::InvalidOptions => f.write_str("invalid connect options"),
        }
    }
}

/// Represents the return codes of a `CONNACK` packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectReturnCode {
    /// The connection was accepted.
    Accepted,
    /// The broker does not support the requested MQTT protocol version.
    UnacceptableProtocolVersion,
    /// The client identifier is not valid.
    IdentifierRejected,
    /// The broker is unavailable.
    ServerUnavailable,
    /// The username or password is not valid.
    BadUserNameOrPassword,
    /// The client is not authorized to connect.
    NotAuthorized,
    /// A code outside the range defined by MQTT 3.1.1.
    Other(u8),
}

impl ConnectReturnCode {
    /// Whether a reconnect loop should keep trying after this refusal.
    pub fn is_transient(self) -> bool {
        matches!(self, ConnectReturnCode::ServerUnavailable)
    }
}

impl From<u8> for ConnectReturnCode {
    fn from(val: u8) -> Self {
        match val {
            0 => Self::Accepted,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadUserNameOrPassword,
            5 => Self::NotAuthorized,
            _ => Self::Other(val),
        }
    }
}

impl From<ConnectReturnCode> for u8 {
    fn from(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::Accepted => 0,
            ConnectReturnCode::UnacceptableProtocolVersion => 1,
            ConnectReturnCode::IdentifierRejected => 2,
            ConnectReturnCode::ServerUnavailable => 3,
            ConnectReturnCode::BadUserNameOrPassword => 4,
            ConnectReturnCode::NotAuthorized => 5,
            ConnectReturnCode::Other(val) => val,
        }
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectReturnCode::Accepted => f.write_str("accepted"),
            ConnectReturnCode::UnacceptableProtocolVersion => {
                f.write_str("unacceptable protocol version")
            }
            ConnectReturnCode::IdentifierRejected => f.write_str("identifier rejected"),
            ConnectReturnCode::ServerUnavailable => f.write_str("server unavailable"),
            ConnectReturnCode::BadUserNameOrPassword => f.write_str("bad user name or password"),
            ConnectReturnCode::NotAuthorized => f.write_str("not authorized"),
            ConnectReturnCode::Other(code) => write!(f, "unknown return code {code}"),
        }
    }
}

/// Enumerates specific MQTT protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// An invalid packet type was received.
    InvalidPacketType(u8),
    /// The fixed-header flags do not match the packet type.
    InvalidFlags(u8),
    /// A QoS value of 3 was encountered.
    InvalidQoS(u8),
    /// A QoS > 0 packet carried packet identifier 0.
    ZeroPacketId,
    /// A packet was received that was not correctly formed.
    MalformedPacket,
    /// The packet exceeds the maximum allowable size.
    PayloadTooLarge,
    /// A string was not valid UTF-8.
    InvalidUtf8String,
    /// The broker sent a packet that is not valid in the current state.
    UnexpectedPacket(u8),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidPacketType(t) => write!(f, "invalid packet type {t}"),
            ProtocolError::InvalidFlags(b) => write!(f, "invalid fixed header flags {b:#04x}"),
            ProtocolError::InvalidQoS(q) => write!(f, "invalid QoS {q}"),
            ProtocolError::ZeroPacketId => f.write_str("packet identifier 0"),
            ProtocolError::MalformedPacket => f.write_str("malformed packet"),
            ProtocolError::PayloadTooLarge => f.write_str("packet too large"),
            ProtocolError::InvalidUtf8String => f.write_str("invalid UTF-8 string"),
            ProtocolError::UnexpectedPacket(t) => write!(f, "unexpected packet type {t}"),
        }
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DisconnectReason {
    /// The host asked for the disconnect.
    Requested,
    /// The transport failed or the peer closed the stream.
    Transport,
    /// The broker sent something malformed or out of place.
    Protocol(ProtocolError),
    /// A PINGREQ went unanswered for the grace period.
    PingTimeout,
    /// No CONNACK arrived in time.
    ConnectTimeout,
    /// The broker refused the connection.
    ConnectRejected(ConnectReturnCode),
}

impl From<DisconnectReason> for MqttError {
    fn from(reason: DisconnectReason) -> Self {
        match reason {
            DisconnectReason::Requested => MqttError::Cancelled,
            DisconnectReason::Transport | DisconnectReason::PingTimeout => MqttError::Transport,
            DisconnectReason::Protocol(p) => MqttError::Protocol(p),
            DisconnectReason::ConnectTimeout => MqttError::ConnectTimeout,
            DisconnectReason::ConnectRejected(code) => MqttError::ConnectRejected(code),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Requested => f.write_str("requested"),
            DisconnectReason::Transport => f.write_str("transport lost"),
            DisconnectReason::Protocol(p) => write!(f, "{p}"),
            DisconnectReason::PingTimeout => f.write_str("ping timeout"),
            DisconnectReason::ConnectTimeout => f.write_str("connect timeout"),
            DisconnectReason::ConnectRejected(code) => write!(f, "refused: {code}"),
        }
    }
}
