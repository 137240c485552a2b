//! Wire errors

use std::fmt;

/// Why a byte buffer is not (yet) a valid MQTT 3.1.1 packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// More bytes are needed; not an error on a stream
    InsufficientData,
    InvalidPacketType(u8),
    InvalidRemainingLength,
    InvalidProtocolName,
    InvalidProtocolVersion(u8),
    InvalidQoS(u8),
    InvalidUtf8,
    InvalidFlags,
    InvalidReturnCode(u8),
    MalformedPacket(&'static str),
    /// Larger than the decoder's configured limit
    PacketTooLarge,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => f.write_str("incomplete packet"),
            Self::InvalidPacketType(t) => write!(f, "unknown packet type {}", t),
            Self::InvalidRemainingLength => f.write_str("bad remaining length"),
            Self::InvalidProtocolName => f.write_str("protocol name is not MQTT"),
            Self::InvalidProtocolVersion(v) => write!(f, "unsupported protocol level {}", v),
            Self::InvalidQoS(q) => write!(f, "QoS {} out of range", q),
            Self::InvalidUtf8 => f.write_str("string is not UTF-8"),
            Self::InvalidFlags => f.write_str("reserved flags set"),
            Self::InvalidReturnCode(c) => write!(f, "unknown return code {}", c),
            Self::MalformedPacket(why) => write!(f, "malformed packet: {}", why),
            Self::PacketTooLarge => f.write_str("packet exceeds size limit"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    PacketTooLarge,
    /// String or binary field over 65535 bytes
    StringTooLong,
    /// Wildcards or an empty name in a PUBLISH topic
    InvalidTopicName,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => f.write_str("packet exceeds 256 MB"),
            Self::StringTooLong => f.write_str("field exceeds 65535 bytes"),
            Self::InvalidTopicName => f.write_str("topic name not publishable"),
        }
    }
}

impl std::error::Error for EncodeError {}
