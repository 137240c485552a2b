//! KNX bus access
//!
//! Group-level view of a KNX installation: addresses, group events, and the
//! transport abstraction a bus link connects through. The default transport
//! is a KNXnet/IP tunnel ([`KnxTunnelConnector`]).

mod address;
mod cemi;
mod frame;
mod tunnel;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use address::{AddressError, GroupAddr, IndividualAddr};
pub use cemi::LData;
pub use frame::{Frame, Hpai};
pub use tunnel::{KnxTunnelConnector, TunnelConfig};

/// Default KNXnet/IP port
pub const KNX_DEFAULT_PORT: u16 = 3671;

/// Group-value service of a bus telegram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupCommand {
    Read,
    Response,
    Write,
}

impl GroupCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupCommand::Read => "Read",
            GroupCommand::Response => "Response",
            GroupCommand::Write => "Write",
        }
    }
}

impl fmt::Display for GroupCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" | "Read" => Ok(GroupCommand::Read),
            "response" | "Response" => Ok(GroupCommand::Response),
            "write" | "Write" => Ok(GroupCommand::Write),
            other => Err(format!("unknown group command {:?}", other)),
        }
    }
}

/// A group telegram as seen on (or sent to) the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEvent {
    pub command: GroupCommand,
    pub source: IndividualAddr,
    pub destination: GroupAddr,
    pub data: Vec<u8>,
}

/// Errors decoding KNXnet/IP or cEMI frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame shorter than its declared or minimum length
    Truncated,
    /// Header length or protocol version mismatch
    InvalidHeader,
    /// Service type not handled by the tunnelling client
    UnsupportedService(u16),
    /// cEMI message code other than L_Data
    UnsupportedMessageCode(u8),
    /// Application service other than group-value read/response/write
    UnsupportedApci(u8),
    /// Destination is an individual address
    NotGroupAddressed,
    /// Payload does not fit a standard frame
    PayloadTooLarge(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated frame"),
            Self::InvalidHeader => write!(f, "invalid KNXnet/IP header"),
            Self::UnsupportedService(s) => write!(f, "unsupported service type 0x{:04x}", s),
            Self::UnsupportedMessageCode(c) => write!(f, "unsupported cEMI message code 0x{:02x}", c),
            Self::UnsupportedApci(a) => write!(f, "unsupported APCI 0x{:x}", a),
            Self::NotGroupAddressed => write!(f, "destination is not a group address"),
            Self::PayloadTooLarge(n) => write!(f, "payload of {} bytes too large", n),
        }
    }
}

impl std::error::Error for FrameError {}

/// Errors surfaced by a bus transport
#[derive(Debug)]
pub enum BusError {
    /// Could not establish the connection
    ConnectFailed(String),
    /// Gateway refused the connection (KNXnet/IP status code)
    Rejected(u8),
    /// Operation timed out
    Timeout,
    /// The connection is gone
    ConnectionLost(String),
    /// Frame could not be encoded
    Frame(FrameError),
    Io(std::io::Error),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::ConnectFailed(msg) => write!(f, "Connect failed: {}", msg),
            BusError::Rejected(status) => write!(f, "Rejected by gateway (status 0x{:02x})", status),
            BusError::Timeout => write!(f, "Operation timed out"),
            BusError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            BusError::Frame(e) => write!(f, "Frame error: {}", e),
            BusError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for BusError {}

impl From<std::io::Error> for BusError {
    fn from(e: std::io::Error) -> Self {
        BusError::Io(e)
    }
}

impl From<FrameError> for BusError {
    fn from(e: FrameError) -> Self {
        BusError::Frame(e)
    }
}

/// Outbound half of a live bus connection
#[async_trait]
pub trait BusSender: Send + Sync {
    /// Transmit one group telegram
    async fn send(&self, event: GroupEvent) -> Result<(), BusError>;
}

/// A live bus connection
///
/// The inbound channel closing means the connection is gone.
pub struct BusConnection {
    pub inbound: mpsc::Receiver<GroupEvent>,
    pub sender: Arc<dyn BusSender>,
}

/// Opens connections to a gateway endpoint
#[async_trait]
pub trait BusConnector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str) -> Result<BusConnection, BusError>;
}

/// Append the default KNXnet/IP port to an endpoint without one
pub fn normalize_endpoint(endpoint: &str) -> String {
    if endpoint.contains(':') {
        endpoint.to_string()
    } else {
        format!("{}:{}", endpoint, KNX_DEFAULT_PORT)
    }
}
