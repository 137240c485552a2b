//! Bus events and their JSON wire form
//!
//! Every telegram crossing the bridge is an [`Event`]. On the broker side it
//! travels as a JSON object:
//!
//! ```json
//! {"Time":"2024-03-01T12:00:05+01:00","Gateway":"192.168.1.11:3671",
//!  "Command":"Write","Source":"1.1.10","Destination":"1/2/3","Data":"AQ=="}
//! ```
//!
//! `Time` is RFC 3339 with second precision and `Data` is standard padded
//! base64. Commands arriving from the broker may spell the command in lower
//! case and may omit `Time`, `Gateway` and `Source`.

use std::fmt;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use chrono::{DateTime, FixedOffset, Local, SecondsFormat, SubsecRound};
use serde::{Deserialize, Serialize};

use crate::knx::{AddressError, GroupAddr, GroupCommand, GroupEvent, IndividualAddr};

/// A group telegram observed on, or destined for, the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub time: DateTime<FixedOffset>,
    /// Name of the link that carried the telegram
    pub gateway: String,
    pub command: GroupCommand,
    pub source: IndividualAddr,
    pub destination: GroupAddr,
    pub data: Vec<u8>,
}

impl Event {
    /// Stamp a telegram received from `gateway` with the current time
    pub fn from_bus(gateway: &str, event: GroupEvent) -> Self {
        Self {
            time: now(),
            gateway: gateway.to_string(),
            command: event.command,
            source: event.source,
            destination: event.destination,
            data: event.data,
        }
    }

    pub fn to_group_event(&self) -> GroupEvent {
        GroupEvent {
            command: self.command,
            source: self.source,
            destination: self.destination,
            data: self.data.clone(),
        }
    }

    /// Topic suffix under the raw prefix
    pub fn topic(&self, prefix: &str) -> String {
        format!("{}/{}", prefix, self.destination.topic_path())
    }

    pub fn to_json(&self) -> String {
        let wire = WireEvent {
            time: Some(self.time.to_rfc3339_opts(SecondsFormat::Secs, true)),
            gateway: self.gateway.clone(),
            command: self.command.as_str().to_string(),
            source: self.source.to_string(),
            destination: self.destination.to_string(),
            data: BASE64_STANDARD.encode(&self.data),
        };
        // Only strings are serialized, this cannot fail
        serde_json::to_string(&wire).unwrap_or_default()
    }

    pub fn from_json(payload: &[u8]) -> Result<Self, WireError> {
        let wire: WireEvent = serde_json::from_slice(payload).map_err(WireError::Json)?;

        let time = match wire.time.as_deref() {
            Some(t) if !t.is_empty() => DateTime::parse_from_rfc3339(t)
                .map_err(|e| WireError::Time(e.to_string()))?
                .trunc_subsecs(0),
            _ => now(),
        };
        let command = wire.command.parse().map_err(WireError::Command)?;
        let source = if wire.source.is_empty() {
            IndividualAddr::default()
        } else {
            wire.source.parse().map_err(WireError::Address)?
        };
        let destination = wire.destination.parse().map_err(WireError::Address)?;
        let data = BASE64_STANDARD
            .decode(wire.data.as_bytes())
            .map_err(|e| WireError::Data(e.to_string()))?;

        Ok(Self {
            time,
            gateway: wire.gateway,
            command,
            source,
            destination,
            data,
        })
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<{}> {}: {} -> {} {:?}",
            self.gateway, self.command, self.source, self.destination, self.data
        )
    }
}

fn now() -> DateTime<FixedOffset> {
    Local::now().fixed_offset().trunc_subsecs(0)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time: Option<String>,
    #[serde(default)]
    gateway: String,
    command: String,
    #[serde(default)]
    source: String,
    destination: String,
    #[serde(default)]
    data: String,
}

/// Errors decoding a JSON wire event
#[derive(Debug)]
pub enum WireError {
    Json(serde_json::Error),
    Time(String),
    Command(String),
    Address(AddressError),
    Data(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Json(e) => write!(f, "invalid JSON: {}", e),
            WireError::Time(e) => write!(f, "invalid Time: {}", e),
            WireError::Command(e) => write!(f, "invalid Command: {}", e),
            WireError::Address(e) => write!(f, "{}", e),
            WireError::Data(e) => write!(f, "invalid Data: {}", e),
        }
    }
}

impl std::error::Error for WireError {}
