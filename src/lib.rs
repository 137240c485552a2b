//! knx2mqtt - Bidirectional KNX/IP to MQTT bridge
//!
//! Connects to one or more KNXnet/IP gateways and one MQTT broker. Bus
//! telegrams are published as JSON events; commands from the broker are
//! routed to the gateway whose link has carried traffic for the nearest
//! group address.

pub mod bridge;
pub mod bus;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod dpt;
pub mod event;
pub mod eventlog;
pub mod knx;
pub mod mqtt;
pub mod protocol;
pub mod topic;

pub use bridge::{Bridge, BridgeOptions};
pub use bus::{Bus, BusOptions};
pub use catalog::Catalog;
pub use config::Config;
pub use event::Event;
pub use mqtt::{BrokerClient, MqttOptions};
pub use protocol::QoS;
