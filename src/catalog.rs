//! Address catalog
//!
//! Names for devices (by individual address) and group addresses (with
//! their datapoint type). The catalog renders events for the event log,
//! decodes values for the named topics and resolves named commands.

use std::fmt;

use ahash::AHashMap;

use crate::dpt::{DatapointType, DptError};
use crate::event::Event;
use crate::knx::{GroupAddr, GroupCommand, GroupEvent, IndividualAddr};

/// A catalogued group address
#[derive(Debug, Clone)]
pub struct GroupEntry {
    pub datapoint: &'static DatapointType,
    /// Names the address is published under; never empty
    pub names: Vec<String>,
}

/// Errors building the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    DuplicateDevice(IndividualAddr),
    DuplicateGroup(GroupAddr),
    /// A name used for two group addresses
    DuplicateName(String),
    /// Group without names
    Unnamed(GroupAddr),
    /// Names must be usable as a single topic level
    InvalidName(String),
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::DuplicateDevice(a) => write!(f, "device {} listed twice", a),
            CatalogError::DuplicateGroup(a) => write!(f, "group {} listed twice", a),
            CatalogError::DuplicateName(n) => write!(f, "name {:?} used twice", n),
            CatalogError::Unnamed(a) => write!(f, "group {} has no names", a),
            CatalogError::InvalidName(n) => write!(f, "invalid name {:?}", n),
        }
    }
}

impl std::error::Error for CatalogError {}

/// Errors turning a named command into a telegram
#[derive(Debug, Clone, PartialEq)]
pub enum CommandError {
    /// Not `write|response <name> <value>` or `read <name>`
    Malformed(String),
    UnknownName(String),
    Value(DptError),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandError::Malformed(c) => write!(f, "malformed command {:?}", c),
            CommandError::UnknownName(n) => write!(f, "unknown name {:?}", n),
            CommandError::Value(e) => write!(f, "bad value: {}", e),
        }
    }
}

impl std::error::Error for CommandError {}

#[derive(Debug, Default)]
pub struct Catalog {
    devices: AHashMap<IndividualAddr, String>,
    groups: AHashMap<GroupAddr, GroupEntry>,
    names: AHashMap<String, GroupAddr>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&mut self, address: IndividualAddr, name: &str) -> Result<(), CatalogError> {
        if self.devices.contains_key(&address) {
            return Err(CatalogError::DuplicateDevice(address));
        }
        self.devices.insert(address, name.to_string());
        Ok(())
    }

    pub fn add_group(
        &mut self,
        address: GroupAddr,
        datapoint: &'static DatapointType,
        names: Vec<String>,
    ) -> Result<(), CatalogError> {
        if self.groups.contains_key(&address) {
            return Err(CatalogError::DuplicateGroup(address));
        }
        if names.is_empty() {
            return Err(CatalogError::Unnamed(address));
        }
        for name in &names {
            if name.is_empty() || name.contains(['/', '+', '#', ' ']) {
                return Err(CatalogError::InvalidName(name.clone()));
            }
            if self.names.contains_key(name) {
                return Err(CatalogError::DuplicateName(name.clone()));
            }
        }

        for name in &names {
            self.names.insert(name.clone(), address);
        }
        self.groups.insert(address, GroupEntry { datapoint, names });
        Ok(())
    }

    pub fn device(&self, address: IndividualAddr) -> Option<&str> {
        self.devices.get(&address).map(String::as_str)
    }

    pub fn group(&self, address: GroupAddr) -> Option<&GroupEntry> {
        self.groups.get(&address)
    }

    pub fn resolve(&self, name: &str) -> Option<(GroupAddr, &GroupEntry)> {
        let address = *self.names.get(name)?;
        Some((address, self.groups.get(&address)?))
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.groups.is_empty()
    }

    /// Decoded value carried by a catalogued write or response
    ///
    /// `None` for reads and uncatalogued destinations.
    pub fn value(&self, event: &Event) -> Option<(&GroupEntry, Result<String, DptError>)> {
        if event.command == GroupCommand::Read {
            return None;
        }
        let entry = self.groups.get(&event.destination)?;
        Some((entry, entry.datapoint.decode_text(&event.data)))
    }

    /// One-line rendering for the event log
    ///
    /// `2024-03-01 12:00:05 <gw> Write: 1.1.10 1/2/3=[12 51] thermostat temp=21.50 °C`
    pub fn describe(&self, event: &Event) -> String {
        let mut line = format!(
            "{} <{}> {}: {} {}={}",
            event.time.format("%Y-%m-%d %H:%M:%S"),
            event.gateway,
            event.command,
            event.source,
            event.destination,
            bytes_list(&event.data),
        );
        if let Some(device) = self.device(event.source) {
            line.push(' ');
            line.push_str(device);
        }
        if let Some((entry, Ok(value))) = self.value(event) {
            line.push_str(&format!(" {}={}", entry.names[0], value));
        }
        line
    }

    /// Resolve `write <name> <value>`, `response <name> <value>` or `read <name>`
    pub fn command(&self, text: &str) -> Result<GroupEvent, CommandError> {
        let malformed = || CommandError::Malformed(text.to_string());
        let parts: Vec<&str> = text.split_whitespace().collect();

        let (command, name, value) = match parts.as_slice() {
            ["read", name] => (GroupCommand::Read, *name, None),
            ["write", name, value] => (GroupCommand::Write, *name, Some(*value)),
            ["response", name, value] => (GroupCommand::Response, *name, Some(*value)),
            _ => return Err(malformed()),
        };

        let (destination, entry) = self
            .resolve(name)
            .ok_or_else(|| CommandError::UnknownName(name.to_string()))?;
        let data = match value {
            Some(value) => entry
                .datapoint
                .encode_text(value)
                .map_err(CommandError::Value)?,
            None => vec![0],
        };

        Ok(GroupEvent {
            command,
            source: IndividualAddr::default(),
            destination,
            data,
        })
    }
}

/// `[12 51]`
fn bytes_list(data: &[u8]) -> String {
    let items: Vec<String> = data.iter().map(u8::to_string).collect();
    format!("[{}]", items.join(" "))
}
