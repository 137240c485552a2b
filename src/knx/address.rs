//! KNX address types
//!
//! Group addresses identify logical destinations on the bus and are written
//! as `main/middle/sub` (5/3/8 bits). Individual addresses identify physical
//! devices and are written as `area.line.device` (4/4/8 bits).

use std::fmt;
use std::ops::BitAnd;
use std::str::FromStr;

/// Error returned when an address string cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressError {
    input: String,
    reason: &'static str,
}

impl AddressError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid address {:?}: {}", self.input, self.reason)
    }
}

impl std::error::Error for AddressError {}

/// Parse one `/`- or `.`-separated component with an upper bound
fn parse_part(input: &str, part: &str, max: u16) -> Result<u16, AddressError> {
    let value: u16 = part
        .trim()
        .parse()
        .map_err(|_| AddressError::new(input, "component is not a number"))?;
    if value > max {
        return Err(AddressError::new(input, "component out of range"));
    }
    Ok(value)
}

/// KNX group address (16 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct GroupAddr(u16);

impl GroupAddr {
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Build from three-level notation
    pub fn from_parts(main: u8, middle: u8, sub: u8) -> Self {
        Self((((main & 0x1F) as u16) << 11) | (((middle & 0x07) as u16) << 8) | sub as u16)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub fn main(self) -> u8 {
        ((self.0 >> 11) & 0x1F) as u8
    }

    pub fn middle(self) -> u8 {
        ((self.0 >> 8) & 0x07) as u8
    }

    pub fn sub(self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// Topic suffix for this address (`main/middle/sub`)
    pub fn topic_path(self) -> String {
        self.to_string()
    }
}

impl BitAnd<u16> for GroupAddr {
    type Output = u16;

    fn bitand(self, mask: u16) -> u16 {
        self.0 & mask
    }
}

impl fmt::Display for GroupAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.main(), self.middle(), self.sub())
    }
}

impl FromStr for GroupAddr {
    type Err = AddressError;

    /// Accepts `main/middle/sub`, `main/sub` and a bare 16-bit number
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        match parts.as_slice() {
            [main, middle, sub] => {
                let main = parse_part(s, main, 31)?;
                let middle = parse_part(s, middle, 7)?;
                let sub = parse_part(s, sub, 255)?;
                Ok(Self((main << 11) | (middle << 8) | sub))
            }
            [main, sub] => {
                let main = parse_part(s, main, 31)?;
                let sub = parse_part(s, sub, 2047)?;
                Ok(Self((main << 11) | sub))
            }
            [raw] => Ok(Self(parse_part(s, raw, u16::MAX)?)),
            _ => Err(AddressError::new(s, "expected main/middle/sub")),
        }
    }
}

/// KNX individual (physical) address (16 bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct IndividualAddr(u16);

impl IndividualAddr {
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub fn from_parts(area: u8, line: u8, device: u8) -> Self {
        Self((((area & 0x0F) as u16) << 12) | (((line & 0x0F) as u16) << 8) | device as u16)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    pub fn area(self) -> u8 {
        ((self.0 >> 12) & 0x0F) as u8
    }

    pub fn line(self) -> u8 {
        ((self.0 >> 8) & 0x0F) as u8
    }

    pub fn device(self) -> u8 {
        (self.0 & 0xFF) as u8
    }
}

impl fmt::Display for IndividualAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.area(), self.line(), self.device())
    }
}

impl FromStr for IndividualAddr {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        match parts.as_slice() {
            [area, line, device] => {
                let area = parse_part(s, area, 15)?;
                let line = parse_part(s, line, 15)?;
                let device = parse_part(s, device, 255)?;
                Ok(Self((area << 12) | (line << 8) | device))
            }
            _ => Err(AddressError::new(s, "expected area.line.device")),
        }
    }
}
