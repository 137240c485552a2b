//! Datapoint types
//!
//! Converts between raw group telegram payloads and typed values. Payloads
//! follow the telegram data convention: the first byte carries the six low
//! APCI bits, so values of six bits or less live in `data[0]` and longer
//! values follow a zero byte.
//!
//! Types are looked up by code (`"9.001"`); codes without a dedicated entry
//! fall back to their main number (`"9.024"` behaves as `"9"`).

use std::fmt;


/// A decoded datapoint value
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DatapointValue {
    Bool(bool),
    Signed(i64),
    Unsigned(u64),
    Float(f64),
}

impl fmt::Display for DatapointValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatapointValue::Bool(b) => write!(f, "{}", b),
            DatapointValue::Signed(i) => write!(f, "{}", i),
            DatapointValue::Unsigned(u) => write!(f, "{}", u),
            DatapointValue::Float(v) => write!(f, "{:.2}", v),
        }
    }
}

/// Errors converting datapoint values
#[derive(Debug, Clone, PartialEq)]
pub enum DptError {
    /// Payload length does not match the type
    Length { expected: usize, actual: usize },
    /// Value cannot be represented by the type
    OutOfRange(String),
    /// Text is not a value of the type
    InvalidText(String),
    /// Value variant does not fit the type
    TypeMismatch(DatapointValue),
}

impl fmt::Display for DptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DptError::Length { expected, actual } => {
                write!(f, "expected {} data bytes, got {}", expected, actual)
            }
            DptError::OutOfRange(v) => write!(f, "value {} out of range", v),
            DptError::InvalidText(t) => write!(f, "{:?} is not a valid value", t),
            DptError::TypeMismatch(v) => write!(f, "value {:?} does not fit the type", v),
        }
    }
}

impl std::error::Error for DptError {}

/// Wire representation of a datapoint type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// 1 bit, with the words rendered for false and true
    Bool(&'static str, &'static str),
    /// 8 bit unsigned
    U8,
    /// 8 bit scaled to 0..=100
    Percent,
    I8,
    U16,
    I16,
    /// KNX 2-byte float
    Float16,
    U32,
    I32,
    /// IEEE 754 single precision
    Float32,
    /// 6 bit scene number
    Scene,
    /// 8 bit enumeration with named values
    Enum(&'static [(u8, &'static str)]),
}

impl Kind {
    /// Number of bytes following the APCI byte
    fn size(self) -> usize {
        match self {
            Kind::Bool(..) => 0,
            Kind::U8 | Kind::Percent | Kind::I8 | Kind::Scene | Kind::Enum(_) => 1,
            Kind::U16 | Kind::I16 | Kind::Float16 => 2,
            Kind::U32 | Kind::I32 | Kind::Float32 => 4,
        }
    }
}

/// Descriptor of one datapoint type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatapointType {
    pub code: &'static str,
    pub kind: Kind,
    pub unit: &'static str,
}

const HVAC_MODES: &[(u8, &str)] = &[
    (0, "auto"),
    (1, "comfort"),
    (2, "standby"),
    (3, "economy"),
    (4, "protection"),
];

const HVAC_CONTROL_MODES: &[(u8, &str)] = &[
    (0, "auto"),
    (1, "heat"),
    (2, "morning-warmup"),
    (3, "cool"),
    (4, "night-purge"),
    (5, "precool"),
    (6, "off"),
    (7, "test"),
    (8, "emergency-heat"),
    (9, "fan-only"),
    (10, "free-cool"),
    (11, "ice"),
];

/// Alternative spellings accepted when parsing enumerations
const ENUM_ALIASES: &[(&str, &str)] = &[("fan", "fan-only"), ("fan only", "fan-only")];

const fn dpt(code: &'static str, kind: Kind, unit: &'static str) -> DatapointType {
    DatapointType { code, kind, unit }
}

static TYPES: &[DatapointType] = &[
    dpt("1", Kind::Bool("false", "true"), ""),
    dpt("1.001", Kind::Bool("off", "on"), ""),
    dpt("1.002", Kind::Bool("false", "true"), ""),
    dpt("1.003", Kind::Bool("disable", "enable"), ""),
    dpt("1.008", Kind::Bool("up", "down"), ""),
    dpt("1.009", Kind::Bool("open", "close"), ""),
    dpt("1.010", Kind::Bool("stop", "start"), ""),
    dpt("1.100", Kind::Bool("cool", "heat"), ""),
    dpt("5", Kind::U8, ""),
    dpt("5.001", Kind::Percent, "%"),
    dpt("6", Kind::I8, ""),
    dpt("6.001", Kind::I8, "%"),
    dpt("7", Kind::U16, ""),
    dpt("7.013", Kind::U16, "lux"),
    dpt("8", Kind::I16, ""),
    dpt("9", Kind::Float16, ""),
    dpt("9.001", Kind::Float16, "°C"),
    dpt("9.004", Kind::Float16, "lux"),
    dpt("9.005", Kind::Float16, "m/s"),
    dpt("9.006", Kind::Float16, "Pa"),
    dpt("9.007", Kind::Float16, "%"),
    dpt("9.020", Kind::Float16, "mV"),
    dpt("9.024", Kind::Float16, "kW"),
    dpt("12", Kind::U32, ""),
    dpt("13", Kind::I32, ""),
    dpt("13.010", Kind::I32, "Wh"),
    dpt("14", Kind::Float32, ""),
    dpt("14.056", Kind::Float32, "W"),
    dpt("17", Kind::Scene, ""),
    dpt("20.102", Kind::Enum(HVAC_MODES), ""),
    dpt("20.105", Kind::Enum(HVAC_CONTROL_MODES), ""),
];

/// Look up a datapoint type by code, falling back to the main number
pub fn lookup(code: &str) -> Option<&'static DatapointType> {
    let code = code.trim();
    TYPES.iter().find(|t| t.code == code).or_else(|| {
        let main = code.split('.').next()?;
        TYPES.iter().find(|t| t.code == main)
    })
}

const TRUE_WORDS: &[&str] = &[
    "1", "t", "true", "on", "enable", "down", "close", "start", "heat",
];
const FALSE_WORDS: &[&str] = &[
    "0", "f", "false", "off", "disable", "up", "open", "stop", "cool",
];

/// Largest and smallest values a 2-byte float can carry
const FLOAT16_MAX: f64 = 670_760.96;
const FLOAT16_MIN: f64 = -671_088.64;

impl DatapointType {
    /// Decode a telegram payload
    pub fn decode(&self, data: &[u8]) -> Result<DatapointValue, DptError> {
        let expected = self.kind.size() + 1;
        if data.len() != expected {
            return Err(DptError::Length {
                expected,
                actual: data.len(),
            });
        }
        let bytes = &data[1..];

        let value = match self.kind {
            Kind::Bool(..) => DatapointValue::Bool(data[0] & 0x01 != 0),
            Kind::U8 | Kind::Enum(_) => DatapointValue::Unsigned(bytes[0] as u64),
            Kind::Scene => DatapointValue::Unsigned((bytes[0] & 0x3F) as u64),
            Kind::Percent => DatapointValue::Float(bytes[0] as f64 * 100.0 / 255.0),
            Kind::I8 => DatapointValue::Signed(bytes[0] as i8 as i64),
            Kind::U16 => DatapointValue::Unsigned(u16::from_be_bytes([bytes[0], bytes[1]]) as u64),
            Kind::I16 => DatapointValue::Signed(i16::from_be_bytes([bytes[0], bytes[1]]) as i64),
            Kind::Float16 => DatapointValue::Float(decode_float16([bytes[0], bytes[1]])),
            Kind::U32 => DatapointValue::Unsigned(u32::from_be_bytes(be4(bytes)) as u64),
            Kind::I32 => DatapointValue::Signed(i32::from_be_bytes(be4(bytes)) as i64),
            Kind::Float32 => DatapointValue::Float(f32::from_be_bytes(be4(bytes)) as f64),
        };
        Ok(value)
    }

    /// Encode a value into a telegram payload
    pub fn encode(&self, value: &DatapointValue) -> Result<Vec<u8>, DptError> {
        let mismatch = || DptError::TypeMismatch(*value);
        let out_of_range = || DptError::OutOfRange(value.to_string());

        let data = match self.kind {
            Kind::Bool(..) => match *value {
                DatapointValue::Bool(b) => vec![b as u8],
                DatapointValue::Unsigned(u @ 0..=1) => vec![u as u8],
                _ => return Err(mismatch()),
            },
            Kind::U8 | Kind::Enum(_) => {
                let v = integer(value).ok_or_else(mismatch)?;
                vec![0, u8::try_from(v).map_err(|_| out_of_range())?]
            }
            Kind::Scene => {
                let v = integer(value).ok_or_else(mismatch)?;
                if !(0..=63).contains(&v) {
                    return Err(out_of_range());
                }
                vec![0, v as u8]
            }
            Kind::Percent => {
                let v = float(value).ok_or_else(mismatch)?;
                if !(0.0..=100.0).contains(&v) {
                    return Err(out_of_range());
                }
                vec![0, (v * 255.0 / 100.0).round() as u8]
            }
            Kind::I8 => {
                let v = integer(value).ok_or_else(mismatch)?;
                vec![0, i8::try_from(v).map_err(|_| out_of_range())? as u8]
            }
            Kind::U16 => {
                let v = integer(value).ok_or_else(mismatch)?;
                prefixed(&u16::try_from(v).map_err(|_| out_of_range())?.to_be_bytes())
            }
            Kind::I16 => {
                let v = integer(value).ok_or_else(mismatch)?;
                prefixed(&i16::try_from(v).map_err(|_| out_of_range())?.to_be_bytes())
            }
            Kind::Float16 => {
                let v = float(value).ok_or_else(mismatch)?;
                prefixed(&encode_float16(v).ok_or_else(out_of_range)?)
            }
            Kind::U32 => {
                let v = integer(value).ok_or_else(mismatch)?;
                prefixed(&u32::try_from(v).map_err(|_| out_of_range())?.to_be_bytes())
            }
            Kind::I32 => {
                let v = integer(value).ok_or_else(mismatch)?;
                prefixed(&i32::try_from(v).map_err(|_| out_of_range())?.to_be_bytes())
            }
            Kind::Float32 => {
                let v = float(value).ok_or_else(mismatch)?;
                if !v.is_finite() || v.abs() > f32::MAX as f64 {
                    return Err(out_of_range());
                }
                prefixed(&(v as f32).to_be_bytes())
            }
        };
        Ok(data)
    }

    /// Parse a value from text
    pub fn parse(&self, text: &str) -> Result<DatapointValue, DptError> {
        let text = text.trim();
        let lower = text.to_ascii_lowercase();
        let invalid = || DptError::InvalidText(text.to_string());

        let value = match self.kind {
            Kind::Bool(off, on) => {
                if TRUE_WORDS.contains(&lower.as_str()) || lower == on {
                    DatapointValue::Bool(true)
                } else if FALSE_WORDS.contains(&lower.as_str()) || lower == off {
                    DatapointValue::Bool(false)
                } else {
                    return Err(invalid());
                }
            }
            Kind::Enum(names) => match lower.parse::<u64>() {
                Ok(u) => DatapointValue::Unsigned(u),
                Err(_) => {
                    let name = ENUM_ALIASES
                        .iter()
                        .find(|(alias, _)| *alias == lower)
                        .map_or(lower.as_str(), |(_, name)| *name);
                    let (code, _) = names
                        .iter()
                        .find(|(_, n)| *n == name)
                        .ok_or_else(invalid)?;
                    DatapointValue::Unsigned(*code as u64)
                }
            },
            Kind::U8 | Kind::U16 | Kind::U32 | Kind::Scene => {
                DatapointValue::Unsigned(lower.parse().map_err(|_| invalid())?)
            }
            Kind::I8 | Kind::I16 | Kind::I32 => {
                DatapointValue::Signed(lower.parse().map_err(|_| invalid())?)
            }
            Kind::Percent | Kind::Float16 | Kind::Float32 => {
                let v: f64 = lower.parse().map_err(|_| invalid())?;
                if !v.is_finite() {
                    return Err(invalid());
                }
                DatapointValue::Float(v)
            }
        };

        // Reject values the type cannot carry
        self.encode(&value)?;
        Ok(value)
    }

    /// Render a value for display, with unit where the type has one
    pub fn format(&self, value: &DatapointValue) -> String {
        let text = match (self.kind, value) {
            (Kind::Bool(off, on), DatapointValue::Bool(b)) => {
                let word = if *b { on } else { off };
                return word.to_string();
            }
            (Kind::Enum(names), DatapointValue::Unsigned(u)) => {
                match names.iter().find(|(code, _)| *code as u64 == *u) {
                    Some((_, name)) => return name.to_string(),
                    None => u.to_string(),
                }
            }
            _ => value.to_string(),
        };
        if self.unit.is_empty() {
            text
        } else {
            format!("{} {}", text, self.unit)
        }
    }

    /// Decode a payload straight to display text
    pub fn decode_text(&self, data: &[u8]) -> Result<String, DptError> {
        Ok(self.format(&self.decode(data)?))
    }

    /// Parse text and encode it into a payload
    pub fn encode_text(&self, text: &str) -> Result<Vec<u8>, DptError> {
        self.encode(&self.parse(text)?)
    }
}

fn integer(value: &DatapointValue) -> Option<i64> {
    match *value {
        DatapointValue::Signed(i) => Some(i),
        DatapointValue::Unsigned(u) => i64::try_from(u).ok(),
        DatapointValue::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(f as i64),
        _ => None,
    }
}

fn float(value: &DatapointValue) -> Option<f64> {
    match *value {
        DatapointValue::Float(f) => Some(f),
        DatapointValue::Signed(i) => Some(i as f64),
        DatapointValue::Unsigned(u) => Some(u as f64),
        DatapointValue::Bool(_) => None,
    }
}

fn prefixed(bytes: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(bytes.len() + 1);
    data.push(0);
    data.extend_from_slice(bytes);
    data
}

fn be4(bytes: &[u8]) -> [u8; 4] {
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

/// `value = 0.01 * mantissa * 2^exponent`, 12-bit signed mantissa
fn decode_float16(raw: [u8; 2]) -> f64 {
    let raw = u16::from_be_bytes(raw);
    let exponent = (raw >> 11) & 0x0F;
    let mut mantissa = (raw & 0x07FF) as i32;
    if raw & 0x8000 != 0 {
        mantissa -= 2048;
    }
    mantissa as f64 * (1u32 << exponent) as f64 / 100.0
}

fn encode_float16(value: f64) -> Option<[u8; 2]> {
    if !value.is_finite() || !(FLOAT16_MIN..=FLOAT16_MAX).contains(&value) {
        return None;
    }
    let scaled = value * 100.0;
    for exponent in 0u16..16 {
        let mantissa = (scaled / (1u32 << exponent) as f64).round() as i32;
        if (-2048..=2047).contains(&mantissa) {
            let mut raw = (exponent << 11) | (mantissa & 0x07FF) as u16;
            if mantissa < 0 {
                raw |= 0x8000;
            }
            return Some(raw.to_be_bytes());
        }
    }
    None
}
