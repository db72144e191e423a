//! Monitored point model and registration rules
//!
//! A point is one variable on a remote device. The declared type code
//! (`"coil"`, `"float32"`, ...) is resolved once into a closed [`DataType`]
//! when the point is registered or loaded, so readers and the normalizer
//! dispatch on the enum and never re-parse strings.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default Modbus unit identifier
pub const DEFAULT_DEVICE_ID: u32 = 1;

/// Default poll interval in milliseconds
pub const DEFAULT_INTERVAL_MS: u64 = 5000;

/// Creator placeholder used by clients that could not resolve the user
const UNKNOWN_CREATOR: &str = "Inconnu";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Modbus,
    Bacnet,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Modbus => "modbus",
            Protocol::Bacnet => "bacnet",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "modbus" => Ok(Protocol::Modbus),
            "bacnet" => Ok(Protocol::Bacnet),
            other => Err(ValidationError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Value shape of a point, decided from its type code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Coils and discrete inputs, rendered as `ON`/`OFF`
    Boolean,
    /// IEEE-754 single precision spread over two registers
    Float,
    /// Signed 16-bit register
    Int16,
    Enum,
    /// Anything else: one raw unsigned register
    Generic,
}

impl DataType {
    pub fn from_type_code(code: &str) -> Self {
        match code.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" | "coil" => DataType::Boolean,
            "float" | "float32" | "real" => DataType::Float,
            "int16" | "int" => DataType::Int16,
            "enum" => DataType::Enum,
            _ => DataType::Generic,
        }
    }

    pub fn is_boolean(&self) -> bool {
        matches!(self, DataType::Boolean)
    }
}

/// Entry of the protocol type catalogue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolType {
    /// Technical code referenced by points (e.g. `"float32"`)
    pub code: String,

    /// Human readable label
    pub display_name: String,

    pub protocol: Protocol,

    /// Registers spanned by one value (Modbus)
    #[serde(default = "default_register_count")]
    pub register_count: u16,

    /// BACnet object type read for this code (0 = analog-input when unset)
    #[serde(default)]
    pub bacnet_object_type: Option<u32>,
}

fn default_register_count() -> u16 {
    1
}

/// A configured point, with catalogue metadata resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredPoint {
    pub id: i64,
    pub name: String,
    pub protocol: Protocol,
    pub host: String,

    /// Modbus unit identifier
    pub device_id: u32,

    /// Register number (Modbus) or object instance (BACnet)
    pub address: u32,

    pub type_code: String,
    pub data_type: DataType,

    /// Catalogue label for `type_code`, if the code is known
    pub type_display_name: Option<String>,

    /// BACnet object type from the catalogue
    pub bacnet_object_type: Option<u32>,

    pub interval_ms: u64,
    pub unit: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub created_by: String,
    pub last_value: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
}

impl MonitoredPoint {
    /// A point is due once its interval has elapsed since the last stored
    /// reading. Points that were never read are always due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_update {
            None => true,
            Some(last) => {
                let elapsed_ms = (now - last).num_milliseconds();
                elapsed_ms >= 0 && elapsed_ms as u64 >= self.interval_ms
            }
        }
    }

    pub fn has_thresholds(&self) -> bool {
        self.min.is_some() || self.max.is_some()
    }
}

/// Registration request as it arrives from the outside (API, config file)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewPoint {
    pub name: String,
    pub protocol: String,
    pub host: String,
    #[serde(default)]
    pub device_id: Option<u32>,
    pub address: String,
    #[serde(rename = "type")]
    pub type_code: String,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    pub created_by: String,
}

/// A validated registration, ready to be stored
#[derive(Debug, Clone, PartialEq)]
pub struct PointRegistration {
    pub name: String,
    pub protocol: Protocol,
    pub host: String,
    pub device_id: u32,
    pub address: u32,
    pub type_code: String,
    pub data_type: DataType,
    pub interval_ms: u64,
    pub unit: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub created_by: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("point name must not be empty")]
    EmptyName,

    #[error("host address must not be empty")]
    EmptyHost,

    #[error("action not authorized: unknown creator")]
    UnknownCreator,

    #[error("unknown protocol {0:?}")]
    UnknownProtocol(String),

    #[error("invalid point address {0:?}")]
    InvalidAddress(String),

    #[error("poll interval must be greater than zero")]
    ZeroInterval,

    #[error("threshold {0} is not a finite number")]
    NonFiniteThreshold(&'static str),

    #[error("min threshold {min} must be lower than max threshold {max}")]
    InvertedThresholds { min: f64, max: f64 },
}

impl NewPoint {
    pub fn validate(self) -> Result<PointRegistration, ValidationError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(ValidationError::EmptyName);
        }

        let created_by = self.created_by.trim().to_string();
        if created_by.is_empty() || created_by == UNKNOWN_CREATOR {
            return Err(ValidationError::UnknownCreator);
        }

        let host = self.host.trim().to_string();
        if host.is_empty() {
            return Err(ValidationError::EmptyHost);
        }

        let protocol = self.protocol.parse::<Protocol>()?;

        let address = self
            .address
            .trim()
            .parse::<u32>()
            .map_err(|_| ValidationError::InvalidAddress(self.address.clone()))?;

        let interval_ms = self.interval_ms.unwrap_or(DEFAULT_INTERVAL_MS);
        if interval_ms == 0 {
            return Err(ValidationError::ZeroInterval);
        }

        if self.min.is_some_and(|min| !min.is_finite()) {
            return Err(ValidationError::NonFiniteThreshold("min"));
        }
        if self.max.is_some_and(|max| !max.is_finite()) {
            return Err(ValidationError::NonFiniteThreshold("max"));
        }
        // min >= max would make MIN and MAX breaches overlap
        if let (Some(min), Some(max)) = (self.min, self.max)
            && min >= max
        {
            return Err(ValidationError::InvertedThresholds { min, max });
        }

        let type_code = self.type_code.trim().to_string();
        let unit = self
            .unit
            .map(|unit| unit.trim().to_string())
            .filter(|unit| !unit.is_empty());

        Ok(PointRegistration {
            name,
            protocol,
            host,
            device_id: self.device_id.unwrap_or(DEFAULT_DEVICE_ID),
            address,
            data_type: DataType::from_type_code(&type_code),
            type_code,
            interval_ms,
            unit,
            min: self.min,
            max: self.max,
            created_by,
        })
    }
}
