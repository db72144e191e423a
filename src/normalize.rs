//! Raw protocol values to canonical storage form
//!
//! Booleans become `"ON"`/`"OFF"` and carry no numeric value, so they never
//! reach threshold evaluation. Everything else must be numeric.

use crate::points::DataType;
use crate::protocols::RawValue;
use crate::util::round2;

pub const ON: &str = "ON";
pub const OFF: &str = "OFF";

/// Storage-ready value
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalValue {
    /// What is written to history and `last_value`
    pub text: String,

    /// Input to threshold evaluation, absent for booleans
    pub numeric: Option<f64>,
}

impl CanonicalValue {
    fn switch(on: bool) -> Self {
        Self {
            text: if on { ON } else { OFF }.to_string(),
            numeric: None,
        }
    }

    fn number(value: f64) -> Self {
        Self {
            text: value.to_string(),
            numeric: Some(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NormalizeError {
    #[error("value {0:?} is not numeric")]
    NotNumeric(String),

    #[error("value {0} is not finite")]
    NonFinite(f64),
}

pub fn normalize(raw: &RawValue, data_type: DataType) -> Result<CanonicalValue, NormalizeError> {
    let value = match raw {
        RawValue::Bool(on) => return Ok(CanonicalValue::switch(*on)),
        RawValue::Integer(value) if data_type.is_boolean() && (*value == 0 || *value == 1) => {
            return Ok(CanonicalValue::switch(*value == 1));
        }
        RawValue::Integer(value) => *value as f64,
        RawValue::Float(value) => *value,
        RawValue::Text(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| NormalizeError::NotNumeric(text.clone()))?,
    };

    if !value.is_finite() {
        return Err(NormalizeError::NonFinite(value));
    }

    let value = match data_type {
        DataType::Float => round2(value),
        _ => value,
    };

    Ok(CanonicalValue::number(value))
}
