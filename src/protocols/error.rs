//! Read failure taxonomy
//!
//! Every variant is transient from the scheduler's point of view: the point
//! keeps its previous value and is retried on its next due cycle.

use std::time::Duration;

pub type ReadResult<T> = Result<T, ReadError>;

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("modbus error: {0}")]
    Modbus(String),

    #[error("modbus exception: {0}")]
    Exception(String),

    #[error("bacnet error: {0}")]
    Bacnet(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("device returned no value")]
    MissingValue,

    /// Point configuration cannot be expressed on the wire
    #[error("unsupported point configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
