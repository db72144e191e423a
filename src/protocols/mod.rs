//! Field protocol readers
//!
//! Each reader turns one [`MonitoredPoint`] into one [`RawValue`] or a
//! [`ReadError`]. Readers never panic on device misbehaviour and always
//! bound their network time with a timeout.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::PollerConfig;
use crate::points::{MonitoredPoint, Protocol};

pub mod bacnet;
pub mod error;
pub mod modbus;

pub use bacnet::{BacnetClient, BacnetReader};
pub use error::{ReadError, ReadResult};
pub use modbus::ModbusReader;

/// A value as it came off the wire, before normalization
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

#[async_trait]
pub trait PointReader: Send + Sync {
    async fn read(&self, point: &MonitoredPoint) -> ReadResult<RawValue>;
}

/// One reader per protocol, selected by the point's protocol tag
#[derive(Clone)]
pub struct ProtocolReaders {
    modbus: Arc<dyn PointReader>,
    bacnet: Arc<dyn PointReader>,
}

impl ProtocolReaders {
    pub fn new(modbus: Arc<dyn PointReader>, bacnet: Arc<dyn PointReader>) -> Self {
        Self { modbus, bacnet }
    }

    /// Build the network readers. The BACnet client binds its UDP socket
    /// once here and is shared by every BACnet read.
    pub async fn from_config(config: &PollerConfig) -> ReadResult<Self> {
        let modbus = ModbusReader::new(config.modbus_port, config.modbus_timeout());
        let client = BacnetClient::bind(config.bacnet_port, config.bacnet_timeout()).await?;

        Ok(Self::new(
            Arc::new(modbus),
            Arc::new(BacnetReader::new(Arc::new(client))),
        ))
    }

    pub async fn read(&self, point: &MonitoredPoint) -> ReadResult<RawValue> {
        match point.protocol {
            Protocol::Modbus => self.modbus.read(point).await,
            Protocol::Bacnet => self.bacnet.read(point).await,
        }
    }
}
