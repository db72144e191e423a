//! Modbus/TCP point reader
//!
//! One TCP connection per read, one request per connection. The declared
//! data type picks the function code:
//!
//! | data type          | request                                   |
//! |--------------------|-------------------------------------------|
//! | `Boolean`          | read coil, discrete input on exception    |
//! | `Float`            | 2 holding registers, big-endian `f32`     |
//! | `Int16`            | 1 holding register, signed                |
//! | `Enum` / `Generic` | 1 holding register, raw unsigned          |

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::{debug, instrument};

use super::error::{ReadError, ReadResult};
use super::{PointReader, RawValue};
use crate::points::{DataType, MonitoredPoint};
use crate::util::round2;

#[derive(Debug, Clone)]
pub struct ModbusReader {
    port: u16,
    timeout: Duration,
}

impl ModbusReader {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    async fn resolve(&self, host: &str) -> ReadResult<SocketAddr> {
        if let Ok(addr) = host.parse::<SocketAddr>() {
            return Ok(addr);
        }

        tokio::net::lookup_host((host, self.port))
            .await
            .map_err(|e| ReadError::Connection(format!("cannot resolve {host}: {e}")))?
            .next()
            .ok_or_else(|| ReadError::Connection(format!("no address for {host}")))
    }

    async fn read_once(&self, point: &MonitoredPoint, unit: u8, address: u16) -> ReadResult<RawValue> {
        let addr = self.resolve(&point.host).await?;
        let mut ctx = tcp::connect_slave(addr, Slave(unit))
            .await
            .map_err(|e| ReadError::Connection(e.to_string()))?;

        let result = read_point(&mut ctx, point.data_type, address).await;

        // closed on success and failure alike
        let _ = ctx.disconnect().await;
        result
    }
}

#[async_trait]
impl PointReader for ModbusReader {
    #[instrument(skip_all, fields(point_id = point.id, host = %point.host, address = point.address))]
    async fn read(&self, point: &MonitoredPoint) -> ReadResult<RawValue> {
        let unit = u8::try_from(point.device_id).map_err(|_| {
            ReadError::Config(format!("unit id {} out of range", point.device_id))
        })?;
        let address = u16::try_from(point.address).map_err(|_| {
            ReadError::Config(format!("register {} out of range", point.address))
        })?;

        let value = tokio::time::timeout(self.timeout, self.read_once(point, unit, address))
            .await
            .map_err(|_| ReadError::Timeout(self.timeout))??;

        debug!(?value, "read modbus point");
        Ok(value)
    }
}

async fn read_point(ctx: &mut Context, data_type: DataType, address: u16) -> ReadResult<RawValue> {
    match data_type {
        DataType::Boolean => {
            let bits = match flatten(ctx.read_coils(address, 1).await) {
                Err(ReadError::Exception(reason)) => {
                    debug!(%reason, "coil rejected, trying discrete input");
                    flatten(ctx.read_discrete_inputs(address, 1).await)?
                }
                other => other?,
            };
            decode_bit(&bits).map(RawValue::Bool)
        }
        DataType::Float => {
            let registers = flatten(ctx.read_holding_registers(address, 2).await)?;
            decode_float(&registers).map(RawValue::Float)
        }
        DataType::Int16 => {
            let registers = flatten(ctx.read_holding_registers(address, 1).await)?;
            decode_int16(&registers).map(RawValue::Integer)
        }
        DataType::Enum | DataType::Generic => {
            let registers = flatten(ctx.read_holding_registers(address, 1).await)?;
            decode_unsigned(&registers).map(RawValue::Integer)
        }
    }
}

fn flatten<T>(response: tokio_modbus::Result<T>) -> ReadResult<T> {
    match response {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(exception)) => Err(ReadError::Exception(format!("{exception:?}"))),
        Err(err) => Err(ReadError::Modbus(err.to_string())),
    }
}

pub fn decode_bit(bits: &[bool]) -> ReadResult<bool> {
    bits.first()
        .copied()
        .ok_or_else(|| ReadError::Malformed("empty bit response".to_string()))
}

/// Two registers, high word first, as an IEEE-754 `f32` rounded to 2 decimals
pub fn decode_float(registers: &[u16]) -> ReadResult<f64> {
    let [high, low, ..] = registers else {
        return Err(ReadError::Malformed(format!(
            "need 2 registers for float, got {}",
            registers.len()
        )));
    };

    let value = f32::from_bits(((*high as u32) << 16) | *low as u32);
    if !value.is_finite() {
        return Err(ReadError::Malformed(format!("non-finite float {value}")));
    }

    Ok(round2(value as f64))
}

pub fn decode_int16(registers: &[u16]) -> ReadResult<i64> {
    registers
        .first()
        .map(|register| *register as i16 as i64)
        .ok_or_else(|| ReadError::Malformed("empty register response".to_string()))
}

pub fn decode_unsigned(registers: &[u16]) -> ReadResult<i64> {
    registers
        .first()
        .map(|register| *register as i64)
        .ok_or_else(|| ReadError::Malformed("empty register response".to_string()))
}
