// src/io/mod.rs
//
// Transport abstraction for the gateway's two links.
//
// The control plane talks to the slave and the cloud through the two port
// traits below; the concrete implementations (tokio-modbus TCP client,
// rumqttc MQTT client) live in the submodules and report link edges into the
// control queue. Tests substitute mock ports.

mod modbus_tcp;
mod mqtt;

pub use modbus_tcp::{ModbusLink, ModbusTcpConfig};
pub use mqtt::{MqttCloudConfig, MqttLink};

use async_trait::async_trait;

use crate::error::{CloudError, ModbusError};
use crate::registry::{ModbusSource, SchemaEntry, Value, ValueKind};

// ============================================================================
// Ports
// ============================================================================

/// Device-identity operations on the cloud link.
#[async_trait]
pub trait CloudPort: Send + Sync {
    async fn register(&self, id: &str, name: &str) -> Result<(), CloudError>;
    async fn authenticate(&self, id: &str, token: &str) -> Result<(), CloudError>;
    async fn update_schema(&self, id: &str, schemas: &[SchemaEntry]) -> Result<(), CloudError>;
    async fn publish_data(&self, id: &str, sensor_id: u16, value: &Value)
        -> Result<(), CloudError>;
    async fn unregister(&self, id: &str) -> Result<(), CloudError>;
}

/// Typed register access on the Modbus link.
#[async_trait]
pub trait ModbusPort: Send + Sync {
    async fn read(&self, source: ModbusSource, kind: ValueKind) -> Result<Value, ModbusError>;
    async fn write(&self, source: ModbusSource, value: &Value) -> Result<(), ModbusError>;
}

// ============================================================================
// Register Codec
// ============================================================================

/// Register footprint of a value kind. `Bool` probes a single register;
/// `Int` and `Float` span two registers, high word first.
pub fn register_count(kind: ValueKind) -> u16 {
    match kind {
        ValueKind::Bool => 1,
        ValueKind::Int | ValueKind::Float => 2,
    }
}

/// Decode registers read at `source` into a typed value.
pub fn decode_value(
    kind: ValueKind,
    source: ModbusSource,
    regs: &[u16],
) -> Result<Value, ModbusError> {
    let expected = register_count(kind) as usize;
    if regs.len() < expected {
        return Err(ModbusError::ShortRead {
            register: source.register,
            expected,
            got: regs.len(),
        });
    }
    let value = match kind {
        ValueKind::Bool => Value::Bool(regs[0] & (1 << source.bit_offset) != 0),
        ValueKind::Int => {
            let raw = ((regs[0] as u32) << 16) | regs[1] as u32;
            Value::Int(raw as i32)
        }
        ValueKind::Float => {
            let raw = ((regs[0] as u32) << 16) | regs[1] as u32;
            Value::Float(f32::from_bits(raw))
        }
    };
    Ok(value)
}

/// Encode a numeric value into its two-register wire form, high word first.
/// Booleans do not encode standalone; they are a read-modify-write of the
/// holding register at the source's bit offset.
pub fn encode_numeric(value: &Value) -> Option<[u16; 2]> {
    let raw = match value {
        Value::Bool(_) => return None,
        Value::Int(v) => *v as u32,
        Value::Float(v) => v.to_bits(),
    };
    Some([(raw >> 16) as u16, (raw & 0xFFFF) as u16])
}
