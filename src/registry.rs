// src/registry.rs
//
// Sensor registry - in-memory catalog of the sensors declared for the slave.
//
// Each entry carries the schema declared to the cloud, the publication rule
// set, the Modbus source address, and the per-session value state (last read,
// last sent, last publication time). The entry set is built from the config
// file before the control loop starts and is frozen for the session; only the
// value state mutates afterwards.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Value kind declared in a sensor schema. Determines the register footprint:
/// `Bool` is a single register probed at a bit offset, `Int` and `Float` are
/// two registers decoded big-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Bool,
    Int,
    Float,
}

/// A sensor reading, typed per the schema's value kind.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i32),
    Float(f32),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
        }
    }

    /// Numeric view for threshold comparison. `None` for booleans.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(_) => None,
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v as f64),
        }
    }

    /// Reshape a decoded wire value to the kind a sensor expects.
    /// JSON carries `42` as an integer even when the sensor is a float.
    pub fn coerce(&self, kind: ValueKind) -> Option<Value> {
        match (self, kind) {
            (Value::Bool(v), ValueKind::Bool) => Some(Value::Bool(*v)),
            (Value::Int(v), ValueKind::Int) => Some(Value::Int(*v)),
            (Value::Int(v), ValueKind::Float) => Some(Value::Float(*v as f32)),
            (Value::Float(v), ValueKind::Float) => Some(Value::Float(*v)),
            _ => None,
        }
    }
}

/// Schema triple declared to the cloud for one sensor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorSchema {
    pub kind: ValueKind,
    pub unit: String,
    pub name: String,
}

/// Where the sensor lives on the slave.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModbusSource {
    /// Protocol-level register address (0-based)
    pub register: u16,
    /// Bit offset within the register, used by `Bool` sensors
    pub bit_offset: u8,
}

/// Publication rule set. Any combination may be configured; a publication is
/// due when any configured rule triggers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishRules {
    /// Minimum interval between publications, in seconds. Also drives the
    /// periodic publication timers armed when the session goes online.
    #[serde(default)]
    pub time_sec: Option<u64>,
    /// Publish whenever the reading differs from the last sent value
    #[serde(default)]
    pub change: bool,
    /// Publish on the upward crossing of this bound (edge-triggered)
    #[serde(default)]
    pub upper_threshold: Option<f64>,
    /// Publish on the downward crossing of this bound (edge-triggered)
    #[serde(default)]
    pub lower_threshold: Option<f64>,
}

impl PublishRules {
    pub fn has_threshold(&self) -> bool {
        self.upper_threshold.is_some() || self.lower_threshold.is_some()
    }
}

/// One sensor: schema, rules, Modbus source, and session value state.
#[derive(Clone, Debug)]
pub struct SensorEntry {
    pub id: u16,
    pub schema: SensorSchema,
    pub rules: PublishRules,
    pub source: ModbusSource,
    pub poll_interval: Duration,
    /// Last value read from the slave
    pub current: Option<Value>,
    /// Last value published to the cloud
    pub sent: Option<Value>,
    /// When `sent` was last advanced
    pub last_pub: Option<Instant>,
}

/// Schema list entry as declared on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub sensor_id: u16,
    pub kind: ValueKind,
    pub unit: String,
    pub name: String,
}

/// Snapshot handed to the change evaluator on each poll tick.
#[derive(Clone, Debug)]
pub struct Sample {
    pub source: ModbusSource,
    pub kind: ValueKind,
    pub rules: PublishRules,
    /// Previous reading, for threshold edge detection
    pub previous: Option<Value>,
    /// Last published value, for the change rule
    pub sent: Option<Value>,
    /// Time since the last publication, `None` if never published
    pub elapsed: Option<Duration>,
}

/// Catalog of declared sensors, keyed by sensor id.
///
/// Lookups are O(1). Insert replaces an existing entry with the same id; the
/// config loader is the only writer and guarantees id uniqueness before the
/// session starts.
#[derive(Debug, Default)]
pub struct SensorRegistry {
    items: RwLock<HashMap<u16, SensorEntry>>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(
        &self,
        id: u16,
        schema: SensorSchema,
        rules: PublishRules,
        source: ModbusSource,
        poll_interval: Duration,
    ) {
        let entry = SensorEntry {
            id,
            schema,
            rules,
            source,
            poll_interval,
            current: None,
            sent: None,
            last_pub: None,
        };
        self.items.write().unwrap().insert(id, entry);
    }

    pub fn get(&self, id: u16) -> Option<SensorEntry> {
        self.items.read().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().unwrap().is_empty()
    }

    /// Sensor ids in arbitrary order.
    pub fn ids(&self) -> Vec<u16> {
        self.items.read().unwrap().keys().copied().collect()
    }

    /// Sensors carrying a `time` rule, with the rule interval in seconds.
    /// These get periodic publication timers while the session is online.
    pub fn timed_ids(&self) -> Vec<(u16, u64)> {
        self.items
            .read()
            .unwrap()
            .values()
            .filter_map(|e| e.rules.time_sec.map(|secs| (e.id, secs)))
            .collect()
    }

    /// Poll intervals per sensor, for arming the sampling schedules.
    pub fn poll_intervals(&self) -> Vec<(u16, Duration)> {
        self.items
            .read()
            .unwrap()
            .values()
            .map(|e| (e.id, e.poll_interval))
            .collect()
    }

    /// Evaluation snapshot for one sensor. `None` if the id is not declared.
    pub fn sample(&self, id: u16) -> Option<Sample> {
        self.items.read().unwrap().get(&id).map(|e| Sample {
            source: e.source,
            kind: e.schema.kind,
            rules: e.rules,
            previous: e.current,
            sent: e.sent,
            elapsed: e.last_pub.map(|t| t.elapsed()),
        })
    }

    /// Record a fresh reading. Every tick lands here, published or not, so
    /// threshold edges always compare against the latest reading.
    pub fn update_current(&self, id: u16, value: Value) {
        if let Some(e) = self.items.write().unwrap().get_mut(&id) {
            e.current = Some(value);
        }
    }

    /// Advance the sent value. Called at publication time only.
    pub fn mark_sent(&self, id: u16, value: Value) {
        if let Some(e) = self.items.write().unwrap().get_mut(&id) {
            e.sent = Some(value);
            e.last_pub = Some(Instant::now());
        }
    }

    /// Full schema list, declared to the cloud verbatim during the handshake.
    pub fn schemas(&self) -> Vec<SchemaEntry> {
        let mut list: Vec<SchemaEntry> = self
            .items
            .read()
            .unwrap()
            .values()
            .map(|e| SchemaEntry {
                sensor_id: e.id,
                kind: e.schema.kind,
                unit: e.schema.unit.clone(),
                name: e.schema.name.clone(),
            })
            .collect();
        list.sort_by_key(|s| s.sensor_id);
        list
    }

    /// Drop every entry. Shutdown only.
    pub fn clear(&self) {
        self.items.write().unwrap().clear();
    }
}
