// src/events.rs
//
// Control events and the cloud ingress router.
//
// Every collaborator (poll tasks, link supervisors, the timeout slot, the
// MQTT event loop) produces events into one queue consumed by the gateway
// loop. Inbound cloud messages are demultiplexed here into state machine
// events; message kinds with no mapping are dropped.

use serde::{Deserialize, Serialize};

use crate::registry::Value;

/// Transport link identity, for connectivity notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Link {
    Modbus,
    Cloud,
}

/// Cloud-initiated write to one sensor.
#[derive(Clone, Debug, PartialEq)]
pub struct SensorWrite {
    pub sensor_id: u16,
    pub value: Value,
}

/// Event consumed by the gateway control loop.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// Raw link edge from a transport supervisor. Folded into READY /
    /// NOT_READY by the connectivity tracker before the state machine sees it.
    Link(Link, bool),
    /// Both links up
    Ready,
    /// At least one link down
    NotReady,
    /// Registration accepted, carrying the issued token
    RegOk(String),
    RegNotOk,
    AuthOk,
    AuthNotOk,
    SchemaOk,
    SchemaNotOk,
    /// Publish the current value of each listed sensor
    PubData(Vec<u16>),
    /// Apply cloud-initiated writes to the slave
    DataUpdate(Vec<SensorWrite>),
    /// Cloud requested unregistration
    UnregReq,
    /// Handshake timeout fired
    Timeout,
}

/// Inbound message kind, parsed from the topic suffix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Register,
    Auth,
    Schema,
    Update,
    Request,
    Unregister,
    List,
}

impl MessageKind {
    /// Topic suffix to kind. Unknown suffixes are dropped by the caller.
    pub fn from_topic_suffix(suffix: &str) -> Option<MessageKind> {
        match suffix {
            "registered" => Some(MessageKind::Register),
            "auth" => Some(MessageKind::Auth),
            "schema" => Some(MessageKind::Schema),
            "update" => Some(MessageKind::Update),
            "request" => Some(MessageKind::Request),
            "unregister" => Some(MessageKind::Unregister),
            "list" => Some(MessageKind::List),
            _ => None,
        }
    }
}

/// Sensor reference in an inbound payload. UPDATE messages carry values,
/// REQUEST messages carry ids only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SensorRef {
    pub sensor_id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Decoded inbound cloud message.
#[derive(Clone, Debug, Deserialize)]
pub struct CloudMessage {
    #[serde(skip)]
    pub kind: Option<MessageKind>,
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub sensors: Vec<SensorRef>,
}

/// Map an inbound message to a control event. `None` means drop: LIST and
/// unknown kinds, errored non-handshake messages, and malformed payloads.
pub fn route(msg: CloudMessage) -> Option<Event> {
    let kind = msg.kind?;
    match kind {
        MessageKind::Register => {
            if msg.error {
                return Some(Event::RegNotOk);
            }
            match msg.token {
                Some(token) => Some(Event::RegOk(token)),
                None => {
                    log::warn!("register reply without a token, treating as refused");
                    Some(Event::RegNotOk)
                }
            }
        }
        MessageKind::Auth => Some(if msg.error {
            Event::AuthNotOk
        } else {
            Event::AuthOk
        }),
        MessageKind::Schema => Some(if msg.error {
            Event::SchemaNotOk
        } else {
            Event::SchemaOk
        }),
        MessageKind::Update => {
            if msg.error {
                return None;
            }
            let writes: Vec<SensorWrite> = msg
                .sensors
                .into_iter()
                .filter_map(|s| {
                    s.value.map(|value| SensorWrite {
                        sensor_id: s.sensor_id,
                        value,
                    })
                })
                .collect();
            Some(Event::DataUpdate(writes))
        }
        MessageKind::Request => {
            if msg.error {
                return None;
            }
            let ids = msg.sensors.iter().map(|s| s.sensor_id).collect();
            Some(Event::PubData(ids))
        }
        MessageKind::Unregister => {
            if msg.error {
                return None;
            }
            Some(Event::UnregReq)
        }
        MessageKind::List => None,
    }
}
