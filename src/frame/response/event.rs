//! EVENT: server-initiated notifications, delivered on stream −1.

use std::net::SocketAddr;

use crate::frame::frame_errors::ParseError;
use crate::frame::server_event_type::EventType;
use crate::frame::types;

#[derive(Debug, Clone)]
pub enum Event {
    TopologyChange(TopologyChangeEvent),
    StatusChange(StatusChangeEvent),
    SchemaChange(SchemaChangeEvent),
}

impl Event {
    /// Category of this event, for subscriber routing.
    pub fn event_type(&self) -> EventType {
        match self {
            Event::TopologyChange(_) => EventType::TopologyChange,
            Event::StatusChange(_) => EventType::StatusChange,
            Event::SchemaChange(_) => EventType::SchemaChange,
        }
    }

    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let event_type: EventType = types::read_string(buf)?.parse()?;
        match event_type {
            EventType::TopologyChange => {
                Ok(Self::TopologyChange(TopologyChangeEvent::deserialize(buf)?))
            }
            EventType::StatusChange => Ok(Self::StatusChange(StatusChangeEvent::deserialize(buf)?)),
            EventType::SchemaChange => Ok(Self::SchemaChange(SchemaChangeEvent::deserialize(buf)?)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TopologyChangeEvent {
    NewNode(SocketAddr),
    RemovedNode(SocketAddr),
}

impl TopologyChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let change = types::read_string(buf)?.to_owned();
        let addr = types::read_inet(buf)?;
        match change.as_str() {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            _ => Err(ParseError::UnknownChangeType(change)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StatusChangeEvent {
    Up(SocketAddr),
    Down(SocketAddr),
}

impl StatusChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let change = types::read_string(buf)?.to_owned();
        let addr = types::read_inet(buf)?;
        match change.as_str() {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(ParseError::UnknownChangeType(change)),
        }
    }
}

/// Shared by EVENT frames and RESULT::SchemaChange bodies, which carry
/// the same change-type/target/names layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChangeEvent {
    KeyspaceChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
    },
    TableChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        object_name: String,
    },
    TypeChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        type_name: String,
    },
    FunctionChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        function_name: String,
        arguments: Vec<String>,
    },
    AggregateChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        aggregate_name: String,
        arguments: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeType {
    Created,
    Updated,
    Dropped,
}

impl SchemaChangeEvent {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let change = types::read_string(buf)?.to_owned();
        let change_type = match change.as_str() {
            "CREATED" => SchemaChangeType::Created,
            "UPDATED" => SchemaChangeType::Updated,
            "DROPPED" => SchemaChangeType::Dropped,
            _ => return Err(ParseError::UnknownChangeType(change)),
        };

        let target = types::read_string(buf)?.to_owned();
        let keyspace_name = types::read_string(buf)?.to_owned();

        match target.as_str() {
            "KEYSPACE" => Ok(Self::KeyspaceChange {
                change_type,
                keyspace_name,
            }),
            "TABLE" => Ok(Self::TableChange {
                change_type,
                keyspace_name,
                object_name: types::read_string(buf)?.to_owned(),
            }),
            "TYPE" => Ok(Self::TypeChange {
                change_type,
                keyspace_name,
                type_name: types::read_string(buf)?.to_owned(),
            }),
            "FUNCTION" => {
                let function_name = types::read_string(buf)?.to_owned();
                Ok(Self::FunctionChange {
                    change_type,
                    keyspace_name,
                    function_name,
                    arguments: read_argument_list(buf)?,
                })
            }
            "AGGREGATE" => {
                let aggregate_name = types::read_string(buf)?.to_owned();
                Ok(Self::AggregateChange {
                    change_type,
                    keyspace_name,
                    aggregate_name,
                    arguments: read_argument_list(buf)?,
                })
            }
            _ => Err(ParseError::UnknownChangeTarget(target)),
        }
    }
}

fn read_argument_list(buf: &mut &[u8]) -> Result<Vec<String>, ParseError> {
    let count = types::read_short(buf)?;
    let mut arguments = Vec::with_capacity(count as usize);
    for _ in 0..count {
        arguments.push(types::read_string(buf)?.to_owned());
    }
    Ok(arguments)
}
