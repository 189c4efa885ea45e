//! Serializable mirrors of engine state.
//!
//! Runtime values share scopes and closures, which JSON cannot carry, so
//! export goes through a plain mirror enum. Composite ids become string
//! keys because JSON maps require string keys.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::engine::history::History;
use crate::engine::value::{Value, ValueKind};
use crate::syntax::Unit;

/// JSON-safe mirror of a runtime value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SerializedValue {
    Number { magnitude: f64, unit: Option<Unit> },
    Text(String),
    Bool(bool),
    None,
    List(Vec<SerializedValue>),
    Set(Vec<SerializedValue>),
    Map(Vec<(SerializedValue, SerializedValue)>),
    Structure {
        type_name: String,
        fields: HashMap<String, SerializedValue>,
    },
    /// Closures don't serialize; only their presence is recorded.
    Function,
    /// Stream handle as "node:occurrence".
    Stream(String),
    Exception { message: String },
}

impl SerializedValue {
    pub fn from_value(value: &Value) -> Self {
        match value.kind() {
            ValueKind::Number { magnitude, unit } => {
                SerializedValue::Number { magnitude: *magnitude, unit: *unit }
            }
            ValueKind::Text(text) => SerializedValue::Text(text.to_string()),
            ValueKind::Bool(b) => SerializedValue::Bool(*b),
            ValueKind::None => SerializedValue::None,
            ValueKind::List(items) => {
                SerializedValue::List(items.iter().map(Self::from_value).collect())
            }
            ValueKind::Set(items) => {
                SerializedValue::Set(items.iter().map(Self::from_value).collect())
            }
            ValueKind::Map(entries) => SerializedValue::Map(
                entries
                    .iter()
                    .map(|(k, v)| (Self::from_value(k), Self::from_value(v)))
                    .collect(),
            ),
            ValueKind::Structure { type_name, fields } => SerializedValue::Structure {
                type_name: type_name.to_string(),
                fields: fields
                    .iter()
                    .map(|(name, value)| (name.to_string(), Self::from_value(value)))
                    .collect(),
            },
            ValueKind::Function(_) => SerializedValue::Function,
            ValueKind::Stream(key) => {
                SerializedValue::Stream(format!("{}:{}", key.node.0, key.occurrence))
            }
            ValueKind::Exception(exception) => {
                SerializedValue::Exception { message: exception.describe() }
            }
        }
    }
}

/// One serialized history entry: "source:<n>" → root value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub index: u64,
    pub values: HashMap<String, SerializedValue>,
}

/// A serializable snapshot of the whole history log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySnapshot {
    /// Version for migration support
    pub version: u32,
    pub entries: Vec<SnapshotEntry>,
}

impl HistorySnapshot {
    /// Current snapshot version.
    pub const VERSION: u32 = 1;

    pub fn from_history(history: &History) -> Self {
        let entries = history
            .entries()
            .iter()
            .map(|entry| SnapshotEntry {
                index: entry.index(),
                values: entry
                    .values()
                    .iter()
                    .map(|(source, value)| {
                        (format!("source:{}", source.0), SerializedValue::from_value(value))
                    })
                    .collect(),
            })
            .collect();
        Self { version: Self::VERSION, entries }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
