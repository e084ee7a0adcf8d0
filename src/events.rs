//! Trace events.
//!
//! An event is a timestamp, an event type and a flat set of named fields.
//! In trace files, events are JSON objects:
//!
//! ```
//! use statehist::events::TraceEvent;
//!
//! let e: TraceEvent =
//!     serde_json::from_str(r#"{"ts":10,"event":"entry","tid":42,"name":"main"}"#).unwrap();
//!
//! assert_eq!(e.ts, 10);
//! assert_eq!(e.name, "entry");
//! assert_eq!(e.field_u64("tid").unwrap(), 42);
//! assert_eq!(e.field_str("name").unwrap(), "main");
//! assert!(e.field_str("tid").is_err());
//! ```

use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::provider::HandlerError;
use crate::state::StateValue;

/// Value of an event field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    UInt(u64),
    Int(i64),
    Float(f64),
    Str(String),
    Null,
    /// Arrays and objects, kept as raw JSON.
    Nested(serde_json::Value),
}

impl FieldValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Bool(_) => "bool",
            FieldValue::UInt(_) | FieldValue::Int(_) => "integer",
            FieldValue::Float(_) => "float",
            FieldValue::Str(_) => "string",
            FieldValue::Null => "null",
            FieldValue::Nested(_) => "nested",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            FieldValue::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::UInt(v) => Some(*v),
            FieldValue::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::UInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::UInt(v) => write!(f, "{}", v),
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Str(v) => write!(f, "{}", v),
            FieldValue::Null => write!(f, "null"),
            FieldValue::Nested(v) => write!(f, "{}", v),
        }
    }
}

impl From<&FieldValue> for StateValue {
    fn from(v: &FieldValue) -> Self {
        match v {
            FieldValue::Bool(b) => StateValue::Int(*b as i32),
            FieldValue::UInt(v) => match i32::try_from(*v) {
                Ok(v) => StateValue::Int(v),
                Err(_) => StateValue::Long(*v as i64),
            },
            FieldValue::Int(v) => match i32::try_from(*v) {
                Ok(v) => StateValue::Int(v),
                Err(_) => StateValue::Long(*v),
            },
            FieldValue::Float(v) => StateValue::Double(*v),
            FieldValue::Str(s) => StateValue::String(s.clone()),
            FieldValue::Null => StateValue::Null,
            FieldValue::Nested(v) => StateValue::String(v.to_string()),
        }
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::UInt(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub ts: u64,
    #[serde(rename = "event")]
    pub name: String,
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl TraceEvent {
    pub fn new(ts: u64, name: &str) -> Self {
        Self {
            ts,
            name: name.to_string(),
            fields: BTreeMap::new(),
        }
    }

    /// Adds a field to the event.
    pub fn with_field<V: Into<FieldValue>>(mut self, name: &str, value: V) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn opt_field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn field(&self, name: &str) -> Result<&FieldValue, HandlerError> {
        self.fields
            .get(name)
            .ok_or_else(|| HandlerError::MissingField(name.to_string()))
    }

    fn typed_field<'a, T>(
        &'a self,
        name: &str,
        expected: &'static str,
        f: impl FnOnce(&'a FieldValue) -> Option<T>,
    ) -> Result<T, HandlerError> {
        let v = self.field(name)?;

        f(v).ok_or_else(|| HandlerError::FieldType {
            field: name.to_string(),
            expected,
            found: v.type_name(),
        })
    }

    pub fn field_i64(&self, name: &str) -> Result<i64, HandlerError> {
        self.typed_field(name, "integer", FieldValue::as_i64)
    }

    pub fn field_u64(&self, name: &str) -> Result<u64, HandlerError> {
        self.typed_field(name, "unsigned integer", FieldValue::as_u64)
    }

    pub fn field_f64(&self, name: &str) -> Result<f64, HandlerError> {
        self.typed_field(name, "number", FieldValue::as_f64)
    }

    pub fn field_str(&self, name: &str) -> Result<&str, HandlerError> {
        self.typed_field(name, "string", FieldValue::as_str)
    }

    /// Like `field_u64`, but a missing field is not an error.
    pub fn opt_field_u64(&self, name: &str) -> Result<Option<u64>, HandlerError> {
        match self.fields.contains_key(name) {
            true => self.field_u64(name).map(Some),
            false => Ok(None),
        }
    }

    /// Like `field_str`, but a missing field is not an error.
    pub fn opt_field_str(&self, name: &str) -> Result<Option<&str>, HandlerError> {
        match self.fields.contains_key(name) {
            true => self.field_str(name).map(Some),
            false => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FieldValue, TraceEvent};
    use crate::provider::HandlerError;
    use crate::state::StateValue;

    const EVENTS: &str = r#"[
    {"ts":0,"event":"entry","pid":1000,"tid":42,"name":"main"},
    {"ts":4,"event":"sample","cpu":-1,"load":0.5,"idle":false},
    {"ts":9,"event":"exit","pid":1000,"tid":"42"}
    ]
    "#;

    #[test]
    fn test_parse_events() {
        let events: Vec<TraceEvent> = serde_json::from_str(EVENTS).unwrap();

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].field_i64("pid").unwrap(), 1000);
        assert_eq!(events[1].field_i64("cpu").unwrap(), -1);
        assert_eq!(events[1].field_f64("load").unwrap(), 0.5);
        assert_eq!(events[1].opt_field("idle"), Some(&FieldValue::Bool(false)));
    }

    #[test]
    fn test_field_errors() {
        let events: Vec<TraceEvent> = serde_json::from_str(EVENTS).unwrap();

        assert_eq!(
            events[2].field_u64("tid"),
            Err(HandlerError::FieldType {
                field: "tid".into(),
                expected: "unsigned integer",
                found: "string",
            })
        );
        assert_eq!(
            events[2].field_str("name"),
            Err(HandlerError::MissingField("name".into()))
        );
        assert_eq!(events[1].field_u64("cpu").is_err(), true);
        assert_eq!(events[2].opt_field_str("name"), Ok(None));
    }

    #[test]
    fn test_state_values() {
        let e = TraceEvent::new(1, "x")
            .with_field("small", 7u64)
            .with_field("big", 1u64 << 40)
            .with_field("s", "foo");

        assert_eq!(StateValue::from(e.field("small").unwrap()), StateValue::Int(7));
        assert_eq!(
            StateValue::from(e.field("big").unwrap()),
            StateValue::Long(1 << 40)
        );
        assert_eq!(StateValue::from(e.field("s").unwrap()), StateValue::from("foo"));
    }

    #[test]
    fn test_null_and_nested_fields() {
        let e: TraceEvent = serde_json::from_str(
            r#"{"ts":3,"event":"marker","args":null,"ctx":{"cpu":2},"ids":[1,2]}"#,
        )
        .unwrap();

        assert_eq!(e.opt_field("args"), Some(&FieldValue::Null));
        assert_eq!(StateValue::from(e.field("args").unwrap()), StateValue::Null);
        assert_eq!(
            StateValue::from(e.field("ctx").unwrap()),
            StateValue::from(r#"{"cpu":2}"#)
        );
        assert_eq!(e.field("ids").unwrap().to_string(), "[1,2]");
        assert_eq!(
            e.field_str("args"),
            Err(HandlerError::FieldType {
                field: "args".into(),
                expected: "string",
                found: "null",
            })
        );
    }
}
