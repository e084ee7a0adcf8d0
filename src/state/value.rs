//! State values.
//!
//! Custom values are opaque binary payloads tagged with a type id. A state
//! system only accepts custom values whose type id is registered in the
//! `CustomValueRegistry` it was built with, which is also what history files
//! use to decode them.

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// A value provided by an analysis, stored as a custom state value.
pub trait CustomStateValue: Debug + Send + Sync {
    /// Registry key of the value type.
    fn custom_type_id(&self) -> u8;

    /// Binary representation, decoded back by the registered decoder.
    fn to_bytes(&self) -> Vec<u8>;
}

/// Decodes the bytes produced by `CustomStateValue::to_bytes`.
pub type CustomValueDecoder = fn(&[u8]) -> Option<Arc<dyn CustomStateValue>>;

/// Value of an attribute over an interval.
#[derive(Debug, Clone, Default)]
pub enum StateValue {
    /// No data.
    #[default]
    Null,
    /// The state is not known yet: returned by non-blocking queries that go
    /// beyond what the writer has produced. Never stored.
    Unknown,
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    Custom(Arc<dyn CustomStateValue>),
}

impl StateValue {
    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, StateValue::Unknown)
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            StateValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            StateValue::Int(v) => Some(*v as i64),
            StateValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Short name of the value type.
    pub fn type_name(&self) -> &'static str {
        match self {
            StateValue::Null => "null",
            StateValue::Unknown => "unknown",
            StateValue::Int(_) => "int",
            StateValue::Long(_) => "long",
            StateValue::Double(_) => "double",
            StateValue::String(_) => "string",
            StateValue::Custom(_) => "custom",
        }
    }
}

impl PartialEq for StateValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StateValue::Null, StateValue::Null) => true,
            (StateValue::Unknown, StateValue::Unknown) => true,
            (StateValue::Int(a), StateValue::Int(b)) => a == b,
            (StateValue::Long(a), StateValue::Long(b)) => a == b,
            (StateValue::Double(a), StateValue::Double(b)) => a.to_bits() == b.to_bits(),
            (StateValue::String(a), StateValue::String(b)) => a == b,
            (StateValue::Custom(a), StateValue::Custom(b)) => {
                a.custom_type_id() == b.custom_type_id() && a.to_bytes() == b.to_bytes()
            }
            _ => false,
        }
    }
}

impl Display for StateValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateValue::Null => write!(f, "null"),
            StateValue::Unknown => write!(f, "?"),
            StateValue::Int(v) => write!(f, "{}", v),
            StateValue::Long(v) => write!(f, "{}", v),
            StateValue::Double(v) => write!(f, "{}", v),
            StateValue::String(v) => write!(f, "{}", v),
            StateValue::Custom(v) => write!(f, "{:?}", v),
        }
    }
}

impl Serialize for StateValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StateValue::Null => serializer.serialize_none(),
            StateValue::Unknown => serializer.serialize_str("?"),
            StateValue::Int(v) => serializer.serialize_i32(*v),
            StateValue::Long(v) => serializer.serialize_i64(*v),
            StateValue::Double(v) => serializer.serialize_f64(*v),
            StateValue::String(v) => serializer.serialize_str(v),
            StateValue::Custom(v) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("custom_type", &v.custom_type_id())?;
                map.serialize_entry("data", &v.to_bytes())?;
                map.end()
            }
        }
    }
}

impl From<i32> for StateValue {
    fn from(v: i32) -> Self {
        StateValue::Int(v)
    }
}

impl From<i64> for StateValue {
    fn from(v: i64) -> Self {
        StateValue::Long(v)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Double(v)
    }
}

impl From<&str> for StateValue {
    fn from(v: &str) -> Self {
        StateValue::String(v.to_string())
    }
}

impl From<String> for StateValue {
    fn from(v: String) -> Self {
        StateValue::String(v)
    }
}

impl<T: Into<StateValue>> From<Option<T>> for StateValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(StateValue::Null, Into::into)
    }
}

struct RegisteredType {
    name: String,
    decoder: CustomValueDecoder,
}

/// Custom value types known to a state system.
///
/// ```
/// use std::sync::Arc;
/// use statehist::state::value::{CustomStateValue, CustomValueRegistry, StateValue};
///
/// #[derive(Debug)]
/// struct CallSite(u16);
///
/// impl CustomStateValue for CallSite {
///     fn custom_type_id(&self) -> u8 { 7 }
///     fn to_bytes(&self) -> Vec<u8> { self.0.to_le_bytes().to_vec() }
/// }
///
/// fn decode(data: &[u8]) -> Option<Arc<dyn CustomStateValue>> {
///     let raw: [u8; 2] = data.try_into().ok()?;
///     Some(Arc::new(CallSite(u16::from_le_bytes(raw))))
/// }
///
/// let mut registry = CustomValueRegistry::new();
/// assert!(registry.register(7, "call-site", decode));
///
/// let value = StateValue::Custom(Arc::new(CallSite(12)));
/// assert_eq!(registry.decode(7, &[12, 0]), Some(value));
/// assert_eq!(registry.decode(8, &[12, 0]), None);
/// ```
#[derive(Default)]
pub struct CustomValueRegistry {
    types: HashMap<u8, RegisteredType>,
}

impl CustomValueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a custom value type. Returns false if `type_id` is already
    /// taken, in which case the registry is left unchanged.
    pub fn register(&mut self, type_id: u8, name: &str, decoder: CustomValueDecoder) -> bool {
        if self.types.contains_key(&type_id) {
            return false;
        }

        self.types.insert(
            type_id,
            RegisteredType {
                name: name.to_string(),
                decoder,
            },
        );

        true
    }

    pub fn is_registered(&self, type_id: u8) -> bool {
        self.types.contains_key(&type_id)
    }

    pub fn type_name(&self, type_id: u8) -> Option<&str> {
        self.types.get(&type_id).map(|t| t.name.as_str())
    }

    /// Decodes a custom value, or returns `None` if the type is unknown or
    /// the payload is rejected by its decoder.
    pub fn decode(&self, type_id: u8, data: &[u8]) -> Option<StateValue> {
        let t = self.types.get(&type_id)?;

        (t.decoder)(data).map(StateValue::Custom)
    }
}

impl Debug for CustomValueRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.types.iter().map(|(k, v)| (k, &v.name)))
            .finish()
    }
}
