//! Typed values flowing between ports

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::{raise, FlowError, Result};

/// Data types that can flow through ports
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataType {
    Integer,
    Float,
    Boolean,
    String,
    /// Complex type identified by name, not editable or serializable
    Opaque(std::string::String),
}

impl DataType {
    /// Engine name for this type
    pub fn name(&self) -> &str {
        match self {
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::Boolean => "boolean",
            DataType::String => "string",
            DataType::Opaque(name) => name,
        }
    }

    /// Introspection name exposed in port metadata: one of
    /// `integer`, `float`, `string`, `boolean`, or `none` for complex types
    pub fn interworking_name(&self) -> &'static str {
        match self {
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::Boolean => "boolean",
            DataType::String => "string",
            DataType::Opaque(_) => "none",
        }
    }

    pub fn parse(name: &str) -> DataType {
        match name {
            "integer" => DataType::Integer,
            "float" => DataType::Float,
            "boolean" => DataType::Boolean,
            "string" => DataType::String,
            other => DataType::Opaque(other.to_string()),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Payload of an opaque value: a shared, type-erased object
#[derive(Clone)]
pub struct OpaqueData {
    type_name: std::string::String,
    value: Arc<dyn Any + Send + Sync>,
}

impl OpaqueData {
    pub fn new(type_name: impl Into<std::string::String>, value: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            type_name: type_name.into(),
            value,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn value(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.value
    }
}

impl fmt::Debug for OpaqueData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpaqueData")
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// An immutable tagged value held by a port.
///
/// "Setting" a port replaces the held value; a `NodeData` is never mutated
/// in place.
#[derive(Debug, Clone)]
pub enum NodeData {
    Integer(i32),
    Float(f64),
    Boolean(bool),
    String(std::string::String),
    Opaque(OpaqueData),
}

impl NodeData {
    pub fn integer(value: i32) -> Self {
        NodeData::Integer(value)
    }

    pub fn float(value: f64) -> Self {
        NodeData::Float(value)
    }

    pub fn boolean(value: bool) -> Self {
        NodeData::Boolean(value)
    }

    pub fn string(value: impl Into<std::string::String>) -> Self {
        NodeData::String(value.into())
    }

    pub fn opaque(type_name: impl Into<std::string::String>, value: Arc<dyn Any + Send + Sync>) -> Self {
        NodeData::Opaque(OpaqueData::new(type_name, value))
    }

    /// The type tag of this value
    pub fn data_type(&self) -> DataType {
        match self {
            NodeData::Integer(_) => DataType::Integer,
            NodeData::Float(_) => DataType::Float,
            NodeData::Boolean(_) => DataType::Boolean,
            NodeData::String(_) => DataType::String,
            NodeData::Opaque(o) => DataType::Opaque(o.type_name().to_string()),
        }
    }

    pub fn as_integer(&self) -> Result<i32> {
        match self {
            NodeData::Integer(v) => Ok(*v),
            other => Err(raise(FlowError::TypeMismatch(format!(
                "expected integer, got {}",
                other.data_type()
            )))),
        }
    }

    pub fn as_float(&self) -> Result<f64> {
        match self {
            NodeData::Float(v) => Ok(*v),
            other => Err(raise(FlowError::TypeMismatch(format!(
                "expected float, got {}",
                other.data_type()
            )))),
        }
    }

    pub fn as_boolean(&self) -> Result<bool> {
        match self {
            NodeData::Boolean(v) => Ok(*v),
            other => Err(raise(FlowError::TypeMismatch(format!(
                "expected boolean, got {}",
                other.data_type()
            )))),
        }
    }

    pub fn as_string(&self) -> Result<&str> {
        match self {
            NodeData::String(v) => Ok(v),
            other => Err(raise(FlowError::TypeMismatch(format!(
                "expected string, got {}",
                other.data_type()
            )))),
        }
    }

    pub fn as_opaque(&self) -> Result<&OpaqueData> {
        match self {
            NodeData::Opaque(o) => Ok(o),
            other => Err(raise(FlowError::TypeMismatch(format!(
                "expected opaque value, got {}",
                other.data_type()
            )))),
        }
    }

    /// JSON form used in graph and node documents.
    ///
    /// Opaque values carry no payload: only their type name is written.
    pub fn to_json(&self) -> Value {
        match self {
            NodeData::Integer(v) => json!({"type": "integer", "value": v}),
            NodeData::Float(v) => json!({"type": "float", "value": v}),
            NodeData::Boolean(v) => json!({"type": "boolean", "value": v}),
            NodeData::String(v) => json!({"type": "string", "value": v}),
            NodeData::Opaque(o) => json!({"type": o.type_name()}),
        }
    }

    /// Parse a value from its document form.
    ///
    /// Returns `Ok(None)` for opaque entries, whose payload does not
    /// round-trip through JSON.
    pub fn from_json(value: &Value) -> Result<Option<NodeData>> {
        let obj = value.as_object().ok_or_else(|| {
            raise(FlowError::InvalidArgument(format!(
                "data value must be an object, got {value}"
            )))
        })?;
        let type_name = obj
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| raise(FlowError::InvalidArgument("data value has no type tag".to_string())))?;

        let payload = obj.get("value");
        let parsed = match DataType::parse(type_name) {
            DataType::Integer => NodeData::Integer(
                payload
                    .and_then(Value::as_i64)
                    .and_then(|v| i32::try_from(v).ok())
                    .ok_or_else(|| {
                        raise(FlowError::InvalidArgument(format!(
                            "invalid integer payload: {value}"
                        )))
                    })?,
            ),
            DataType::Float => NodeData::Float(payload.and_then(Value::as_f64).ok_or_else(|| {
                raise(FlowError::InvalidArgument(format!(
                    "invalid float payload: {value}"
                )))
            })?),
            DataType::Boolean => NodeData::Boolean(payload.and_then(Value::as_bool).ok_or_else(|| {
                raise(FlowError::InvalidArgument(format!(
                    "invalid boolean payload: {value}"
                )))
            })?),
            DataType::String => NodeData::String(
                payload
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        raise(FlowError::InvalidArgument(format!(
                            "invalid string payload: {value}"
                        )))
                    })?
                    .to_string(),
            ),
            DataType::Opaque(_) => return Ok(None),
        };
        Ok(Some(parsed))
    }
}

/// Kind-specific textual form: integers as decimal, floats via Rust's
/// shortest-roundtrip formatting, booleans as `true`/`false`, strings
/// verbatim, opaque values as their type name.
impl fmt::Display for NodeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeData::Integer(v) => write!(f, "{v}"),
            NodeData::Float(v) => write!(f, "{v}"),
            NodeData::Boolean(v) => write!(f, "{v}"),
            NodeData::String(v) => f.write_str(v),
            NodeData::Opaque(o) => f.write_str(o.type_name()),
        }
    }
}

impl PartialEq for NodeData {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (NodeData::Integer(a), NodeData::Integer(b)) => a == b,
            (NodeData::Float(a), NodeData::Float(b)) => a == b,
            (NodeData::Boolean(a), NodeData::Boolean(b)) => a == b,
            (NodeData::String(a), NodeData::String(b)) => a == b,
            (NodeData::Opaque(a), NodeData::Opaque(b)) => Arc::ptr_eq(a.value(), b.value()),
            _ => false,
        }
    }
}
