//! Port types and metadata for node connections

use serde_json::json;

use crate::data::{DataType, NodeData};

/// Direction of a port (input or output)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

/// Port schema entry declared by a node class
#[derive(Debug, Clone)]
pub struct PortDefinition {
    pub key: String,
    pub data_type: DataType,
    pub required: bool,
    /// Literal default, used for introspection; compute procedures apply it
    /// explicitly if they want it
    pub default: Option<String>,
    pub description: Option<String>,
}

impl PortDefinition {
    /// Declare a required port
    pub fn required(key: &str, data_type: DataType) -> Self {
        Self {
            key: key.to_string(),
            data_type,
            required: true,
            default: None,
            description: None,
        }
    }

    /// Declare an optional port
    pub fn optional(key: &str, data_type: DataType) -> Self {
        Self {
            key: key.to_string(),
            data_type,
            required: false,
            default: None,
            description: None,
        }
    }

    pub fn with_default(mut self, literal: &str) -> Self {
        self.default = Some(literal.to_string());
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }
}

/// Introspection record for a port: metadata JSON plus default presence
#[derive(Debug, Clone, PartialEq)]
pub struct PortMetadata {
    pub key: String,
    /// `{"type":"integer|float|string|boolean|none","value":"<stringified>"}`;
    /// complex types carry no value
    pub value_json: String,
    pub has_default: bool,
}

/// A connection point on a node, holding at most one value
#[derive(Debug, Clone)]
pub struct Port {
    key: String,
    direction: PortDirection,
    data_type: DataType,
    required: bool,
    default: Option<String>,
    description: Option<String>,
    data: Option<NodeData>,
}

impl Port {
    pub fn from_definition(def: &PortDefinition, direction: PortDirection) -> Self {
        Self {
            key: def.key.clone(),
            direction,
            data_type: def.data_type.clone(),
            required: def.required,
            default: def.default.clone(),
            description: def.description.clone(),
            data: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    pub fn is_input(&self) -> bool {
        matches!(self.direction, PortDirection::Input)
    }

    pub fn is_output(&self) -> bool {
        matches!(self.direction, PortDirection::Output)
    }

    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn default_literal(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn data(&self) -> Option<&NodeData> {
        self.data.as_ref()
    }

    /// Replace the held value. The previous value is released, never mutated.
    pub fn set_data(&mut self, data: Option<NodeData>) {
        self.data = data;
    }

    /// Metadata for UI-facing introspection.
    ///
    /// The value field is the currently held data when present, otherwise
    /// the declared default literal.
    pub fn metadata(&self) -> PortMetadata {
        let type_name = self.data_type.interworking_name();
        let value = match (&self.data, &self.default) {
            _ if type_name == "none" => None,
            (Some(data), _) => Some(data.to_string()),
            (None, Some(default)) => Some(default.clone()),
            (None, None) => None,
        };
        let value_json = match &value {
            Some(v) => json!({"type": type_name, "value": v}).to_string(),
            None => json!({"type": type_name}).to_string(),
        };
        PortMetadata {
            key: self.key.clone(),
            value_json,
            has_default: value.is_some(),
        }
    }
}
