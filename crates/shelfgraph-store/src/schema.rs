//! Node and edge type declarations.
//!
//! The schema is persisted in its own tree, one rkyv-encoded definition per
//! type under `node:{Label}` or `edge:{TYPE}`. Declaring a type that already
//! exists with the same shape is a no-op.

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::Error;
use crate::storage::aligned;
use crate::value::Properties;

/// Attribute types a property may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum ValueType {
    /// Boolean.
    Bool,
    /// 64-bit signed integer.
    Int64,
    /// 64-bit float.
    Float64,
    /// UTF-8 string.
    String,
    /// Days since the Unix epoch.
    Date,
    /// Microseconds since the Unix epoch, UTC.
    Timestamp,
}

impl ValueType {
    /// Lowercase type name used in messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Bool => "bool",
            ValueType::Int64 => "int64",
            ValueType::Float64 => "float64",
            ValueType::String => "string",
            ValueType::Date => "date",
            ValueType::Timestamp => "timestamp",
        }
    }
}

/// A declared node property.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct PropertyDef {
    /// Property name.
    pub name: String,
    /// Value type when not null.
    pub value_type: ValueType,
    /// Whether null is rejected.
    pub required: bool,
}

impl PropertyDef {
    /// A property that must be present and non-null.
    pub fn required(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            required: true,
        }
    }

    /// A nullable property.
    pub fn optional(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
            required: false,
        }
    }
}

/// A node label and its properties.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct NodeTypeDef {
    /// Node label.
    pub name: String,
    /// Declared properties, in declaration order.
    pub properties: Vec<PropertyDef>,
}

impl NodeTypeDef {
    /// Create a node type with no properties.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
        }
    }

    /// Add a property.
    pub fn with_property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    /// Look up a property definition.
    pub fn property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Check a node's attributes against this declaration.
    pub fn validate(&self, id: i64, properties: &Properties) -> Result<(), Error> {
        let violation = |property: &str, reason: String| Error::PropertyViolation {
            label: self.name.clone(),
            id,
            property: property.to_string(),
            reason,
        };

        for prop in properties.iter() {
            let def = self
                .property(&prop.name)
                .ok_or_else(|| violation(&prop.name, "is not declared".to_string()))?;
            match prop.value.value_type() {
                None if def.required => {
                    return Err(violation(&prop.name, "is required".to_string()));
                }
                Some(found) if found != def.value_type => {
                    return Err(violation(
                        &prop.name,
                        format!(
                            "has type {}, expected {}",
                            found.as_str(),
                            def.value_type.as_str()
                        ),
                    ));
                }
                _ => {}
            }
        }

        for def in self.properties.iter().filter(|d| d.required) {
            if properties.get(&def.name).is_none() {
                return Err(violation(&def.name, "is required".to_string()));
            }
        }

        Ok(())
    }

    /// Describe how `other` differs from this declaration, if at all.
    pub fn shape_difference(&self, other: &NodeTypeDef) -> Option<String> {
        for def in &self.properties {
            match other.property(&def.name) {
                None => return Some(format!("property {} is missing", def.name)),
                Some(o) if o != def => {
                    return Some(format!(
                        "property {} is {} (required: {}), expected {} (required: {})",
                        def.name,
                        o.value_type.as_str(),
                        o.required,
                        def.value_type.as_str(),
                        def.required
                    ));
                }
                _ => {}
            }
        }
        other
            .properties
            .iter()
            .find(|o| self.property(&o.name).is_none())
            .map(|o| format!("unexpected property {}", o.name))
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned(bytes))
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// A relationship type between two node labels.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct EdgeTypeDef {
    /// Relationship type name.
    pub name: String,
    /// Source node label.
    pub from: String,
    /// Target node label.
    pub to: String,
}

impl EdgeTypeDef {
    /// Create an edge type.
    pub fn new(name: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    pub(crate) fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned(bytes))
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// The full set of types a store is expected to hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphSchema {
    /// Node types.
    pub nodes: Vec<NodeTypeDef>,
    /// Edge types.
    pub edges: Vec<EdgeTypeDef>,
}

impl GraphSchema {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node type.
    pub fn with_node(mut self, node: NodeTypeDef) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add an edge type.
    pub fn with_edge(mut self, edge: EdgeTypeDef) -> Self {
        self.edges.push(edge);
        self
    }

    /// Look up a node type.
    pub fn node(&self, name: &str) -> Option<&NodeTypeDef> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Look up an edge type.
    pub fn edge(&self, name: &str) -> Option<&EdgeTypeDef> {
        self.edges.iter().find(|e| e.name == name)
    }
}

/// Schema keys inserted by one `declare_schema` call.
///
/// Types that were already present are not listed, so retracting a
/// declaration only removes what that call added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDeclaration {
    /// Schema tree keys written by this declaration.
    pub inserted: Vec<String>,
}

impl SchemaDeclaration {
    /// Whether the declaration added nothing.
    pub fn is_noop(&self) -> bool {
        self.inserted.is_empty()
    }
}
