//! Property values stored on graph nodes.

use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

use crate::schema::ValueType;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int64(i64),
    /// 64-bit float.
    Float64(f64),
    /// UTF-8 string.
    String(String),
    /// Calendar date as days since the Unix epoch.
    Date(i32),
    /// UTC timestamp as microseconds since the Unix epoch.
    Timestamp(i64),
}

impl Value {
    /// The declared type this value satisfies, or `None` for null.
    pub fn value_type(&self) -> Option<ValueType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ValueType::Bool),
            Value::Int64(_) => Some(ValueType::Int64),
            Value::Float64(_) => Some(ValueType::Float64),
            Value::String(_) => Some(ValueType::String),
            Value::Date(_) => Some(ValueType::Date),
            Value::Timestamp(_) => Some(ValueType::Timestamp),
        }
    }

    /// Whether this is the null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer payload, if any.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// String payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Float64(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Date(d) => write!(f, "date({d})"),
            Value::Timestamp(t) => write!(f, "timestamp({t})"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float64(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// A named attribute.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct Property {
    /// Attribute name.
    pub name: String,
    /// Attribute value.
    pub value: Value,
}

/// An attribute map, kept sorted by name with unique names.
#[derive(Debug, Clone, Default, PartialEq, Archive, Serialize, Deserialize)]
pub struct Properties(Vec<Property>);

impl Properties {
    /// Create an empty attribute map.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Set an attribute, replacing any previous value under the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.0.binary_search_by(|p| p.name.as_str().cmp(&name)) {
            Ok(idx) => self.0[idx].value = value,
            Err(idx) => self.0.insert(idx, Property { name, value }),
        }
    }

    /// Builder form of [`Properties::set`].
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Look up an attribute by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0
            .binary_search_by(|p| p.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.0[idx].value)
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no attributes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate attributes in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Property> {
        self.0.iter()
    }

    /// Names of attributes whose values differ between `self` and `other`.
    ///
    /// An attribute present on one side only counts as differing.
    pub fn diverging(&self, other: &Properties) -> Vec<String> {
        let mut names = Vec::new();
        for p in &self.0 {
            if other.get(&p.name) != Some(&p.value) {
                names.push(p.name.clone());
            }
        }
        for p in &other.0 {
            if self.get(&p.name).is_none() {
                names.push(p.name.clone());
            }
        }
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_sorted_and_unique() {
        let props = Properties::new()
            .with("title", "Dune")
            .with("author", "Herbert")
            .with("title", "Dune Messiah");

        let names: Vec<_> = props.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["author", "title"]);
        assert_eq!(props.get("title"), Some(&Value::from("Dune Messiah")));
    }

    #[test]
    fn test_diverging() {
        let stored = Properties::new().with("title", "Dune").with("isbn", Value::Null);
        let incoming = Properties::new()
            .with("title", "Emma")
            .with("isbn", Value::Null)
            .with("author", "Austen");

        assert_eq!(stored.diverging(&incoming), vec!["title", "author"]);
        assert!(stored.diverging(&stored.clone()).is_empty());
    }

    #[test]
    fn test_option_into_value() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some(3i64)), Value::Int64(3));
        assert_eq!(Value::Int64(3).value_type(), Some(ValueType::Int64));
        assert_eq!(Value::Null.value_type(), None);
    }
}
