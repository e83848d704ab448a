//! Typed property values

use crate::core::types::{format_date, parse_date};
use crate::core::{Error, Result, Timestamp};
use crate::node::handle::NodeHandle;
use std::fmt;

/// Type tag of a property value, as written to the `type` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    String,
    Integer,
    Float,
    Boolean,
    Date,
    Node,
}

impl ValueType {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Integer => "integer",
            ValueType::Float => "float",
            ValueType::Boolean => "boolean",
            ValueType::Date => "date",
            ValueType::Node => "node",
        }
    }

    /// Parse a type tag; unknown tags read as None
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "string" => Some(ValueType::String),
            "integer" => Some(ValueType::Integer),
            "float" => Some(ValueType::Float),
            "boolean" => Some(ValueType::Boolean),
            "date" => Some(ValueType::Date),
            "node" => Some(ValueType::Node),
            _ => None,
        }
    }
}

/// Value of a node property
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Date(Timestamp),
    Node(NodeHandle),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::String(_) => ValueType::String,
            Value::Integer(_) => ValueType::Integer,
            Value::Float(_) => ValueType::Float,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Date(_) => ValueType::Date,
            Value::Node(_) => ValueType::Node,
        }
    }

    /// Parse the textual form of a value of type `ty`
    pub fn parse(ty: ValueType, text: &str) -> Result<Value> {
        let bad = || Error::invalid_input(format!("Invalid {} value {:?}", ty.as_str(), text));
        Ok(match ty {
            ValueType::String => Value::String(text.to_string()),
            ValueType::Integer => Value::Integer(text.trim().parse().map_err(|_| bad())?),
            ValueType::Float => Value::Float(text.trim().parse().map_err(|_| bad())?),
            ValueType::Boolean => Value::Boolean(text.trim().eq_ignore_ascii_case("true")),
            ValueType::Date => Value::Date(parse_date(text).ok_or_else(bad)?),
            ValueType::Node => return Err(bad()),
        })
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::String(s) => s.trim().parse().ok(),
            Value::Boolean(b) => Some(*b as i64),
            Value::Date(d) => Some(d.timestamp_millis()),
            Value::Node(_) => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> bool {
        match self {
            Value::Boolean(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => s.eq_ignore_ascii_case("true"),
            Value::Date(_) | Value::Node(_) => true,
        }
    }

    pub fn as_date(&self) -> Option<Timestamp> {
        match self {
            Value::Date(d) => Some(*d),
            Value::String(s) => parse_date(s),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&NodeHandle> {
        match self {
            Value::Node(h) => Some(h),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => f.write_str(s),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Date(d) => f.write_str(&format_date(d)),
            Value::Node(h) => f.write_str(&h.id()),
        }
    }
}

/// Named property of a node; the name keeps its original spelling
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    name: String,
    value: Value,
}

impl Property {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn set_value(&mut self, value: Value) {
        self.value = value;
    }

    pub fn value_type(&self) -> ValueType {
        self.value.value_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_values() {
        assert_eq!(Value::parse(ValueType::Integer, " 7 ").unwrap(), Value::Integer(7));
        assert_eq!(Value::parse(ValueType::Float, "2.5").unwrap(), Value::Float(2.5));
        assert_eq!(Value::parse(ValueType::Boolean, "TRUE").unwrap(), Value::Boolean(true));
        assert!(Value::parse(ValueType::Integer, "seven").is_err());
        assert!(Value::parse(ValueType::Node, "3").is_err());

        let date = Value::parse(ValueType::Date, "17.03.2004 09:05:59").unwrap();
        assert_eq!(date.to_string(), "17.03.2004 09:05:59");
    }

    #[test]
    fn test_conversions() {
        assert_eq!(Value::String("12".into()).as_integer(), Some(12));
        assert_eq!(Value::Integer(3).as_float(), Some(3.0));
        assert!(Value::Integer(1).as_boolean());
        assert!(!Value::String("no".into()).as_boolean());
        assert_eq!(ValueType::from_name("Date"), Some(ValueType::Date));
        assert_eq!(ValueType::from_name("blob"), None);
    }
}
