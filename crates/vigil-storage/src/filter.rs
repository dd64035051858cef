//! Filter expression trees and their JSON wire form.
//!
//! Every node is an object with exactly one key naming its operator:
//!
//! ```text
//! {"and": [{"=": {"state": "alarm"}}, {">=": {"severity": "moderate"}}]}
//! {"not": {"in": {"type": ["threshold", "event"]}}}
//! ```
//!
//! A simple node maps one field to its operand. A complex node holds a list
//! of child nodes; `not` also accepts a single child object.
//!
//! # Example
//!
//! ```rust
//! use vigil_storage::filter::{FilterExpr, SimpleOp};
//! use serde_json::json;
//!
//! let expr: FilterExpr = serde_json::from_value(json!({
//!     "or": [{"=": {"state": "alarm"}}, {"=~": {"name": "^cpu"}}]
//! })).unwrap();
//! assert!(expr.is_complex());
//!
//! let simple = FilterExpr::simple(SimpleOp::Eq, "state", json!("ok"));
//! assert_eq!(serde_json::to_value(&simple).unwrap(), json!({"=": {"state": "ok"}}));
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{Result, StorageError};

/// Comparison applied by a simple node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SimpleOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    /// Case-sensitive substring match.
    Contains,
    Regex,
}

impl SimpleOp {
    /// Parses an operator name, accepting the symbolic and spelled-out aliases.
    pub fn from_wire(name: &str) -> Option<Self> {
        let op = match name.to_lowercase().as_str() {
            "=" | "==" | "eq" => SimpleOp::Eq,
            "!=" | "<>" | "ne" => SimpleOp::Ne,
            "<" | "lt" => SimpleOp::Lt,
            "<=" | "le" => SimpleOp::Le,
            ">" | "gt" => SimpleOp::Gt,
            ">=" | "ge" => SimpleOp::Ge,
            "in" => SimpleOp::In,
            "not in" | "not-in" | "nin" => SimpleOp::NotIn,
            "contains" | "substring" | "substring-match" => SimpleOp::Contains,
            "=~" | "regex" | "regex-match" => SimpleOp::Regex,
            _ => return None,
        };
        Some(op)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            SimpleOp::Eq => "=",
            SimpleOp::Ne => "!=",
            SimpleOp::Lt => "<",
            SimpleOp::Le => "<=",
            SimpleOp::Gt => ">",
            SimpleOp::Ge => ">=",
            SimpleOp::In => "in",
            SimpleOp::NotIn => "not in",
            SimpleOp::Contains => "contains",
            SimpleOp::Regex => "=~",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

impl LogicalOp {
    pub fn from_wire(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "and" => Some(LogicalOp::And),
            "or" => Some(LogicalOp::Or),
            "not" => Some(LogicalOp::Not),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            LogicalOp::And => "and",
            LogicalOp::Or => "or",
            LogicalOp::Not => "not",
        }
    }
}

/// A boolean predicate over the named fields of one entity.
///
/// Values stay untyped here; they are checked against the field's kind when
/// the tree is translated for a concrete entity.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    Simple {
        op: SimpleOp,
        field: String,
        value: Value,
    },
    Complex {
        op: LogicalOp,
        children: Vec<FilterExpr>,
    },
}

fn malformed(msg: impl Into<String>) -> StorageError {
    StorageError::MalformedFilter(msg.into())
}

impl FilterExpr {
    pub fn simple(op: SimpleOp, field: impl Into<String>, value: impl Into<Value>) -> Self {
        FilterExpr::Simple {
            op,
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::simple(SimpleOp::Eq, field, value)
    }

    pub fn and(children: Vec<FilterExpr>) -> Self {
        FilterExpr::Complex {
            op: LogicalOp::And,
            children,
        }
    }

    pub fn or(children: Vec<FilterExpr>) -> Self {
        FilterExpr::Complex {
            op: LogicalOp::Or,
            children,
        }
    }

    pub fn negate(child: FilterExpr) -> Self {
        FilterExpr::Complex {
            op: LogicalOp::Not,
            children: vec![child],
        }
    }

    /// Whether the tree needs the backend's complex-query capability.
    pub fn is_complex(&self) -> bool {
        matches!(self, FilterExpr::Complex { .. })
    }

    /// Parses the JSON wire form. Arity of complex nodes is checked later,
    /// at translation time.
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| malformed(format!("filter node must be an object, got {value}")))?;
        let (key, body) = single_entry(obj)
            .ok_or_else(|| malformed(format!("filter node must have exactly one operator, found {}", obj.len())))?;

        if let Some(op) = LogicalOp::from_wire(key) {
            let children = match body {
                Value::Array(items) => items.iter().map(Self::from_json).collect::<Result<Vec<_>>>()?,
                Value::Object(_) if op == LogicalOp::Not => vec![Self::from_json(body)?],
                other => {
                    return Err(malformed(format!("'{key}' expects a list of filters, got {other}")));
                }
            };
            return Ok(FilterExpr::Complex { op, children });
        }

        let op = SimpleOp::from_wire(key).ok_or_else(|| malformed(format!("unknown operator '{key}'")))?;
        let operand = body
            .as_object()
            .ok_or_else(|| malformed(format!("'{key}' expects a {{field: value}} object, got {body}")))?;
        let (field, value) = single_entry(operand)
            .ok_or_else(|| malformed(format!("'{key}' must name exactly one field, found {}", operand.len())))?;

        Ok(FilterExpr::Simple {
            op,
            field: field.clone(),
            value: value.clone(),
        })
    }

    pub fn to_json(&self) -> Value {
        let mut node = Map::new();
        match self {
            FilterExpr::Simple { op, field, value } => {
                let mut operand = Map::new();
                operand.insert(field.clone(), value.clone());
                node.insert(op.symbol().to_string(), Value::Object(operand));
            }
            FilterExpr::Complex { op, children } => {
                let items = children.iter().map(Self::to_json).collect();
                node.insert(op.symbol().to_string(), Value::Array(items));
            }
        }
        Value::Object(node)
    }
}

fn single_entry(map: &Map<String, Value>) -> Option<(&String, &Value)> {
    let mut entries = map.iter();
    match (entries.next(), entries.next()) {
        (Some(entry), None) => Some(entry),
        _ => None,
    }
}

impl Serialize for FilterExpr {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FilterExpr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        FilterExpr::from_json(&value).map_err(serde::de::Error::custom)
    }
}
