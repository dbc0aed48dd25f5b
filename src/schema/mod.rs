//! Schema registry: declared shapes for raw record kinds and star tables.
//!
//! Everything here is plain data. The normalizer coerces raw JSON against a
//! [`DeclaredSchema`], the loaders use a [`TableSpec`] to find natural keys
//! and partition columns, and sinks derive their column declarations from it.

pub mod catalog;
pub mod declared;

pub use catalog::{StarSchema, StarTable, TableId, TableSpec};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Canonical timestamp layout used for keys and relational storage.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const TIMESTAMP_INPUT_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalType {
    Text,
    Integer,
    Double,
    Timestamp,
}

impl LogicalType {
    pub fn sql_type(self) -> &'static str {
        match self {
            LogicalType::Text => "TEXT",
            LogicalType::Integer => "INTEGER",
            LogicalType::Double => "REAL",
            LogicalType::Timestamp => "TEXT",
        }
    }

    /// Coerce a raw JSON value into this type.
    ///
    /// Permissive: anything that cannot be represented becomes `Scalar::Null`
    /// and is left for the nullability check to judge. Blank strings are null.
    pub fn coerce(self, value: Option<&serde_json::Value>) -> Scalar {
        use serde_json::Value;

        let value = match value {
            None | Some(Value::Null) => return Scalar::Null,
            Some(Value::String(s)) if s.trim().is_empty() => return Scalar::Null,
            Some(v) => v,
        };

        match self {
            LogicalType::Text => match value {
                Value::String(s) => Scalar::Text(s.clone()),
                Value::Number(n) => Scalar::Text(n.to_string()),
                Value::Bool(b) => Scalar::Text(b.to_string()),
                _ => Scalar::Null,
            },
            LogicalType::Integer => match value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                    .map(Scalar::Int)
                    .unwrap_or(Scalar::Null),
                Value::String(s) => {
                    let s = s.trim();
                    s.parse::<i64>()
                        .ok()
                        .or_else(|| {
                            s.parse::<f64>()
                                .ok()
                                .filter(|f| f.is_finite() && f.fract() == 0.0)
                                .map(|f| f as i64)
                        })
                        .map(Scalar::Int)
                        .unwrap_or(Scalar::Null)
                }
                _ => Scalar::Null,
            },
            LogicalType::Double => match value {
                Value::Number(n) => n.as_f64().map(Scalar::Float).unwrap_or(Scalar::Null),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(Scalar::Float)
                    .unwrap_or(Scalar::Null),
                _ => Scalar::Null,
            },
            LogicalType::Timestamp => match value {
                Value::String(s) => parse_timestamp(s.trim())
                    .map(Scalar::Timestamp)
                    .unwrap_or(Scalar::Null),
                _ => Scalar::Null,
            },
        }
    }
}

pub fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    TIMESTAMP_INPUT_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

/// A single typed cell.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Float(v) => Some(*v),
            Scalar::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Scalar::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Stable textual form used when comparing keys across sinks.
    pub fn key_repr(&self) -> String {
        match self {
            Scalar::Null => "NULL".to_string(),
            Scalar::Int(v) => v.to_string(),
            Scalar::Float(v) => v.to_string(),
            Scalar::Text(s) => s.clone(),
            Scalar::Timestamp(ts) => ts.format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Scalar::Text(value)
    }
}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Scalar::Text(value.to_string())
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Int(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<NaiveDateTime> for Scalar {
    fn from(value: NaiveDateTime) -> Self {
        Scalar::Timestamp(value)
    }
}

impl<T: Into<Scalar>> From<Option<T>> for Scalar {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Scalar::Null)
    }
}

// Floats compare by bit pattern so rows can be hashed for distinct projection.
impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Scalar::Null, Scalar::Null) => true,
            (Scalar::Int(a), Scalar::Int(b)) => a == b,
            (Scalar::Float(a), Scalar::Float(b)) => a.to_bits() == b.to_bits(),
            (Scalar::Text(a), Scalar::Text(b)) => a == b,
            (Scalar::Timestamp(a), Scalar::Timestamp(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Scalar {}

impl Hash for Scalar {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Scalar::Null => {}
            Scalar::Int(v) => v.hash(state),
            Scalar::Float(v) => v.to_bits().hash(state),
            Scalar::Text(s) => s.hash(state),
            Scalar::Timestamp(ts) => ts.hash(state),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key_repr())
    }
}

/// One column of a declared schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub logical_type: LogicalType,
    pub nullable: bool,
    /// Raw field name when it differs from the column name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl ColumnSpec {
    pub fn required(name: &str, logical_type: LogicalType) -> Self {
        Self {
            name: name.to_string(),
            logical_type,
            nullable: false,
            source: None,
        }
    }

    pub fn nullable(name: &str, logical_type: LogicalType) -> Self {
        Self {
            nullable: true,
            ..Self::required(name, logical_type)
        }
    }

    pub fn from_field(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    pub fn source_field(&self) -> &str {
        self.source.as_deref().unwrap_or(&self.name)
    }
}

/// Ordered column name -> {logical type, nullable}.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeclaredSchema {
    pub columns: Vec<ColumnSpec>,
}

impl DeclaredSchema {
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self { columns }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Values in declared column order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Row(pub Vec<Scalar>);

impl Row {
    pub fn new(values: Vec<Scalar>) -> Self {
        Self(values)
    }

    pub fn get(&self, index: usize) -> Option<&Scalar> {
        self.0.get(index)
    }

    pub fn values(&self) -> &[Scalar] {
        &self.0
    }
}

/// Natural (or uniqueness) key of a row, in key-column order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey(pub Vec<String>);

impl RowKey {
    pub fn from_scalars<'a>(values: impl IntoIterator<Item = &'a Scalar>) -> Self {
        Self(values.into_iter().map(Scalar::key_repr).collect())
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})", self.0.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerce_permissive() {
        assert_eq!(LogicalType::Integer.coerce(Some(&json!(2000))), Scalar::Int(2000));
        assert_eq!(LogicalType::Integer.coerce(Some(&json!("39"))), Scalar::Int(39));
        assert_eq!(LogicalType::Integer.coerce(Some(&json!(12.5))), Scalar::Null);
        assert_eq!(LogicalType::Double.coerce(Some(&json!("180.5"))), Scalar::Float(180.5));
        assert_eq!(LogicalType::Double.coerce(Some(&json!("north"))), Scalar::Null);
        assert_eq!(LogicalType::Text.coerce(Some(&json!(39))), Scalar::Text("39".into()));
        assert_eq!(LogicalType::Text.coerce(Some(&json!("   "))), Scalar::Null);
        assert_eq!(LogicalType::Text.coerce(None), Scalar::Null);
    }

    #[test]
    fn test_timestamp_key_repr_round_trips() {
        let ts = parse_timestamp("2020-09-13T12:26:40").unwrap();
        let repr = Scalar::Timestamp(ts).key_repr();
        assert_eq!(repr, "2020-09-13 12:26:40");
        assert_eq!(
            LogicalType::Timestamp.coerce(Some(&json!(repr))),
            Scalar::Timestamp(ts)
        );
    }

    #[test]
    fn test_rows_with_floats_hash_consistently() {
        use std::collections::HashSet;
        let a = Row::new(vec![Scalar::from("SOAAA1"), Scalar::Float(180.5)]);
        let b = Row::new(vec![Scalar::from("SOAAA1"), Scalar::Float(180.5)]);
        let c = Row::new(vec![Scalar::from("SOAAA1"), Scalar::Float(180.25)]);
        let set: HashSet<Row> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }
}
