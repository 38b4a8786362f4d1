use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::{Error as _, SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// One row as produced by a query executor, one value per declared column.
/// Rows may be shorter than the declared column list.
pub type Row = Vec<RawValue>;

/// A dynamically-typed value read from a document.
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
    Bytes(Vec<u8>),
    GeoPoint { latitude: f64, longitude: f64 },
    /// Path of another document.
    Reference(String),
    Map(BTreeMap<String, RawValue>),
    Array(Vec<RawValue>),
}

/// Semantic kind of a [`RawValue`], used for column type unification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Bool,
    Int,
    Float,
    Time,
    String,
    Complex,
    Absent,
}

/// Classify a value. Every value maps to exactly one kind; document-store
/// types without an output type of their own (bytes, geo points, references)
/// are treated as strings.
pub fn classify(value: &RawValue) -> Kind {
    match value {
        RawValue::Null => Kind::Absent,
        RawValue::Bool(_) => Kind::Bool,
        RawValue::Int32(_) | RawValue::Int64(_) => Kind::Int,
        RawValue::Float64(_) => Kind::Float,
        RawValue::Timestamp(_) => Kind::Time,
        RawValue::Map(_) | RawValue::Array(_) => Kind::Complex,
        RawValue::Text(_)
        | RawValue::Bytes(_)
        | RawValue::GeoPoint { .. }
        | RawValue::Reference(_) => Kind::String,
    }
}

impl RawValue {
    pub fn kind(&self) -> Kind {
        classify(self)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RawValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Canonical JSON encoding. Map keys are emitted in sorted order.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Text used when the value lands in a string column.
    ///
    /// Structured values are encoded as JSON. Values JSON cannot hold
    /// (NaN, infinities) make the encoding fail, and the generic textual
    /// rendering is used instead so nothing is lost.
    pub fn render(&self) -> String {
        match self {
            RawValue::Text(s) => s.clone(),
            RawValue::Map(_) | RawValue::Array(_) => match self.to_json() {
                Ok(json) => json,
                Err(err) => {
                    tracing::warn!(error = %err, "json encoding failed, using text form");
                    self.to_string()
                }
            },
            other => other.to_string(),
        }
    }

    /// Look up a dotted path (`address.city`) inside nested maps.
    pub fn get_path(&self, path: &[&str]) -> Option<&RawValue> {
        let mut current = self;
        for segment in path {
            match current {
                RawValue::Map(map) => current = map.get(*segment)?,
                _ => return None,
            }
        }
        Some(current)
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Null => write!(f, "null"),
            RawValue::Bool(b) => write!(f, "{}", b),
            RawValue::Int32(i) => write!(f, "{}", i),
            RawValue::Int64(i) => write!(f, "{}", i),
            RawValue::Float64(v) => write!(f, "{}", v),
            RawValue::Timestamp(ts) => write!(f, "{}", format_timestamp(ts)),
            RawValue::Text(s) => write!(f, "{}", s),
            RawValue::Bytes(b) => write!(f, "[{} bytes]", b.len()),
            RawValue::GeoPoint {
                latitude,
                longitude,
            } => write!(f, "({}, {})", latitude, longitude),
            RawValue::Reference(path) => write!(f, "{}", path),
            RawValue::Map(map) => {
                write!(f, "map[")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}:{}", key, value)?;
                }
                write!(f, "]")
            }
            RawValue::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl Serialize for RawValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RawValue::Null => serializer.serialize_unit(),
            RawValue::Bool(b) => serializer.serialize_bool(*b),
            RawValue::Int32(i) => serializer.serialize_i32(*i),
            RawValue::Int64(i) => serializer.serialize_i64(*i),
            // not representable in JSON
            RawValue::Float64(v) if !v.is_finite() => {
                Err(S::Error::custom(format!("non-finite float {}", v)))
            }
            RawValue::Float64(v) => serializer.serialize_f64(*v),
            RawValue::Timestamp(ts) => serializer.serialize_str(&format_timestamp(ts)),
            RawValue::Text(s) | RawValue::Reference(s) => serializer.serialize_str(s),
            RawValue::Bytes(bytes) => {
                let mut seq = serializer.serialize_seq(Some(bytes.len()))?;
                for b in bytes {
                    seq.serialize_element(b)?;
                }
                seq.end()
            }
            RawValue::GeoPoint {
                latitude,
                longitude,
            } => {
                if !latitude.is_finite() || !longitude.is_finite() {
                    return Err(S::Error::custom("non-finite geo point"));
                }
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("latitude", latitude)?;
                map.serialize_entry("longitude", longitude)?;
                map.end()
            }
            RawValue::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
            RawValue::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
        }
    }
}

impl From<serde_json::Value> for RawValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => RawValue::Null,
            serde_json::Value::Bool(b) => RawValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    RawValue::Int64(i)
                } else {
                    // u64 beyond i64::MAX and non-integers
                    RawValue::Float64(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => RawValue::Text(s),
            serde_json::Value::Array(items) => {
                RawValue::Array(items.into_iter().map(RawValue::from).collect())
            }
            serde_json::Value::Object(map) => RawValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, RawValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for RawValue {
    fn from(b: bool) -> Self {
        RawValue::Bool(b)
    }
}

impl From<i32> for RawValue {
    fn from(i: i32) -> Self {
        RawValue::Int32(i)
    }
}

impl From<i64> for RawValue {
    fn from(i: i64) -> Self {
        RawValue::Int64(i)
    }
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        RawValue::Float64(v)
    }
}

impl From<&str> for RawValue {
    fn from(s: &str) -> Self {
        RawValue::Text(s.to_string())
    }
}

impl From<String> for RawValue {
    fn from(s: String) -> Self {
        RawValue::Text(s)
    }
}

impl From<DateTime<Utc>> for RawValue {
    fn from(ts: DateTime<Utc>) -> Self {
        RawValue::Timestamp(ts)
    }
}
