use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt;

use crate::db::{classify, Kind, RawValue};

/// Largest magnitude at which every integer has an exact `f64` form (2^53).
const MAX_EXACT_F64_INT: u64 = 1 << 53;

/// Output type of a column, chosen once from every value in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Bool,
    Int64,
    Float64,
    Time,
    String,
}

impl FieldType {
    /// Type name used in the column-oriented frame format.
    pub fn frame_type(&self) -> &'static str {
        match self {
            FieldType::Bool => "boolean",
            FieldType::Int64 | FieldType::Float64 => "number",
            FieldType::Time => "time",
            FieldType::String => "string",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::Bool => write!(f, "bool"),
            FieldType::Int64 => write!(f, "int64"),
            FieldType::Float64 => write!(f, "float64"),
            FieldType::Time => write!(f, "time"),
            FieldType::String => write!(f, "string"),
        }
    }
}

/// Homogeneous cells of one column. `None` marks a missing cell.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Bool(Vec<Option<bool>>),
    Int64(Vec<Option<i64>>),
    Float64(Vec<Option<f64>>),
    Time(Vec<Option<DateTime<Utc>>>),
    String(Vec<Option<String>>),
}

impl ColumnData {
    pub fn field_type(&self) -> FieldType {
        match self {
            ColumnData::Bool(_) => FieldType::Bool,
            ColumnData::Int64(_) => FieldType::Int64,
            ColumnData::Float64(_) => FieldType::Float64,
            ColumnData::Time(_) => FieldType::Time,
            ColumnData::String(_) => FieldType::String,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ColumnData::Bool(v) => v.len(),
            ColumnData::Int64(v) => v.len(),
            ColumnData::Float64(v) => v.len(),
            ColumnData::Time(v) => v.len(),
            ColumnData::String(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_missing(&self, row: usize) -> bool {
        match self {
            ColumnData::Bool(v) => !matches!(v.get(row), Some(Some(_))),
            ColumnData::Int64(v) => !matches!(v.get(row), Some(Some(_))),
            ColumnData::Float64(v) => !matches!(v.get(row), Some(Some(_))),
            ColumnData::Time(v) => !matches!(v.get(row), Some(Some(_))),
            ColumnData::String(v) => !matches!(v.get(row), Some(Some(_))),
        }
    }

    pub fn missing_count(&self) -> usize {
        (0..self.len()).filter(|&i| self.is_missing(i)).count()
    }

    /// JSON form of one cell; missing cells and out-of-range rows are `null`.
    pub fn cell_json(&self, row: usize) -> serde_json::Value {
        use serde_json::Value;
        match self {
            ColumnData::Bool(v) => v.get(row).copied().flatten().map_or(Value::Null, Value::Bool),
            ColumnData::Int64(v) => v.get(row).copied().flatten().map_or(Value::Null, Value::from),
            ColumnData::Float64(v) => v
                .get(row)
                .copied()
                .flatten()
                .and_then(serde_json::Number::from_f64)
                .map_or(Value::Null, Value::Number),
            ColumnData::Time(v) => v
                .get(row)
                .copied()
                .flatten()
                .map_or(Value::Null, |t| Value::String(format_time(&t))),
            ColumnData::String(v) => v
                .get(row)
                .cloned()
                .flatten()
                .map_or(Value::Null, Value::String),
        }
    }

    /// Plain-text form of one cell, `None` if missing.
    pub fn cell_text(&self, row: usize) -> Option<String> {
        match self {
            ColumnData::Bool(v) => v.get(row).copied().flatten().map(|b| b.to_string()),
            ColumnData::Int64(v) => v.get(row).copied().flatten().map(|i| i.to_string()),
            ColumnData::Float64(v) => v.get(row).copied().flatten().map(|f| f.to_string()),
            ColumnData::Time(v) => v.get(row).copied().flatten().map(|t| format_time(&t)),
            ColumnData::String(v) => v.get(row).cloned().flatten(),
        }
    }
}

pub(crate) fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// A named, homogeneously typed column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub data: ColumnData,
}

impl Column {
    pub fn new(name: impl Into<String>, data: ColumnData) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    pub fn field_type(&self) -> FieldType {
        self.data.field_type()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Candidate output types still consistent with every value seen so far.
#[derive(Debug, Clone, Copy)]
struct Candidates {
    bool: bool,
    int: bool,
    float: bool,
    time: bool,
    present: bool,
}

impl Candidates {
    fn new() -> Self {
        Self {
            bool: true,
            int: true,
            float: true,
            time: true,
            present: false,
        }
    }

    fn observe(&mut self, kind: Kind) {
        match kind {
            Kind::Absent => return,
            Kind::Bool => {
                self.int = false;
                self.float = false;
                self.time = false;
            }
            // ints stay float-compatible
            Kind::Int => {
                self.bool = false;
                self.time = false;
            }
            Kind::Float => {
                self.bool = false;
                self.int = false;
                self.time = false;
            }
            Kind::Time => {
                self.bool = false;
                self.int = false;
                self.float = false;
            }
            Kind::String | Kind::Complex => {
                self.bool = false;
                self.int = false;
                self.float = false;
                self.time = false;
            }
        }
        self.present = true;
    }

    fn resolve(&self) -> FieldType {
        if !self.present {
            FieldType::String
        } else if self.bool {
            FieldType::Bool
        } else if self.int {
            FieldType::Int64
        } else if self.float {
            FieldType::Float64
        } else if self.time {
            FieldType::Time
        } else {
            FieldType::String
        }
    }
}

/// Pick the output type for a column from all of its values.
///
/// Precedence is bool > int > float > time > string. A column without any
/// present value is a string column.
pub fn resolve_type<'a, I>(values: I) -> FieldType
where
    I: IntoIterator<Item = &'a RawValue>,
{
    let mut candidates = Candidates::new();
    for value in values {
        candidates.observe(classify(value));
    }
    candidates.resolve()
}

fn to_bool(value: &RawValue) -> Option<bool> {
    match value {
        RawValue::Bool(b) => Some(*b),
        _ => None,
    }
}

fn to_i64(value: &RawValue) -> Option<i64> {
    match value {
        RawValue::Int32(i) => Some(i64::from(*i)),
        RawValue::Int64(i) => Some(*i),
        _ => None,
    }
}

fn to_f64(value: &RawValue) -> Option<f64> {
    match value {
        RawValue::Float64(f) => Some(*f),
        RawValue::Int32(i) => Some(f64::from(*i)),
        RawValue::Int64(i) if i.unsigned_abs() <= MAX_EXACT_F64_INT => Some(*i as f64),
        _ => None,
    }
}

fn to_time(value: &RawValue) -> Option<DateTime<Utc>> {
    match value {
        RawValue::Timestamp(t) => Some(*t),
        _ => None,
    }
}

fn to_text(value: &RawValue) -> Option<String> {
    match value {
        RawValue::Null => None,
        other => Some(other.render()),
    }
}

fn convert<T>(
    column: &str,
    values: &[&RawValue],
    coerce: impl Fn(&RawValue) -> Option<T>,
) -> Vec<Option<T>> {
    values
        .iter()
        .enumerate()
        .map(|(row, value)| {
            if value.is_null() {
                return None;
            }
            let cell = coerce(value);
            if cell.is_none() {
                tracing::warn!(column, row, value = %value, "value not coercible, cell left empty");
            }
            cell
        })
        .collect()
}

/// Build a typed column from the raw values observed for it, one per row.
///
/// Rows that did not supply a value should be passed as [`RawValue::Null`].
/// Cells that cannot be expressed in the resolved type become missing;
/// nothing here fails.
pub fn unify_column(name: &str, values: &[&RawValue]) -> Column {
    let field_type = resolve_type(values.iter().copied());
    let data = match field_type {
        FieldType::Bool => ColumnData::Bool(convert(name, values, to_bool)),
        FieldType::Int64 => ColumnData::Int64(convert(name, values, to_i64)),
        FieldType::Float64 => ColumnData::Float64(convert(name, values, to_f64)),
        FieldType::Time => ColumnData::Time(convert(name, values, to_time)),
        FieldType::String => ColumnData::String(convert(name, values, to_text)),
    };
    tracing::trace!(column = name, field_type = %field_type, rows = values.len(), "column unified");
    Column::new(name, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn unify(values: &[RawValue]) -> Column {
        let refs: Vec<&RawValue> = values.iter().collect();
        unify_column("col", &refs)
    }

    fn ts(secs: i64) -> RawValue {
        RawValue::Timestamp(Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[test]
    fn test_all_integers_resolve_to_int() {
        let col = unify(&[RawValue::Int64(1), RawValue::Int32(-2), RawValue::Int64(i64::MAX)]);
        assert_eq!(
            col.data,
            ColumnData::Int64(vec![Some(1), Some(-2), Some(i64::MAX)])
        );
    }

    #[test]
    fn test_ints_and_floats_resolve_to_float() {
        let col = unify(&[RawValue::Int64(3), RawValue::Float64(1.5), RawValue::Int32(-7)]);
        assert_eq!(
            col.data,
            ColumnData::Float64(vec![Some(3.0), Some(1.5), Some(-7.0)])
        );
    }

    #[test]
    fn test_float_before_int_still_float() {
        let col = unify(&[RawValue::Float64(0.25), RawValue::Int64(4)]);
        assert_eq!(col.field_type(), FieldType::Float64);
    }

    #[test]
    fn test_all_bools() {
        let col = unify(&[RawValue::Bool(true), RawValue::Null, RawValue::Bool(false)]);
        assert_eq!(
            col.data,
            ColumnData::Bool(vec![Some(true), None, Some(false)])
        );
    }

    #[test]
    fn test_all_timestamps() {
        let col = unify(&[ts(0), ts(86_400)]);
        assert_eq!(col.field_type(), FieldType::Time);
        assert_eq!(col.data.cell_text(1).as_deref(), Some("1970-01-02T00:00:00Z"));
    }

    #[test]
    fn test_string_wins_over_everything() {
        let col = unify(&[
            RawValue::Int64(5),
            RawValue::Text("x".into()),
            RawValue::Bool(true),
            RawValue::Float64(2.5),
            ts(0),
        ]);
        assert_eq!(
            col.data,
            ColumnData::String(vec![
                Some("5".into()),
                Some("x".into()),
                Some("true".into()),
                Some("2.5".into()),
                Some("1970-01-01T00:00:00Z".into()),
            ])
        );
    }

    #[test]
    fn test_bool_and_int_mix_is_string() {
        let col = unify(&[RawValue::Bool(true), RawValue::Int64(1)]);
        assert_eq!(col.field_type(), FieldType::String);
    }

    #[test]
    fn test_time_and_number_mix_is_string() {
        let col = unify(&[ts(10), RawValue::Float64(1.0)]);
        assert_eq!(col.field_type(), FieldType::String);
    }

    #[test]
    fn test_all_absent_is_string_of_missing() {
        let col = unify(&[RawValue::Null, RawValue::Null]);
        assert_eq!(col.data, ColumnData::String(vec![None, None]));
        assert_eq!(col.data.missing_count(), 2);
    }

    #[test]
    fn test_empty_column_is_string() {
        let col = unify_column("empty", &[]);
        assert_eq!(col.field_type(), FieldType::String);
        assert!(col.is_empty());
    }

    #[test]
    fn test_absent_does_not_change_type() {
        let col = unify(&[RawValue::Null, RawValue::Int64(9), RawValue::Null]);
        assert_eq!(col.data, ColumnData::Int64(vec![None, Some(9), None]));
    }

    #[test]
    fn test_complex_value_becomes_json_string() {
        let object = RawValue::from(serde_json::json!({"name": "Ada", "tags": ["a", "b"], "age": 36}));
        let col = unify(&[object]);
        let ColumnData::String(cells) = &col.data else {
            panic!("expected string column, got {:?}", col.field_type());
        };
        let text = cells[0].as_deref().unwrap();
        assert_eq!(text, r#"{"age":36,"name":"Ada","tags":["a","b"]}"#);
        let parsed: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(parsed["name"], "Ada");
    }

    #[test]
    fn test_map_with_nan_keeps_its_values_as_text() {
        let mut map = std::collections::BTreeMap::new();
        map.insert("x".to_string(), RawValue::Float64(f64::NAN));
        map.insert("y".to_string(), RawValue::Float64(f64::INFINITY));
        let col = unify(&[RawValue::Map(map), RawValue::Null]);
        assert_eq!(
            col.data,
            ColumnData::String(vec![Some("map[x:NaN y:inf]".into()), None])
        );
    }

    #[test]
    fn test_fallback_kinds_render_as_text() {
        let col = unify(&[RawValue::Bytes(vec![0; 4]), RawValue::Null]);
        assert_eq!(
            col.data,
            ColumnData::String(vec![Some("[4 bytes]".into()), None])
        );
    }

    #[test]
    fn test_large_int_in_float_column_degrades_cell() {
        let big = (1i64 << 53) + 1;
        let col = unify(&[RawValue::Float64(0.5), RawValue::Int64(big), RawValue::Int64(1 << 53)]);
        assert_eq!(
            col.data,
            ColumnData::Float64(vec![Some(0.5), None, Some(9_007_199_254_740_992.0)])
        );
    }

    #[test]
    fn test_cell_json() {
        let col = unify(&[RawValue::Float64(1.5), RawValue::Null, RawValue::Float64(f64::NAN)]);
        assert_eq!(col.data.cell_json(0), serde_json::json!(1.5));
        assert!(col.data.cell_json(1).is_null());
        assert!(col.data.cell_json(2).is_null());
        assert!(col.data.cell_json(99).is_null());
    }

    #[test]
    fn test_field_type_names() {
        assert_eq!(FieldType::Int64.frame_type(), "number");
        assert_eq!(FieldType::Time.frame_type(), "time");
        assert_eq!(FieldType::Bool.to_string(), "bool");
        assert_eq!(
            serde_json::to_string(&FieldType::Float64).unwrap(),
            "\"float64\""
        );
    }
}
