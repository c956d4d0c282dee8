/// Typed values carried by topics.
///
/// A [`Value`] is an immutable, timestamped, tagged union over booleans,
/// 64-bit integers, 32- and 64-bit floats, strings, raw bytes, and 1-D arrays
/// of the scalar kinds. Cloning a value is cheap: the payload is shared.
///
/// Equality compares kind and payload only. Timestamps are metadata used for
/// ordering and never participate in comparisons.
use crate::clock;
use crate::error::{TableError, TableResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// The kind of a value, and the declared type of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ValueKind {
    /// No type bound yet / empty value.
    #[default]
    #[serde(rename = "unassigned")]
    Unassigned,
    #[serde(rename = "boolean")]
    Boolean,
    #[serde(rename = "int")]
    Integer,
    #[serde(rename = "float")]
    Float,
    #[serde(rename = "double")]
    Double,
    #[serde(rename = "string")]
    String,
    #[serde(rename = "raw")]
    Raw,
    #[serde(rename = "boolean[]")]
    BooleanArray,
    #[serde(rename = "int[]")]
    IntegerArray,
    #[serde(rename = "float[]")]
    FloatArray,
    #[serde(rename = "double[]")]
    DoubleArray,
    #[serde(rename = "string[]")]
    StringArray,
}

impl ValueKind {
    /// The stable type string used on the wire and in persistence files.
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Unassigned => "unassigned",
            ValueKind::Boolean => "boolean",
            ValueKind::Integer => "int",
            ValueKind::Float => "float",
            ValueKind::Double => "double",
            ValueKind::String => "string",
            ValueKind::Raw => "raw",
            ValueKind::BooleanArray => "boolean[]",
            ValueKind::IntegerArray => "int[]",
            ValueKind::FloatArray => "float[]",
            ValueKind::DoubleArray => "double[]",
            ValueKind::StringArray => "string[]",
        }
    }

    /// Whether this is one of the array kinds.
    pub fn is_array(&self) -> bool {
        self.element().is_some()
    }

    /// Element kind of an array kind.
    pub fn element(&self) -> Option<ValueKind> {
        match self {
            ValueKind::BooleanArray => Some(ValueKind::Boolean),
            ValueKind::IntegerArray => Some(ValueKind::Integer),
            ValueKind::FloatArray => Some(ValueKind::Float),
            ValueKind::DoubleArray => Some(ValueKind::Double),
            ValueKind::StringArray => Some(ValueKind::String),
            _ => None,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueKind {
    type Err = TableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "unassigned" => ValueKind::Unassigned,
            "boolean" => ValueKind::Boolean,
            "int" => ValueKind::Integer,
            "float" => ValueKind::Float,
            "double" => ValueKind::Double,
            "string" => ValueKind::String,
            "raw" => ValueKind::Raw,
            "boolean[]" => ValueKind::BooleanArray,
            "int[]" => ValueKind::IntegerArray,
            "float[]" => ValueKind::FloatArray,
            "double[]" => ValueKind::DoubleArray,
            "string[]" => ValueKind::StringArray,
            other => {
                return Err(TableError::invalid_data(format!(
                    "unknown value type '{}'",
                    other
                )));
            }
        };
        Ok(kind)
    }
}

/// Payload of a value.
///
/// Floating point payloads compare by bit pattern, so an unchanged NaN is
/// equal to itself and `0.0` differs from `-0.0`.
#[derive(Debug, Clone, Default)]
pub enum ValueData {
    #[default]
    Empty,
    Boolean(bool),
    Integer(i64),
    Float(f32),
    Double(f64),
    String(String),
    Raw(Vec<u8>),
    BooleanArray(Vec<bool>),
    IntegerArray(Vec<i64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    StringArray(Vec<String>),
}

impl PartialEq for ValueData {
    fn eq(&self, other: &Self) -> bool {
        use ValueData::*;
        match (self, other) {
            (Empty, Empty) => true,
            (Boolean(a), Boolean(b)) => a == b,
            (Integer(a), Integer(b)) => a == b,
            (Float(a), Float(b)) => a.to_bits() == b.to_bits(),
            (Double(a), Double(b)) => a.to_bits() == b.to_bits(),
            (String(a), String(b)) => a == b,
            (Raw(a), Raw(b)) => a == b,
            (BooleanArray(a), BooleanArray(b)) => a == b,
            (IntegerArray(a), IntegerArray(b)) => a == b,
            (FloatArray(a), FloatArray(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (DoubleArray(a), DoubleArray(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (StringArray(a), StringArray(b)) => a == b,
            _ => false,
        }
    }
}

impl ValueData {
    /// The kind tag of this payload.
    pub fn kind(&self) -> ValueKind {
        match self {
            ValueData::Empty => ValueKind::Unassigned,
            ValueData::Boolean(_) => ValueKind::Boolean,
            ValueData::Integer(_) => ValueKind::Integer,
            ValueData::Float(_) => ValueKind::Float,
            ValueData::Double(_) => ValueKind::Double,
            ValueData::String(_) => ValueKind::String,
            ValueData::Raw(_) => ValueKind::Raw,
            ValueData::BooleanArray(_) => ValueKind::BooleanArray,
            ValueData::IntegerArray(_) => ValueKind::IntegerArray,
            ValueData::FloatArray(_) => ValueKind::FloatArray,
            ValueData::DoubleArray(_) => ValueKind::DoubleArray,
            ValueData::StringArray(_) => ValueKind::StringArray,
        }
    }

    /// Convert to a JSON value. Non-finite floats become `null`.
    pub fn to_json(&self) -> JsonValue {
        match self {
            ValueData::Empty => JsonValue::Null,
            ValueData::Boolean(b) => JsonValue::from(*b),
            ValueData::Integer(i) => JsonValue::from(*i),
            ValueData::Float(f) => float_json(*f as f64),
            ValueData::Double(d) => float_json(*d),
            ValueData::String(s) => JsonValue::from(s.as_str()),
            ValueData::Raw(bytes) => JsonValue::from(bytes.clone()),
            ValueData::BooleanArray(v) => JsonValue::from(v.clone()),
            ValueData::IntegerArray(v) => JsonValue::from(v.clone()),
            ValueData::FloatArray(v) => {
                JsonValue::Array(v.iter().map(|f| float_json(*f as f64)).collect())
            }
            ValueData::DoubleArray(v) => JsonValue::Array(v.iter().map(|d| float_json(*d)).collect()),
            ValueData::StringArray(v) => JsonValue::from(v.clone()),
        }
    }

    /// Parse a JSON value as a payload of the given kind.
    pub fn from_json(kind: ValueKind, json: &JsonValue) -> TableResult<Self> {
        let wrong = || {
            TableError::invalid_data(format!("expected {} value, found {}", kind, json))
        };
        let data = match kind {
            ValueKind::Unassigned => ValueData::Empty,
            ValueKind::Boolean => ValueData::Boolean(json.as_bool().ok_or_else(wrong)?),
            ValueKind::Integer => ValueData::Integer(json.as_i64().ok_or_else(wrong)?),
            ValueKind::Float => ValueData::Float(json_f64(json).ok_or_else(wrong)? as f32),
            ValueKind::Double => ValueData::Double(json_f64(json).ok_or_else(wrong)?),
            ValueKind::String => ValueData::String(json.as_str().ok_or_else(wrong)?.to_string()),
            ValueKind::Raw => ValueData::Raw(
                json_elements(json, |e| e.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .ok_or_else(wrong)?,
            ),
            ValueKind::BooleanArray => {
                ValueData::BooleanArray(json_elements(json, JsonValue::as_bool).ok_or_else(wrong)?)
            }
            ValueKind::IntegerArray => {
                ValueData::IntegerArray(json_elements(json, JsonValue::as_i64).ok_or_else(wrong)?)
            }
            ValueKind::FloatArray => ValueData::FloatArray(
                json_elements(json, |e| json_f64(e).map(|f| f as f32)).ok_or_else(wrong)?,
            ),
            ValueKind::DoubleArray => {
                ValueData::DoubleArray(json_elements(json, json_f64).ok_or_else(wrong)?)
            }
            ValueKind::StringArray => ValueData::StringArray(
                json_elements(json, |e| e.as_str().map(str::to_string)).ok_or_else(wrong)?,
            ),
        };
        Ok(data)
    }
}

fn float_json(f: f64) -> JsonValue {
    serde_json::Number::from_f64(f)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

fn json_f64(json: &JsonValue) -> Option<f64> {
    match json {
        JsonValue::Null => Some(f64::NAN),
        other => other.as_f64(),
    }
}

fn json_elements<T>(json: &JsonValue, f: impl Fn(&JsonValue) -> Option<T>) -> Option<Vec<T>> {
    json.as_array()?.iter().map(f).collect()
}

/// An immutable, timestamped value.
#[derive(Debug, Clone, Default)]
pub struct Value {
    data: Arc<ValueData>,
    time: u64,
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data) || self.data == other.data
    }
}

impl Value {
    /// Build a value from a payload and a timestamp (microseconds).
    pub fn new(data: ValueData, time: u64) -> Self {
        Self {
            data: Arc::new(data),
            time,
        }
    }

    /// Build a value stamped with the current time.
    pub fn now(data: ValueData) -> Self {
        Self::new(data, clock::now_micros())
    }

    /// The empty sentinel.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn boolean(v: bool) -> Self {
        Self::now(ValueData::Boolean(v))
    }

    pub fn integer(v: i64) -> Self {
        Self::now(ValueData::Integer(v))
    }

    pub fn float(v: f32) -> Self {
        Self::now(ValueData::Float(v))
    }

    pub fn double(v: f64) -> Self {
        Self::now(ValueData::Double(v))
    }

    pub fn string(v: impl Into<String>) -> Self {
        Self::now(ValueData::String(v.into()))
    }

    pub fn raw(v: impl Into<Vec<u8>>) -> Self {
        Self::now(ValueData::Raw(v.into()))
    }

    pub fn boolean_array(v: impl Into<Vec<bool>>) -> Self {
        Self::now(ValueData::BooleanArray(v.into()))
    }

    pub fn integer_array(v: impl Into<Vec<i64>>) -> Self {
        Self::now(ValueData::IntegerArray(v.into()))
    }

    pub fn float_array(v: impl Into<Vec<f32>>) -> Self {
        Self::now(ValueData::FloatArray(v.into()))
    }

    pub fn double_array(v: impl Into<Vec<f64>>) -> Self {
        Self::now(ValueData::DoubleArray(v.into()))
    }

    pub fn string_array<S: Into<String>>(v: impl IntoIterator<Item = S>) -> Self {
        Self::now(ValueData::StringArray(
            v.into_iter().map(Into::into).collect(),
        ))
    }

    /// Build an array value of `kind` from scalar elements.
    ///
    /// Returns the empty sentinel when `kind` is not an array kind or when any
    /// element's kind differs from the array's element kind.
    pub fn array(kind: ValueKind, elements: Vec<ValueData>, time: u64) -> Self {
        let Some(element) = kind.element() else {
            return Self::empty();
        };
        if elements.iter().any(|e| e.kind() != element) {
            return Self::empty();
        }

        macro_rules! collect {
            ($variant:ident, $array:ident) => {
                ValueData::$array(
                    elements
                        .into_iter()
                        .filter_map(|e| match e {
                            ValueData::$variant(v) => Some(v),
                            _ => None,
                        })
                        .collect(),
                )
            };
        }

        let data = match kind {
            ValueKind::BooleanArray => collect!(Boolean, BooleanArray),
            ValueKind::IntegerArray => collect!(Integer, IntegerArray),
            ValueKind::FloatArray => collect!(Float, FloatArray),
            ValueKind::DoubleArray => collect!(Double, DoubleArray),
            ValueKind::StringArray => collect!(String, StringArray),
            _ => return Self::empty(),
        };
        Self::new(data, time)
    }

    /// Parse a JSON value of the given kind, stamped with `time`.
    pub fn from_json(kind: ValueKind, json: &JsonValue, time: u64) -> TableResult<Self> {
        Ok(Self::new(ValueData::from_json(kind, json)?, time))
    }

    /// Same payload, different timestamp.
    pub fn with_time(&self, time: u64) -> Self {
        Self {
            data: Arc::clone(&self.data),
            time,
        }
    }

    pub fn kind(&self) -> ValueKind {
        self.data.kind()
    }

    pub fn data(&self) -> &ValueData {
        &self.data
    }

    /// Timestamp in microseconds.
    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn is_empty(&self) -> bool {
        matches!(*self.data, ValueData::Empty)
    }

    pub fn to_json(&self) -> JsonValue {
        self.data.to_json()
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self.data {
            ValueData::Boolean(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self.data {
            ValueData::Integer(i) => Some(i),
            _ => None,
        }
    }

    /// Numeric view of any scalar number kind.
    pub fn as_f64(&self) -> Option<f64> {
        match *self.data {
            ValueData::Double(d) => Some(d),
            ValueData::Float(f) => Some(f as f64),
            ValueData::Integer(i) => Some(i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &*self.data {
            ValueData::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::string(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::string(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_kind_strings_round_trip() {
        for kind in [
            ValueKind::Boolean,
            ValueKind::Integer,
            ValueKind::Float,
            ValueKind::Double,
            ValueKind::String,
            ValueKind::Raw,
            ValueKind::BooleanArray,
            ValueKind::IntegerArray,
            ValueKind::FloatArray,
            ValueKind::DoubleArray,
            ValueKind::StringArray,
        ] {
            assert_eq!(kind.as_str().parse::<ValueKind>().unwrap(), kind);
        }
        assert!("quaternion".parse::<ValueKind>().is_err());
    }

    #[test]
    fn test_equality_ignores_time() {
        let a = Value::new(ValueData::Double(1.5), 10);
        let b = Value::new(ValueData::Double(1.5), 99);
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_kinds_never_equal() {
        let int = Value::new(ValueData::Integer(1), 1);
        let double = Value::new(ValueData::Double(1.0), 1);
        let float = Value::new(ValueData::Float(1.0), 1);
        assert_ne!(int, double);
        assert_ne!(double, float);
        assert_ne!(Value::empty(), Value::boolean(false));
    }

    #[test]
    fn test_floats_compare_by_bits() {
        assert_eq!(Value::double(f64::NAN), Value::double(f64::NAN));
        assert_eq!(
            Value::new(ValueData::Float(f32::NAN), 1),
            Value::new(ValueData::Float(f32::NAN), 2)
        );
        assert_eq!(
            Value::double_array(vec![1.0, f64::NAN]),
            Value::double_array(vec![1.0, f64::NAN])
        );
        assert_ne!(Value::double(0.0), Value::double(-0.0));
    }

    #[test]
    fn test_arrays_compare_elementwise() {
        assert_eq!(Value::double_array(vec![1.0, 2.0]), Value::double_array(vec![1.0, 2.0]));
        assert_ne!(Value::double_array(vec![1.0, 2.0]), Value::double_array(vec![2.0, 1.0]));
        assert_ne!(Value::double_array(vec![1.0]), Value::double_array(vec![1.0, 1.0]));
    }

    #[test]
    fn test_array_from_elements() {
        let value = Value::array(
            ValueKind::IntegerArray,
            vec![ValueData::Integer(1), ValueData::Integer(2)],
            5,
        );
        assert_eq!(value.kind(), ValueKind::IntegerArray);
        assert_eq!(value.data(), &ValueData::IntegerArray(vec![1, 2]));
        assert_eq!(value.time(), 5);
    }

    #[test]
    fn test_mixed_array_is_refused() {
        let value = Value::array(
            ValueKind::IntegerArray,
            vec![ValueData::Integer(1), ValueData::Double(2.0)],
            5,
        );
        assert!(value.is_empty());
        assert_eq!(value.kind(), ValueKind::Unassigned);

        let not_array = Value::array(ValueKind::Double, vec![ValueData::Double(1.0)], 5);
        assert!(not_array.is_empty());
    }

    #[test]
    fn test_json_conversion() {
        let value = Value::string_array(["a", "b"]);
        assert_eq!(value.to_json(), json!(["a", "b"]));

        let parsed = Value::from_json(ValueKind::Raw, &json!([1, 2, 255]), 7).unwrap();
        assert_eq!(parsed.data(), &ValueData::Raw(vec![1, 2, 255]));

        assert!(Value::from_json(ValueKind::Raw, &json!([256]), 7).is_err());
        assert!(Value::from_json(ValueKind::Boolean, &json!("yes"), 7).is_err());
        assert!(Value::from_json(ValueKind::Integer, &json!(1.5), 7).is_err());
    }

    #[test]
    fn test_non_finite_double_becomes_null() {
        let value = Value::double(f64::INFINITY);
        assert_eq!(value.to_json(), JsonValue::Null);
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Value::boolean(true).as_bool(), Some(true));
        assert_eq!(Value::integer(4).as_f64(), Some(4.0));
        assert_eq!(Value::string("x").as_str(), Some("x"));
        assert_eq!(Value::string("x").as_i64(), None);
    }

    proptest! {
        #[test]
        fn prop_integer_arrays_equal_iff_payload_equal(a in prop::collection::vec(any::<i64>(), 0..8),
                                                       b in prop::collection::vec(any::<i64>(), 0..8)) {
            let va = Value::integer_array(a.clone());
            let vb = Value::integer_array(b.clone());
            prop_assert_eq!(va == vb, a == b);
        }

        #[test]
        fn prop_double_json_survives(d in -1.0e12f64..1.0e12) {
            let value = Value::double(d);
            let back = Value::from_json(ValueKind::Double, &value.to_json(), value.time()).unwrap();
            prop_assert_eq!(back, value);
        }
    }
}
