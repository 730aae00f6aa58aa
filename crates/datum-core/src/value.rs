//! Scalar values stored in data IDs and dimension records.
//!
//! [`DataIdValue`] is the primary-key value of a dimension: always an `i64`
//! or a string. Integers of any width normalize to `i64` on the way in, so a
//! data ID built from a `u16` detector number compares equal to one built
//! from an `i64`.
//!
//! [`Value`] is a column value in a stored row. It extends `DataIdValue` with
//! the metadata and interval types a record or association row can carry.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::region::Region;
use crate::timespan::Timespan;

/// Primary-key value of one dimension in a data ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataIdValue {
    /// Integer key (all integer widths normalize here).
    Int(i64),
    /// String key.
    Str(String),
}

impl DataIdValue {
    /// Returns the integer value, if this is an integer key.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::Str(_) => None,
        }
    }

    /// Returns the string value, if this is a string key.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Int(_) => None,
            Self::Str(s) => Some(s),
        }
    }
}

impl fmt::Display for DataIdValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "'{s}'"),
        }
    }
}

macro_rules! int_into_data_id {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for DataIdValue {
                fn from(v: $ty) -> Self {
                    Self::Int(i64::from(v))
                }
            }
        )*
    };
}

int_into_data_id!(i8, i16, i32, i64, u8, u16, u32);

impl TryFrom<u64> for DataIdValue {
    type Error = Error;

    fn try_from(v: u64) -> Result<Self> {
        i64::try_from(v)
            .map(Self::Int)
            .map_err(|_| Error::InvalidInput(format!("data ID value {v} does not fit in i64")))
    }
}

impl From<&str> for DataIdValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for DataIdValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

/// Declared type of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// 64-bit integer.
    Int,
    /// UTF-8 string.
    String,
    /// Boolean.
    Bool,
    /// 64-bit float.
    Float,
    /// Half-open time interval.
    Timespan,
    /// Spatial region.
    Region,
}

impl FieldType {
    /// Returns true if `value` is acceptable for a field of this type.
    ///
    /// `Null` is accepted for every type; nullability is checked separately.
    #[must_use]
    pub fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (_, Value::Null)
                | (Self::Int, Value::Int(_))
                | (Self::String, Value::Str(_))
                | (Self::Bool, Value::Bool(_))
                | (Self::Float, Value::Float(_) | Value::Int(_))
                | (Self::Timespan, Value::Timespan(_))
                | (Self::Region, Value::Region(_))
        )
    }
}

/// A column value in a stored row.
///
/// Floats compare and hash by their total order so rows can live in ordered
/// and hashed collections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// SQL-style NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Half-open time interval.
    Timespan(Timespan),
    /// Spatial region.
    Region(Region),
}

impl Value {
    /// Returns true for `Null`.
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the timespan held by this value, if any.
    #[must_use]
    pub const fn as_timespan(&self) -> Option<&Timespan> {
        match self {
            Self::Timespan(t) => Some(t),
            _ => None,
        }
    }

    /// Returns the string held by this value, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer held by this value, if any.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Converts this value to a data ID value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for anything other than an integer or string.
    pub fn to_data_id_value(&self) -> Result<DataIdValue> {
        match self {
            Self::Int(v) => Ok(DataIdValue::Int(*v)),
            Self::Str(s) => Ok(DataIdValue::Str(s.clone())),
            other => Err(Error::InvalidInput(format!(
                "{other} is not a valid data ID value"
            ))),
        }
    }

    /// Parses a JSON scalar into a value.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for arrays, objects, and non-finite numbers.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::Null => Ok(Self::Null),
            serde_json::Value::Bool(b) => Ok(Self::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float))
                .ok_or_else(|| Error::InvalidInput(format!("unsupported number {n}"))),
            serde_json::Value::String(s) => Ok(Self::Str(s.clone())),
            other => Err(Error::InvalidInput(format!(
                "unsupported field value {other}"
            ))),
        }
    }

    /// Parses a JSON value as a field of the given type.
    ///
    /// Timespans are objects with `begin`/`end` RFC 3339 strings (or null);
    /// regions are objects with a `ranges` list of `[start, end)` pairs.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the JSON cannot be read as `field_type`.
    pub fn from_typed_json(field_type: FieldType, value: &serde_json::Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::Null);
        }
        let invalid = |e: &dyn fmt::Display| {
            Error::InvalidInput(format!("cannot read {value} as {field_type:?}: {e}"))
        };
        match field_type {
            FieldType::Timespan => serde_json::from_value::<Timespan>(value.clone())
                .map(Self::Timespan)
                .map_err(|e| invalid(&e)),
            FieldType::Region => serde_json::from_value::<Region>(value.clone())
                .map(Self::Region)
                .map_err(|e| invalid(&e)),
            FieldType::Float => value
                .as_f64()
                .map(Self::Float)
                .ok_or_else(|| invalid(&"not a number")),
            _ => {
                let parsed = Self::from_json(value)?;
                if field_type.accepts(&parsed) {
                    Ok(parsed)
                } else {
                    Err(invalid(&"wrong type"))
                }
            }
        }
    }

    /// Converts this value to plain JSON, the inverse of
    /// [`from_typed_json`](Self::from_typed_json).
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Value::from(*v),
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::Timespan(t) => serde_json::to_value(t).unwrap_or(serde_json::Value::Null),
            Self::Region(r) => serde_json::to_value(r).unwrap_or(serde_json::Value::Null),
        }
    }

    const fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) => 2,
            Self::Float(_) => 3,
            Self::Str(_) => 4,
            Self::Timespan(_) => 5,
            Self::Region(_) => 6,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Timespan(a), Self::Timespan(b)) => a.cmp(b),
            (Self::Region(a), Self::Region(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Self::Null => {}
            Self::Bool(b) => b.hash(state),
            Self::Int(v) => v.hash(state),
            Self::Float(v) => v.to_bits().hash(state),
            Self::Str(s) => s.hash(state),
            Self::Timespan(t) => t.hash(state),
            Self::Region(r) => r.hash(state),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "'{s}'"),
            Self::Timespan(t) => write!(f, "{t}"),
            Self::Region(r) => write!(f, "{r}"),
        }
    }
}

impl From<DataIdValue> for Value {
    fn from(v: DataIdValue) -> Self {
        match v {
            DataIdValue::Int(i) => Self::Int(i),
            DataIdValue::Str(s) => Self::Str(s),
        }
    }
}

impl From<&DataIdValue> for Value {
    fn from(v: &DataIdValue) -> Self {
        v.clone().into()
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<Region> for Value {
    fn from(v: Region) -> Self {
        Self::Region(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Timespan> for Value {
    fn from(v: Timespan) -> Self {
        Self::Timespan(v)
    }
}

impl From<Option<Timespan>> for Value {
    fn from(v: Option<Timespan>) -> Self {
        v.map_or(Self::Null, Self::Timespan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_widths_normalize() {
        assert_eq!(DataIdValue::from(42_u16), DataIdValue::Int(42));
        assert_eq!(DataIdValue::from(42_i32), DataIdValue::from(42_i64));
        assert!(DataIdValue::try_from(u64::MAX).is_err());
    }

    #[test]
    fn float_values_have_total_order() {
        let nan = Value::Float(f64::NAN);
        assert_eq!(nan, nan.clone());
        assert!(Value::Null < Value::Int(0));
    }

    #[test]
    fn field_type_accepts_null_and_matching_values() {
        assert!(FieldType::Int.accepts(&Value::Null));
        assert!(FieldType::Float.accepts(&Value::Int(3)));
        assert!(!FieldType::String.accepts(&Value::Int(3)));
    }

    #[test]
    fn typed_json_reads_timespans() {
        let json = serde_json::json!({"begin": "2024-01-01T00:00:00Z", "end": null});
        let value = Value::from_typed_json(FieldType::Timespan, &json).unwrap();
        let span = value.as_timespan().unwrap();
        assert!(span.end().is_none());
        assert_eq!(Value::from_typed_json(FieldType::Timespan, &value.to_json()).unwrap(), value);
        assert!(Value::from_typed_json(FieldType::Int, &serde_json::json!("x")).is_err());
    }

    #[test]
    fn json_scalars_parse() {
        let parsed = Value::from_json(&serde_json::json!("Cam1")).unwrap();
        assert_eq!(parsed, Value::Str("Cam1".into()));
        assert!(Value::from_json(&serde_json::json!([1, 2])).is_err());
    }
}
