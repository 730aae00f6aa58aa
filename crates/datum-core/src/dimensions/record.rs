//! Dimension records.

use std::collections::BTreeMap;
use std::fmt;

use super::element::DimensionElement;
use crate::error::{Error, Result};
use crate::region::Region;
use crate::timespan::Timespan;
use crate::value::{DataIdValue, FieldType, Value};

/// The metadata row for one instance of a dimension element.
///
/// Every field declared by the element is present; unset nullable fields
/// hold [`Value::Null`].
#[derive(Clone)]
pub struct DimensionRecord {
    element: &'static DimensionElement,
    values: BTreeMap<String, Value>,
}

impl DimensionRecord {
    /// Builds a record from field values.
    ///
    /// A dimension's own name is accepted in place of its primary key field
    /// name (`"detector": 1` for `"id": 1`). Integer values are accepted for
    /// float fields.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for unknown fields, missing non-nullable
    /// fields, and values of the wrong type.
    pub fn new(
        element: &'static DimensionElement,
        fields: impl IntoIterator<Item = (String, Value)>,
    ) -> Result<Self> {
        let mut given: BTreeMap<String, Value> = fields.into_iter().collect();
        if let Some(pk) = element.primary_key_name() {
            if pk != element.name() && !given.contains_key(pk) {
                if let Some(value) = given.remove(element.name()) {
                    given.insert(pk.to_string(), value);
                }
            }
        }

        let mut values = BTreeMap::new();
        for spec in element.record_fields() {
            let value = match given.remove(&spec.name) {
                Some(Value::Int(v)) if spec.field_type == FieldType::Float => {
                    #[allow(clippy::cast_precision_loss)]
                    let as_float = v as f64;
                    Value::Float(as_float)
                }
                Some(v) => v,
                None => Value::Null,
            };
            if value.is_null() && !spec.nullable {
                return Err(Error::InvalidInput(format!(
                    "record for '{}' is missing field '{}'",
                    element.name(),
                    spec.name
                )));
            }
            if !spec.field_type.accepts(&value) {
                return Err(Error::InvalidInput(format!(
                    "field '{}' of '{}' expects {:?}, got {value}",
                    spec.name,
                    element.name(),
                    spec.field_type
                )));
            }
            values.insert(spec.name.clone(), value);
        }
        if let Some(unknown) = given.keys().next() {
            return Err(Error::InvalidInput(format!(
                "'{}' has no field '{unknown}'",
                element.name()
            )));
        }
        Ok(Self { element, values })
    }

    /// Builds a record from a JSON object, using the element's field types.
    ///
    /// # Errors
    ///
    /// As for [`new`](Self::new), plus `InvalidInput` for JSON values that
    /// cannot be read as the declared type.
    pub fn from_json(
        element: &'static DimensionElement,
        object: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self> {
        let mut fields = Vec::with_capacity(object.len());
        for (name, json) in object {
            let field_type = element
                .record_fields()
                .iter()
                .find(|f| f.name == *name)
                .map(|f| f.field_type);
            let value = match field_type {
                Some(ty) => Value::from_typed_json(ty, json)?,
                None if name == element.name() => Value::from_json(json)?,
                None => {
                    return Err(Error::InvalidInput(format!(
                        "'{}' has no field '{name}'",
                        element.name()
                    )))
                }
            };
            fields.push((name.clone(), value));
        }
        Self::new(element, fields)
    }

    /// Converts this record to a JSON object.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Map<String, serde_json::Value> {
        self.values
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }

    /// The element this record belongs to.
    #[must_use]
    pub const fn element(&self) -> &'static DimensionElement {
        self.element
    }

    /// A field value.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// All field values by name.
    #[must_use]
    pub const fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// The value of a dimension this record identifies or implies.
    #[must_use]
    pub fn dimension_value(&self, dimension: &str) -> Option<DataIdValue> {
        let field = self.element.field_for_dimension(dimension)?;
        self.values.get(field)?.to_data_id_value().ok()
    }

    /// Values of the element's required dimensions, in order.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if a key field is null, which `new` prevents.
    pub fn required_values(&self) -> Result<Vec<DataIdValue>> {
        self.element
            .required()
            .iter()
            .map(|d| {
                self.dimension_value(d)
                    .ok_or_else(|| Error::internal(format!("record key '{d}' is unset")))
            })
            .collect()
    }

    /// The record's region, for spatial elements.
    #[must_use]
    pub fn region(&self) -> Option<&Region> {
        match self.values.get("region") {
            Some(Value::Region(r)) => Some(r),
            _ => None,
        }
    }

    /// The record's timespan, for temporal elements.
    #[must_use]
    pub fn timespan(&self) -> Option<Timespan> {
        self.values.get("timespan").and_then(Value::as_timespan).copied()
    }
}

impl PartialEq for DimensionRecord {
    fn eq(&self, other: &Self) -> bool {
        self.element == other.element && self.values == other.values
    }
}

impl Eq for DimensionRecord {}

impl fmt::Debug for DimensionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DimensionRecord")
            .field("element", &self.element.name())
            .field("values", &self.values)
            .finish()
    }
}

impl fmt::Display for DimensionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.element.name())?;
        let keys = self.element.required().iter().filter_map(|d| {
            self.dimension_value(d).map(|v| (d, v))
        });
        for (i, (name, value)) in keys.enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        write!(f, ")")
    }
}
