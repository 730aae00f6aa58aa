//! Static table definitions and typed row access.

use datum_core::{ColumnSpec, Error, FieldType, Result, Row, TableSpec, Timespan, Value};

pub(crate) const ATTRIBUTES: &str = "attributes";
pub(crate) const COLLECTION: &str = "collection";
pub(crate) const RUN: &str = "run";
pub(crate) const CHAIN: &str = "collection_chain";
pub(crate) const DATASET_TYPE: &str = "dataset_type";
pub(crate) const DATASET: &str = "dataset";

/// Tables every registry has, independent of its dimensions and dataset
/// types.
pub(crate) fn static_specs() -> Vec<TableSpec> {
    vec![
        TableSpec::new(ATTRIBUTES)
            .column(ColumnSpec::required("name", FieldType::String))
            .column(ColumnSpec::required("value", FieldType::String))
            .primary_key(["name"]),
        TableSpec::new(COLLECTION)
            .column(ColumnSpec::required("name", FieldType::String))
            .column(ColumnSpec::required("type", FieldType::String))
            .column(ColumnSpec::nullable("doc", FieldType::String))
            .primary_key(["name"]),
        TableSpec::new(RUN)
            .column(ColumnSpec::required("name", FieldType::String))
            .column(ColumnSpec::nullable("host", FieldType::String))
            .column(ColumnSpec::nullable("timespan", FieldType::Timespan))
            .primary_key(["name"]),
        TableSpec::new(CHAIN)
            .column(ColumnSpec::required("parent", FieldType::String))
            .column(ColumnSpec::required("position", FieldType::Int))
            .column(ColumnSpec::required("child", FieldType::String))
            .column(ColumnSpec::nullable("restriction", FieldType::String))
            .primary_key(["parent", "position"]),
        TableSpec::new(DATASET_TYPE)
            .column(ColumnSpec::required("name", FieldType::String))
            .column(ColumnSpec::required("dimensions", FieldType::String))
            .column(ColumnSpec::required("storage_class", FieldType::String))
            .column(ColumnSpec::required("is_calibration", FieldType::Bool))
            .primary_key(["name"]),
        TableSpec::new(DATASET)
            .column(ColumnSpec::required("id", FieldType::String))
            .column(ColumnSpec::required("dataset_type", FieldType::String))
            .column(ColumnSpec::required("run", FieldType::String))
            .primary_key(["id"]),
    ]
}

fn column<'r>(row: &'r Row, column: &str) -> Result<&'r Value> {
    row.get(column)
        .ok_or_else(|| Error::internal(format!("stored row has no column '{column}'")))
}

fn mistyped(column: &str, expected: &str, value: &Value) -> Error {
    Error::internal(format!(
        "column '{column}' holds {value}, expected {expected}"
    ))
}

pub(crate) fn get_str<'r>(row: &'r Row, name: &str) -> Result<&'r str> {
    let value = column(row, name)?;
    value.as_str().ok_or_else(|| mistyped(name, "a string", value))
}

pub(crate) fn get_opt_str<'r>(row: &'r Row, name: &str) -> Result<Option<&'r str>> {
    match column(row, name)? {
        Value::Null => Ok(None),
        Value::Str(s) => Ok(Some(s)),
        other => Err(mistyped(name, "a string", other)),
    }
}

pub(crate) fn get_int(row: &Row, name: &str) -> Result<i64> {
    let value = column(row, name)?;
    value.as_int().ok_or_else(|| mistyped(name, "an integer", value))
}

pub(crate) fn get_bool(row: &Row, name: &str) -> Result<bool> {
    match column(row, name)? {
        Value::Bool(b) => Ok(*b),
        other => Err(mistyped(name, "a boolean", other)),
    }
}

pub(crate) fn get_timespan(row: &Row, name: &str) -> Result<Option<Timespan>> {
    match column(row, name)? {
        Value::Null => Ok(None),
        Value::Timespan(t) => Ok(Some(*t)),
        other => Err(mistyped(name, "a timespan", other)),
    }
}

pub(crate) fn opt_str(value: Option<&str>) -> Value {
    value.map_or(Value::Null, Value::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use datum_core::database::row;

    #[test]
    fn static_specs_are_valid() {
        for spec in static_specs() {
            spec.validate().unwrap();
        }
    }

    #[test]
    fn typed_access_reports_mistyped_columns() {
        let r = row([("name", Value::from("a")), ("n", Value::Int(3)), ("doc", Value::Null)]);
        assert_eq!(get_str(&r, "name").unwrap(), "a");
        assert_eq!(get_int(&r, "n").unwrap(), 3);
        assert_eq!(get_opt_str(&r, "doc").unwrap(), None);
        assert!(get_str(&r, "n").is_err());
        assert!(get_int(&r, "missing").is_err());
    }
}
