//! Dataset types and their storage.
//!
//! A dataset type names a kind of dataset, the dimensions that identify one,
//! and the storage class used to read it. Each registered type gets its own
//! association tables, keyed by the type's required dimensions:
//!
//! - `tags_{name}` holds RUN and TAGGED membership. A data ID appears at
//!   most once per collection.
//! - `calibs_{name}`, for calibration types, holds CALIBRATION membership
//!   with a validity range. Ranges for one data ID in one collection never
//!   overlap.

use std::fmt;

use tracing::{debug, info};

use datum_core::database::row;
use datum_core::{
    ColumnSpec, Database, DatabaseExt, DimensionGraph, DimensionUniverse, Error, FieldType,
    Filter, Result, Row, TableSpec, Value,
};

use crate::collections::NamePattern;
use crate::tables::{self, get_bool, get_str};

/// A named, dimension-scoped kind of dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetType {
    name: String,
    dimensions: DimensionGraph,
    storage_class: String,
    is_calibration: bool,
}

impl DatasetType {
    /// Creates a dataset type.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `name` is not a valid identifier (letters,
    /// digits, `_` and `.`, not starting with a digit or `.`).
    pub fn new(
        name: impl Into<String>,
        dimensions: DimensionGraph,
        storage_class: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let valid = name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
        if !valid {
            return Err(Error::InvalidInput(format!(
                "'{name}' is not a valid dataset type name"
            )));
        }
        Ok(Self {
            name,
            dimensions,
            storage_class: storage_class.into(),
            is_calibration: false,
        })
    }

    /// Marks this type as certifiable into CALIBRATION collections.
    #[must_use]
    pub fn calibration(mut self) -> Self {
        self.is_calibration = true;
        self
    }

    /// Type name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dimensions of this type's data IDs.
    #[must_use]
    pub const fn dimensions(&self) -> &DimensionGraph {
        &self.dimensions
    }

    /// Storage class name.
    #[must_use]
    pub fn storage_class(&self) -> &str {
        &self.storage_class
    }

    /// True if datasets of this type can be certified.
    #[must_use]
    pub const fn is_calibration(&self) -> bool {
        self.is_calibration
    }

    pub(crate) fn tags_table(&self) -> String {
        format!("tags_{}", self.name)
    }

    pub(crate) fn calibs_table(&self) -> String {
        format!("calibs_{}", self.name)
    }

    fn key_columns(&self) -> Vec<ColumnSpec> {
        self.dimensions
            .required()
            .iter()
            .map(|d| {
                let field_type = d.primary_key().map_or(FieldType::Int, |k| k.field_type);
                ColumnSpec::required(d.name(), field_type)
            })
            .collect()
    }

    pub(crate) fn tags_spec(&self) -> TableSpec {
        let keys: Vec<&str> = self.dimensions.required_names().collect();
        let mut spec = TableSpec::new(self.tags_table())
            .column(ColumnSpec::required("collection", FieldType::String))
            .column(ColumnSpec::required("dataset_id", FieldType::String));
        for column in self.key_columns() {
            spec = spec.column(column);
        }
        spec.primary_key(["collection", "dataset_id"])
            .unique(std::iter::once("collection").chain(keys))
    }

    pub(crate) fn calibs_spec(&self) -> TableSpec {
        let keys: Vec<&str> = self.dimensions.required_names().collect();
        let mut spec = TableSpec::new(self.calibs_table())
            .column(ColumnSpec::required("collection", FieldType::String))
            .column(ColumnSpec::required("dataset_id", FieldType::String));
        for column in self.key_columns() {
            spec = spec.column(column);
        }
        spec.column(ColumnSpec::required("validity", FieldType::Timespan))
            .primary_key(["collection", "dataset_id", "validity"])
            .exclusion(std::iter::once("collection").chain(keys), "validity")
    }

    fn to_row(&self) -> Result<Row> {
        let required: Vec<&str> = self.dimensions.required_names().collect();
        Ok(row([
            ("name", Value::from(self.name.as_str())),
            ("dimensions", Value::Str(serde_json::to_string(&required)?)),
            ("storage_class", Value::from(self.storage_class.as_str())),
            ("is_calibration", Value::Bool(self.is_calibration)),
        ]))
    }

    fn from_row(universe: &'static DimensionUniverse, row: &Row) -> Result<Self> {
        let names: Vec<String> = serde_json::from_str(get_str(row, "dimensions")?)?;
        Ok(Self {
            name: get_str(row, "name")?.to_string(),
            dimensions: universe.extract(names)?,
            storage_class: get_str(row, "storage_class")?.to_string(),
            is_calibration: get_bool(row, "is_calibration")?,
        })
    }
}

impl fmt::Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DatasetType({}, {}, {})",
            self.name, self.dimensions, self.storage_class
        )?;
        if self.is_calibration {
            f.write_str(" [calibration]")?;
        }
        Ok(())
    }
}

/// Dataset type storage over a [`Database`].
#[derive(Clone, Copy)]
pub struct DatasetTypeManager<'a> {
    db: &'a dyn Database,
    universe: &'static DimensionUniverse,
}

impl<'a> DatasetTypeManager<'a> {
    /// Wraps a database connection.
    #[must_use]
    pub const fn new(db: &'a dyn Database, universe: &'static DimensionUniverse) -> Self {
        Self { db, universe }
    }

    /// Registers a dataset type and creates its association tables.
    ///
    /// Returns false without writing if an identical type is already
    /// registered; this is allowed on read-only registries.
    ///
    /// # Errors
    ///
    /// Returns `ConflictingDefinition` if a different type has this name,
    /// and `ReadOnly` on a read-only connection when registration is needed.
    pub fn register(&self, dataset_type: &DatasetType) -> Result<bool> {
        if !std::ptr::eq(dataset_type.dimensions().universe(), self.universe) {
            return Err(Error::InvalidInput(format!(
                "{dataset_type} uses a different dimension universe"
            )));
        }
        if let Some(existing) = self.get(dataset_type.name())? {
            if existing == *dataset_type {
                debug!(dataset_type = dataset_type.name(), "dataset type already registered");
                return Ok(false);
            }
            return Err(Error::conflict(format!(
                "{dataset_type} does not match registered {existing}"
            )));
        }
        self.db.require_writeable("registering a dataset type")?;
        self.db.transaction(true, || {
            self.db.ensure_table(&dataset_type.tags_spec())?;
            if dataset_type.is_calibration() {
                self.db.ensure_table(&dataset_type.calibs_spec())?;
            }
            self.db.insert_one(tables::DATASET_TYPE, dataset_type.to_row()?)
        })?;
        info!(dataset_type = %dataset_type, "registered dataset type");
        Ok(true)
    }

    /// Looks up a dataset type.
    ///
    /// # Errors
    ///
    /// Returns a storage error only.
    pub fn get(&self, name: &str) -> Result<Option<DatasetType>> {
        self.db
            .select_one(tables::DATASET_TYPE, &[Filter::eq("name", name)])?
            .map(|r| DatasetType::from_row(self.universe, &r))
            .transpose()
    }

    /// Looks up a dataset type that must exist.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if there is none.
    pub fn find(&self, name: &str) -> Result<DatasetType> {
        self.get(name)?
            .ok_or_else(|| Error::resource_not_found("dataset type", name))
    }

    /// Dataset types whose names match `pattern` (all if `None`), sorted by
    /// name.
    ///
    /// # Errors
    ///
    /// Returns a storage error only.
    pub fn query(&self, pattern: Option<&NamePattern>) -> Result<Vec<DatasetType>> {
        let mut types = self
            .db
            .select(tables::DATASET_TYPE, &[])?
            .iter()
            .map(|r| DatasetType::from_row(self.universe, r))
            .filter(|t| {
                t.as_ref()
                    .map_or(true, |t| pattern.map_or(true, |p| p.matches(t.name())))
            })
            .collect::<Result<Vec<_>>>()?;
        types.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(types)
    }

    /// Removes a dataset type.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` for unknown types and
    /// `ReferentialIntegrity` while any dataset of the type exists.
    pub fn remove(&self, name: &str) -> Result<()> {
        self.find(name)?;
        self.db.require_writeable("removing a dataset type")?;
        let count = self
            .db
            .select(tables::DATASET, &[Filter::eq("dataset_type", name)])?
            .len();
        if count > 0 {
            return Err(Error::ReferentialIntegrity {
                message: format!("dataset type '{name}' still has {count} datasets"),
            });
        }
        self.db
            .delete(tables::DATASET_TYPE, &[Filter::eq("name", name)])?;
        info!(dataset_type = name, "removed dataset type");
        Ok(())
    }
}

impl fmt::Debug for DatasetTypeManager<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetTypeManager")
            .field("universe", &self.universe.version())
            .finish_non_exhaustive()
    }
}
