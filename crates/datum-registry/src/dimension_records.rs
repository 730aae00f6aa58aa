//! Dimension record storage and data ID expansion.
//!
//! Every element with a table stores its records in `dimension_{element}`.
//! The primary key is the element's required dimensions; each alternate key
//! of a dimension is unique among records that share the other required
//! dimensions. Skypix records are never stored: their regions are computed
//! from the pixel index.

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use datum_core::{
    ColumnSpec, DataCoordinate, DataIdValue, Database, DatabaseExt, DimensionElement,
    DimensionRecord, DimensionUniverse, Error, Filter, RecordMap, Result, TableSpec, Value,
};

/// Outcome of [`DimensionRecordStorage::sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The record was new and was inserted.
    Inserted,
    /// An identical record already existed.
    Unchanged,
    /// A record with the same key existed and was replaced.
    Updated,
}

/// Name of the table holding an element's records.
#[must_use]
pub fn table_name(element: &DimensionElement) -> String {
    format!("dimension_{}", element.name())
}

/// Table definition for an element's records.
#[must_use]
pub fn table_spec(element: &DimensionElement) -> TableSpec {
    let mut spec = TableSpec::new(table_name(element));
    for field in element.record_fields() {
        spec = spec.column(ColumnSpec {
            name: field.name.clone(),
            field_type: field.field_type,
            nullable: field.nullable,
        });
    }
    let key_fields: Vec<&str> = element
        .required()
        .iter()
        .filter_map(|d| element.field_for_dimension(d))
        .collect();
    spec = spec.primary_key(key_fields);
    let scope: Vec<&str> = element
        .required()
        .iter()
        .filter(|d| d.as_str() != element.name())
        .map(String::as_str)
        .collect();
    for alternate in element.keys().iter().skip(1) {
        spec = spec.unique(scope.iter().copied().chain([alternate.name.as_str()]));
    }
    spec
}

/// Dimension record storage over a [`Database`].
#[derive(Clone, Copy)]
pub struct DimensionRecordStorage<'a> {
    db: &'a dyn Database,
    universe: &'static DimensionUniverse,
}

impl<'a> DimensionRecordStorage<'a> {
    /// Wraps a database connection.
    #[must_use]
    pub const fn new(db: &'a dyn Database, universe: &'static DimensionUniverse) -> Self {
        Self { db, universe }
    }

    /// Creates the record table of every stored element.
    ///
    /// # Errors
    ///
    /// Returns `ConflictingDefinition` if a table exists with another
    /// definition.
    pub fn ensure_tables(&self) -> Result<()> {
        for element in self.universe.elements().iter().filter(|e| e.has_table()) {
            self.db.ensure_table(&table_spec(element))?;
        }
        Ok(())
    }

    fn stored_element(&self, name: &str) -> Result<&'static DimensionElement> {
        let element = self.universe.element(name)?;
        if element.has_table() {
            Ok(element)
        } else {
            Err(Error::InvalidInput(format!(
                "records of '{name}' are computed, not stored"
            )))
        }
    }

    /// Inserts records, all of which must be new unless `replace` is set.
    ///
    /// # Errors
    ///
    /// Returns `ConflictingDefinition` if a record already exists and
    /// `replace` is false, and `InvalidInput` for skypix records.
    pub fn insert(&self, records: &[DimensionRecord], replace: bool) -> Result<()> {
        self.db.require_writeable("inserting dimension records")?;
        let mut by_element: BTreeMap<String, Vec<datum_core::Row>> = BTreeMap::new();
        for record in records {
            let element = self.stored_element(record.element().name())?;
            by_element
                .entry(table_name(element))
                .or_default()
                .push(record.values().clone());
        }
        self.db.transaction(true, || {
            for (table, rows) in by_element {
                debug!(table = %table, count = rows.len(), "inserting dimension records");
                if replace {
                    self.db.replace(&table, rows)?;
                } else {
                    self.db.insert(&table, rows)?;
                }
            }
            Ok(())
        })
    }

    /// Inserts a record if no record with its key exists.
    ///
    /// An identical existing record is a no-op, allowed on read-only
    /// registries. A different one is replaced when `update` is set.
    ///
    /// # Errors
    ///
    /// Returns `ConflictingDefinition` if a different record exists and
    /// `update` is false.
    pub fn sync(&self, record: &DimensionRecord, update: bool) -> Result<SyncOutcome> {
        let element = self.stored_element(record.element().name())?;
        let key = element
            .required()
            .iter()
            .map(|d| {
                record
                    .dimension_value(d)
                    .map(|v| (d.clone(), v))
                    .ok_or_else(|| Error::missing_dimension(d.as_str()))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        match self.fetch_one(element, &key)? {
            None => {
                self.insert(std::slice::from_ref(record), false)?;
                Ok(SyncOutcome::Inserted)
            }
            Some(existing) if existing == *record => Ok(SyncOutcome::Unchanged),
            Some(existing) if update => {
                debug!(old = %existing, new = %record, "updating dimension record");
                self.insert(std::slice::from_ref(record), true)?;
                Ok(SyncOutcome::Updated)
            }
            Some(existing) => Err(Error::conflict(format!(
                "{record} differs from existing {existing}"
            ))),
        }
    }

    /// Records of `element` consistent with the given dimension values.
    ///
    /// Values for dimensions the element does not carry are ignored.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` for unknown elements, and `InvalidInput`
    /// for skypix elements without a value for their own dimension.
    pub fn fetch(
        &self,
        element: &str,
        constraints: &BTreeMap<String, DataIdValue>,
    ) -> Result<Vec<DimensionRecord>> {
        let element = self.universe.element(element)?;
        if element.is_skypix() {
            let value = constraints.get(element.name()).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "skypix records of '{}' need a pixel index",
                    element.name()
                ))
            })?;
            return Ok(vec![self.skypix_record(element, value)?]);
        }
        let filters: Vec<Filter> = constraints
            .iter()
            .filter_map(|(dim, value)| {
                element
                    .field_for_dimension(dim)
                    .map(|field| Filter::eq(field, Value::from(value)))
            })
            .collect();
        self.db
            .select(&table_name(element), &filters)?
            .into_iter()
            .map(|row| DimensionRecord::new(element, row))
            .collect()
    }

    /// The record of `element` identified by `key`, if stored.
    ///
    /// # Errors
    ///
    /// Returns `MissingDimension` if `key` lacks a required dimension.
    pub fn fetch_one(
        &self,
        element: &'static DimensionElement,
        key: &BTreeMap<String, DataIdValue>,
    ) -> Result<Option<DimensionRecord>> {
        if let Some(missing) = element.required().iter().find(|d| !key.contains_key(*d)) {
            return Err(Error::missing_dimension(missing.as_str()));
        }
        let mut found = self.fetch(element.name(), key)?;
        match found.len() {
            0 | 1 => Ok(found.pop()),
            n => Err(Error::internal(format!(
                "{n} records of '{}' share one key",
                element.name()
            ))),
        }
    }

    fn skypix_record(
        &self,
        element: &'static DimensionElement,
        value: &DataIdValue,
    ) -> Result<DimensionRecord> {
        let index = value
            .as_int()
            .and_then(|v| u64::try_from(v).ok())
            .ok_or_else(|| Error::InvalidInput(format!("{value} is not a pixel index")))?;
        let region = self.universe.skypix_region(element.name(), index)?;
        DimensionRecord::new(
            element,
            [
                ("id".to_string(), Value::from(value)),
                ("region".to_string(), Value::Region(region)),
            ],
        )
    }

    /// Attaches the record of every element of the data ID's graph.
    ///
    /// Implied dimension values are read from the records that determine
    /// them. Combinations and implied dimensions may have no record.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if a required dimension has no record,
    /// and `MissingDimension` if an implied value cannot be found.
    pub fn expand(&self, data_id: &DataCoordinate) -> Result<DataCoordinate> {
        if data_id.has_records() {
            return Ok(data_id.clone());
        }
        let graph = data_id.graph();
        let mut known = data_id.full().unwrap_or_else(|_| data_id.by_name());
        let mut records = RecordMap::new();
        let mut pending: Vec<&'static DimensionElement> = graph.elements().to_vec();

        while !pending.is_empty() {
            let before = pending.len();
            let mut waiting = Vec::new();
            for element in pending {
                let key: Option<BTreeMap<String, DataIdValue>> = element
                    .required()
                    .iter()
                    .map(|d| known.get(d).map(|v| (d.clone(), v.clone())))
                    .collect();
                let Some(key) = key else {
                    waiting.push(element);
                    continue;
                };
                let record = self.fetch_one(element, &key)?;
                match &record {
                    Some(record) => {
                        for dim in element.implied() {
                            if let Some(value) = record.dimension_value(dim) {
                                known.entry(dim.clone()).or_insert(value);
                            }
                        }
                    }
                    None if graph.required().iter().any(|d| d.name() == element.name()) => {
                        return Err(Error::resource_not_found(
                            "dimension record",
                            format!("{} {}", element.name(), fmt_key(&key)),
                        ));
                    }
                    None => {}
                }
                records.insert(element.name().to_string(), record);
            }
            if waiting.len() == before {
                for element in waiting {
                    records.insert(element.name().to_string(), None);
                }
                break;
            }
            pending = waiting;
        }

        let values = graph
            .required_names()
            .chain(graph.implied_names())
            .map(|name| {
                known
                    .remove(name)
                    .ok_or_else(|| Error::missing_dimension(name))
            })
            .collect::<Result<Vec<_>>>()?;
        DataCoordinate::from_full_values(graph, values)?.expanded(records)
    }
}

fn fmt_key(key: &BTreeMap<String, DataIdValue>) -> impl fmt::Display + '_ {
    struct Key<'k>(&'k BTreeMap<String, DataIdValue>);
    impl fmt::Display for Key<'_> {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("{")?;
            for (i, (name, value)) in self.0.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{name}: {value}")?;
            }
            f.write_str("}")
        }
    }
    Key(key)
}

impl fmt::Debug for DimensionRecordStorage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DimensionRecordStorage")
            .field("universe", &self.universe.version())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datum_core::MemoryDatabase;

    fn universe() -> &'static DimensionUniverse {
        DimensionUniverse::standard().unwrap()
    }

    fn record(element: &str, fields: &[(&str, Value)]) -> DimensionRecord {
        DimensionRecord::new(
            universe().element(element).unwrap(),
            fields.iter().map(|(k, v)| ((*k).to_string(), v.clone())),
        )
        .unwrap()
    }

    fn storage_with_base(db: &MemoryDatabase) -> DimensionRecordStorage<'_> {
        let storage = DimensionRecordStorage::new(db, universe());
        storage.ensure_tables().unwrap();
        storage
            .insert(
                &[
                    record("instrument", &[("name", "Cam1".into()), ("detector_max", 4.into())]),
                    record("band", &[("name", "r".into())]),
                    record(
                        "physical_filter",
                        &[("instrument", "Cam1".into()), ("name", "Cam1-R1".into()), ("band", "r".into())],
                    ),
                    record(
                        "detector",
                        &[("instrument", "Cam1".into()), ("id", 1.into()), ("full_name", "Aa".into())],
                    ),
                ],
                false,
            )
            .unwrap();
        storage
    }

    fn data_id(names: &[&str], values: &[(&str, DataIdValue)]) -> DataCoordinate {
        let graph = universe().extract(names).unwrap();
        let map = values
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        DataCoordinate::from_mapping(&map, &graph).unwrap()
    }

    #[test]
    fn table_specs_use_required_keys_and_alternates() {
        let detector = universe().element("detector").unwrap();
        let spec = table_spec(detector);
        spec.validate().unwrap();
        assert_eq!(spec.primary_key, ["instrument", "id"]);
        assert_eq!(spec.unique, vec![vec!["instrument".to_string(), "full_name".to_string()]]);
    }

    #[test]
    fn expand_reads_implied_values_from_records() {
        let db = MemoryDatabase::new();
        let storage = storage_with_base(&db);
        let partial = data_id(
            &["physical_filter"],
            &[("instrument", "Cam1".into()), ("physical_filter", "Cam1-R1".into())],
        );
        assert!(!partial.has_full());
        let expanded = storage.expand(&partial).unwrap();
        assert!(expanded.has_records());
        assert_eq!(expanded.get("band"), Some(&DataIdValue::from("r")));
        assert_eq!(
            expanded.record("band").unwrap().and_then(|r| r.get("name")),
            Some(&Value::from("r"))
        );
    }

    #[test]
    fn expand_requires_required_records() {
        let db = MemoryDatabase::new();
        let storage = storage_with_base(&db);
        let missing = data_id(&["detector"], &[("instrument", "Cam1".into()), ("detector", 9.into())]);
        assert!(storage.expand(&missing).unwrap_err().is_not_found());
    }

    #[test]
    fn expand_computes_skypix_regions() {
        let db = MemoryDatabase::new();
        let storage = DimensionRecordStorage::new(&db, universe());
        storage.ensure_tables().unwrap();
        let pixel = data_id(&["htm7"], &[("htm7", 12.into())]);
        let expanded = storage.expand(&pixel).unwrap();
        let region = expanded.record("htm7").unwrap().and_then(DimensionRecord::region).cloned();
        assert_eq!(region.unwrap().envelope(), &[(12, 13)]);
    }

    #[test]
    fn sync_is_idempotent_and_detects_changes() {
        let db = MemoryDatabase::new();
        let storage = storage_with_base(&db);
        let same = record(
            "detector",
            &[("instrument", "Cam1".into()), ("id", 1.into()), ("full_name", "Aa".into())],
        );
        assert_eq!(storage.sync(&same, false).unwrap(), SyncOutcome::Unchanged);
        let changed = record(
            "detector",
            &[("instrument", "Cam1".into()), ("id", 1.into()), ("full_name", "Ab".into())],
        );
        assert!(storage.sync(&changed, false).unwrap_err().is_conflict());
        assert_eq!(storage.sync(&changed, true).unwrap(), SyncOutcome::Updated);
        let fresh = record(
            "detector",
            &[("instrument", "Cam1".into()), ("id", 2.into()), ("full_name", "Ba".into())],
        );
        assert_eq!(storage.sync(&fresh, false).unwrap(), SyncOutcome::Inserted);
    }

    #[test]
    fn alternate_keys_are_unique_per_instrument() {
        let db = MemoryDatabase::new();
        let storage = storage_with_base(&db);
        let clash = record(
            "detector",
            &[("instrument", "Cam1".into()), ("id", 2.into()), ("full_name", "Aa".into())],
        );
        assert!(storage.insert(&[clash], false).unwrap_err().is_conflict());
    }
}
