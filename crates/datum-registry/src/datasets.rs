//! Dataset records and their collection memberships.
//!
//! A dataset is stored once in the `dataset` table (its ID, type, and owning
//! run) and once per collection it belongs to: RUN and TAGGED membership in
//! the type's tags table, CALIBRATION membership in its calibs table. The
//! data ID lives with each membership, keyed by the type's required
//! dimensions, so a lookup never needs the dataset table.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use tracing::{debug, info, warn};

use datum_core::database::row;
use datum_core::{
    DataCoordinate, DataIdValue, Database, DatabaseExt, DatasetId, DimensionUniverse, Error,
    Filter, Result, Row, Timespan, Value,
};

use crate::collections::{CollectionRecord, CollectionType};
use crate::dataset_type::{DatasetType, DatasetTypeManager};
use crate::tables::{self, get_str, get_timespan};

/// A resolved reference to one stored dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRef {
    /// Unique dataset ID.
    pub id: DatasetId,
    /// The dataset's type.
    pub dataset_type: DatasetType,
    /// The dataset's data ID, over the type's dimensions.
    pub data_id: DataCoordinate,
    /// The run that owns the dataset.
    pub run: String,
}

impl fmt::Display for DatasetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} [id={}, run={}]",
            self.dataset_type.name(),
            self.data_id,
            self.id,
            self.run
        )
    }
}

/// One membership of a dataset in a non-chained collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetAssociation {
    /// The dataset.
    pub dataset: DatasetRef,
    /// The collection it belongs to.
    pub collection: String,
    /// Validity range, for CALIBRATION memberships.
    pub timespan: Option<Timespan>,
}

/// A membership row, with the data ID still in key form.
#[derive(Debug, Clone)]
pub(crate) struct Membership {
    pub(crate) id: DatasetId,
    pub(crate) key: BTreeMap<String, DataIdValue>,
    pub(crate) validity: Option<Timespan>,
}

/// Dataset storage over a [`Database`].
#[derive(Clone, Copy)]
pub struct DatasetStorage<'a> {
    db: &'a dyn Database,
    universe: &'static DimensionUniverse,
}

fn key_values(dataset_type: &DatasetType, data_id: &DataCoordinate) -> Result<Vec<(String, Value)>> {
    dataset_type
        .dimensions()
        .required_names()
        .map(|name| {
            data_id
                .get(name)
                .map(|v| (name.to_string(), Value::from(v)))
                .ok_or_else(|| Error::missing_dimension(name))
        })
        .collect()
}

fn key_filters(
    collection: &str,
    dataset_type: &DatasetType,
    data_id: &DataCoordinate,
) -> Result<Vec<Filter>> {
    let mut filters = vec![Filter::eq("collection", collection)];
    for (name, value) in key_values(dataset_type, data_id)? {
        filters.push(Filter::eq(name, value));
    }
    Ok(filters)
}

fn membership_row(
    collection: &str,
    dataset: &DatasetRef,
    validity: Option<Timespan>,
) -> Result<Row> {
    let mut r = row([
        ("collection", Value::from(collection)),
        ("dataset_id", Value::from(dataset.id.to_string())),
    ]);
    r.extend(key_values(&dataset.dataset_type, &dataset.data_id)?);
    if let Some(validity) = validity {
        r.insert("validity".to_string(), Value::Timespan(validity));
    }
    Ok(r)
}

fn parse_membership(dataset_type: &DatasetType, stored: &Row) -> Result<Membership> {
    let key = dataset_type
        .dimensions()
        .required_names()
        .map(|name| {
            let value = stored
                .get(name)
                .ok_or_else(|| Error::internal(format!("membership row lacks '{name}'")))?;
            Ok((name.to_string(), value.to_data_id_value()?))
        })
        .collect::<Result<BTreeMap<_, _>>>()?;
    let validity = if stored.contains_key("validity") {
        get_timespan(stored, "validity")?
    } else {
        None
    };
    Ok(Membership {
        id: get_str(stored, "dataset_id")?.parse()?,
        key,
        validity,
    })
}

impl Membership {
    pub(crate) fn data_id(&self, dataset_type: &DatasetType) -> Result<DataCoordinate> {
        let values = dataset_type
            .dimensions()
            .required_names()
            .map(|name| {
                self.key
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::missing_dimension(name))
            })
            .collect::<Result<Vec<_>>>()?;
        DataCoordinate::from_required_values(dataset_type.dimensions(), values)
    }
}

impl<'a> DatasetStorage<'a> {
    /// Wraps a database connection.
    #[must_use]
    pub const fn new(db: &'a dyn Database, universe: &'static DimensionUniverse) -> Self {
        Self { db, universe }
    }

    fn types(&self) -> DatasetTypeManager<'a> {
        DatasetTypeManager::new(self.db, self.universe)
    }

    /// Inserts new datasets into a run.
    ///
    /// IDs are generated unless given. Data IDs are reduced to the type's
    /// dimensions.
    ///
    /// # Errors
    ///
    /// Returns `ConflictingDefinition` if the run already has a dataset of
    /// this type with one of the data IDs (nothing is inserted), and
    /// `InvalidInput` if `ids` does not match `data_ids` in length.
    pub fn insert(
        &self,
        dataset_type: &DatasetType,
        run: &str,
        data_ids: &[DataCoordinate],
        ids: Option<&[DatasetId]>,
    ) -> Result<Vec<DatasetRef>> {
        self.db.require_writeable("inserting datasets")?;
        if let Some(ids) = ids {
            if ids.len() != data_ids.len() {
                return Err(Error::InvalidInput(format!(
                    "{} dataset IDs given for {} data IDs",
                    ids.len(),
                    data_ids.len()
                )));
            }
        }
        let refs = data_ids
            .iter()
            .enumerate()
            .map(|(i, data_id)| {
                Ok(DatasetRef {
                    id: ids.map_or_else(DatasetId::generate, |ids| ids[i]),
                    dataset_type: dataset_type.clone(),
                    data_id: data_id.subset(dataset_type.dimensions())?,
                    run: run.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let dataset_rows = refs
            .iter()
            .map(|r| {
                row([
                    ("id", Value::from(r.id.to_string())),
                    ("dataset_type", Value::from(dataset_type.name())),
                    ("run", Value::from(run)),
                ])
            })
            .collect();
        let tag_rows = refs
            .iter()
            .map(|r| membership_row(run, r, None))
            .collect::<Result<Vec<_>>>()?;
        self.db.transaction(true, || {
            self.db.insert(tables::DATASET, dataset_rows)?;
            self.db
                .insert(&dataset_type.tags_table(), tag_rows)
                .map_err(|e| match e {
                    Error::ConflictingDefinition { message } => Error::conflict(format!(
                        "a {} dataset with one of these data IDs already exists in run '{run}': {message}",
                        dataset_type.name()
                    )),
                    other => other,
                })
        })?;
        info!(dataset_type = dataset_type.name(), run, count = refs.len(), "inserted datasets");
        Ok(refs)
    }

    /// Looks up a dataset by ID.
    ///
    /// # Errors
    ///
    /// Returns a storage error only.
    pub fn get(&self, id: DatasetId) -> Result<Option<DatasetRef>> {
        let Some(stored) = self
            .db
            .select_one(tables::DATASET, &[Filter::eq("id", id.to_string())])?
        else {
            return Ok(None);
        };
        let dataset_type = self.types().find(get_str(&stored, "dataset_type")?)?;
        let run = get_str(&stored, "run")?.to_string();
        let membership = self
            .db
            .select_one(
                &dataset_type.tags_table(),
                &[
                    Filter::eq("collection", run.as_str()),
                    Filter::eq("dataset_id", id.to_string()),
                ],
            )?
            .ok_or_else(|| Error::internal(format!("dataset {id} is missing from run '{run}'")))?;
        let data_id = parse_membership(&dataset_type, &membership)?.data_id(&dataset_type)?;
        Ok(Some(DatasetRef {
            id,
            dataset_type,
            data_id,
            run,
        }))
    }

    /// Adds datasets to a TAGGED collection.
    ///
    /// Datasets already in the collection are skipped.
    ///
    /// # Errors
    ///
    /// Returns `ConflictingDefinition` if the collection already holds a
    /// different dataset with the same type and data ID; nothing is added.
    pub fn associate(&self, collection: &str, refs: &[DatasetRef]) -> Result<()> {
        self.db.require_writeable("associating datasets")?;
        let mut claimed: HashMap<(String, DataCoordinate), DatasetId> = HashMap::new();
        for dataset in refs {
            let slot = (dataset.dataset_type.name().to_string(), dataset.data_id.clone());
            if let Some(other) = claimed.insert(slot, dataset.id) {
                if other != dataset.id {
                    return Err(Error::conflict(format!(
                        "datasets {other} and {} share data ID {} in '{collection}'",
                        dataset.id, dataset.data_id
                    )));
                }
            }
        }
        // A concurrent binding of the same data ID fails the unique key at commit.
        self.db.transaction(true, || {
            let mut rows: BTreeMap<String, Vec<Row>> = BTreeMap::new();
            for dataset in refs {
                let dataset_type = &dataset.dataset_type;
                let existing = self.db.select(
                    &dataset_type.tags_table(),
                    &key_filters(collection, dataset_type, &dataset.data_id)?,
                )?;
                match existing.first().map(|r| parse_membership(dataset_type, r)).transpose()? {
                    Some(m) if m.id == dataset.id => {}
                    Some(m) => {
                        return Err(Error::conflict(format!(
                            "'{collection}' already holds dataset {} for {dataset}",
                            m.id
                        )))
                    }
                    None => {
                        let pending = rows.entry(dataset_type.tags_table()).or_default();
                        let row = membership_row(collection, dataset, None)?;
                        if !pending.contains(&row) {
                            pending.push(row);
                        }
                    }
                }
            }
            for (table, rows) in rows {
                self.db.insert(&table, rows)?;
            }
            Ok(())
        })?;
        debug!(collection, count = refs.len(), "associated datasets");
        Ok(())
    }

    /// Removes datasets from a TAGGED collection. Absent datasets are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns a storage error only.
    pub fn disassociate(&self, collection: &str, refs: &[DatasetRef]) -> Result<()> {
        self.db.require_writeable("disassociating datasets")?;
        self.db.transaction(true, || {
            for dataset in refs {
                self.db.delete(
                    &dataset.dataset_type.tags_table(),
                    &[
                        Filter::eq("collection", collection),
                        Filter::eq("dataset_id", dataset.id.to_string()),
                    ],
                )?;
            }
            Ok(())
        })
    }

    /// Certifies datasets of one calibration type into a CALIBRATION
    /// collection over `timespan`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for non-calibration types, and
    /// `ConflictingDefinition` if any data ID already has a certification
    /// overlapping `timespan` (nothing is certified).
    pub fn certify(
        &self,
        collection: &str,
        dataset_type: &DatasetType,
        refs: &[DatasetRef],
        timespan: Timespan,
    ) -> Result<()> {
        require_calibration(dataset_type)?;
        self.db.require_writeable("certifying datasets")?;
        let table = dataset_type.calibs_table();
        let mut seen = HashSet::new();
        let mut rows = Vec::with_capacity(refs.len());
        for dataset in refs {
            if dataset.dataset_type != *dataset_type {
                return Err(Error::InvalidInput(format!(
                    "{dataset} is not a {} dataset",
                    dataset_type.name()
                )));
            }
            let data_id = dataset.data_id.subset(dataset_type.dimensions())?;
            let mut filters = key_filters(collection, dataset_type, &data_id)?;
            filters.push(Filter::overlaps("validity", timespan));
            let overlapping = !self.db.select(&table, &filters)?.is_empty();
            if overlapping || !seen.insert(data_id.clone()) {
                warn!(
                    collection,
                    dataset_type = dataset_type.name(),
                    data_id = %data_id,
                    %timespan,
                    "rejected certification overlapping an existing validity range"
                );
                return Err(Error::conflict(format!(
                    "{data_id} already has a {} certified in '{collection}' overlapping {timespan}",
                    dataset_type.name()
                )));
            }
            rows.push(membership_row(collection, dataset, Some(timespan))?);
        }
        self.db.transaction(true, || self.db.insert(&table, rows))?;
        info!(collection, dataset_type = dataset_type.name(), count = refs.len(), %timespan, "certified datasets");
        Ok(())
    }

    /// Removes certifications overlapping `timespan`, optionally only for
    /// the given data IDs.
    ///
    /// Validity ranges that extend past `timespan` are trimmed, and split in
    /// two when `timespan` lies strictly inside. Returns the number of
    /// certifications changed.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for non-calibration types.
    pub fn decertify(
        &self,
        collection: &str,
        dataset_type: &DatasetType,
        timespan: Timespan,
        data_ids: Option<&[DataCoordinate]>,
    ) -> Result<usize> {
        require_calibration(dataset_type)?;
        self.db.require_writeable("decertifying datasets")?;
        let table = dataset_type.calibs_table();
        let wanted = data_ids
            .map(|ids| {
                ids.iter()
                    .map(|d| key_values(dataset_type, d))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;
        let rows: Vec<Row> = self
            .db
            .select(
                &table,
                &[
                    Filter::eq("collection", collection),
                    Filter::overlaps("validity", timespan),
                ],
            )?
            .into_iter()
            .filter(|r| {
                wanted.as_ref().map_or(true, |keys| {
                    keys.iter()
                        .any(|key| key.iter().all(|(name, value)| r.get(name) == Some(value)))
                })
            })
            .collect();

        let changed = rows.len();
        self.db.transaction(true, || {
            for stored in rows {
                let validity = get_timespan(&stored, "validity")?
                    .ok_or_else(|| Error::internal("certification without validity"))?;
                self.db.delete(
                    &table,
                    &[
                        Filter::eq("collection", collection),
                        Filter::eq("dataset_id", stored.get("dataset_id").cloned().unwrap_or(Value::Null)),
                        Filter::eq("validity", validity),
                    ],
                )?;
                let pieces = validity
                    .difference(&timespan)
                    .into_iter()
                    .map(|piece| {
                        let mut r = stored.clone();
                        r.insert("validity".to_string(), Value::Timespan(piece));
                        r
                    })
                    .collect::<Vec<_>>();
                if !pieces.is_empty() {
                    self.db.insert(&table, pieces)?;
                }
            }
            Ok(())
        })?;
        info!(collection, dataset_type = dataset_type.name(), changed, %timespan, "decertified datasets");
        Ok(changed)
    }

    /// Searches non-chained collections in order for a dataset.
    ///
    /// CALIBRATION collections match a certification whose validity range
    /// overlaps `timespan`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a CALIBRATION collection is searched
    /// without a timespan, and `AmbiguousResult` if more than one
    /// certification matches in one collection.
    pub fn find(
        &self,
        dataset_type: &DatasetType,
        data_id: &DataCoordinate,
        collections: &[CollectionRecord],
        timespan: Option<Timespan>,
    ) -> Result<Option<DatasetRef>> {
        let data_id = data_id.subset(dataset_type.dimensions())?;
        for record in collections {
            let collection = record.name.as_str();
            let mut filters = key_filters(collection, dataset_type, &data_id)?;
            let found = match record.collection_type {
                CollectionType::Run | CollectionType::Tagged => self
                    .db
                    .select(&dataset_type.tags_table(), &filters)?
                    .into_iter()
                    .next(),
                CollectionType::Calibration => {
                    if !dataset_type.is_calibration() {
                        continue;
                    }
                    let timespan = timespan.ok_or_else(|| {
                        Error::InvalidInput(format!(
                            "searching CALIBRATION collection '{collection}' needs a timespan"
                        ))
                    })?;
                    filters.push(Filter::overlaps("validity", timespan));
                    let mut rows = self.db.select(&dataset_type.calibs_table(), &filters)?;
                    if rows.len() > 1 {
                        return Err(Error::ambiguous(format!(
                            "{} certifications of {} for {data_id} in '{collection}' overlap {timespan}",
                            rows.len(),
                            dataset_type.name()
                        )));
                    }
                    rows.pop()
                }
                CollectionType::Chained => {
                    return Err(Error::internal(format!(
                        "chained collection '{collection}' was not resolved before search"
                    )))
                }
            };
            if let Some(stored) = found {
                let membership = parse_membership(dataset_type, &stored)?;
                return self.get(membership.id);
            }
        }
        Ok(None)
    }

    /// Deletes datasets and every membership they have.
    ///
    /// # Errors
    ///
    /// Returns a storage error only.
    pub fn remove(&self, refs: &[DatasetRef]) -> Result<()> {
        self.db.require_writeable("removing datasets")?;
        self.db.transaction(true, || {
            for dataset in refs {
                let id = Filter::eq("dataset_id", dataset.id.to_string());
                self.db
                    .delete(&dataset.dataset_type.tags_table(), std::slice::from_ref(&id))?;
                if dataset.dataset_type.is_calibration() {
                    self.db
                        .delete(&dataset.dataset_type.calibs_table(), std::slice::from_ref(&id))?;
                }
                self.db
                    .delete(tables::DATASET, &[Filter::eq("id", dataset.id.to_string())])?;
            }
            Ok(())
        })?;
        info!(count = refs.len(), "removed datasets");
        Ok(())
    }

    /// Removes everything a collection holds: a run's datasets, or a tagged
    /// or calibration collection's memberships.
    ///
    /// # Errors
    ///
    /// Returns a storage error only.
    pub fn clear_collection(&self, record: &CollectionRecord) -> Result<()> {
        match record.collection_type {
            CollectionType::Run => {
                let mut owned = Vec::new();
                for stored in self
                    .db
                    .select(tables::DATASET, &[Filter::eq("run", record.name.as_str())])?
                {
                    let id: DatasetId = get_str(&stored, "id")?.parse()?;
                    owned.extend(self.get(id)?);
                }
                self.remove(&owned)
            }
            CollectionType::Tagged | CollectionType::Calibration => {
                let calibration = record.collection_type == CollectionType::Calibration;
                for dataset_type in self.types().query(None)? {
                    if calibration && !dataset_type.is_calibration() {
                        continue;
                    }
                    let table = if calibration {
                        dataset_type.calibs_table()
                    } else {
                        dataset_type.tags_table()
                    };
                    self.db
                        .delete(&table, &[Filter::eq("collection", record.name.as_str())])?;
                }
                Ok(())
            }
            CollectionType::Chained => Ok(()),
        }
    }

    /// Raw memberships of one collection.
    pub(crate) fn memberships(
        &self,
        dataset_type: &DatasetType,
        record: &CollectionRecord,
    ) -> Result<Vec<Membership>> {
        let table = match record.collection_type {
            CollectionType::Run | CollectionType::Tagged => dataset_type.tags_table(),
            CollectionType::Calibration if dataset_type.is_calibration() => {
                dataset_type.calibs_table()
            }
            CollectionType::Calibration | CollectionType::Chained => return Ok(Vec::new()),
        };
        self.db
            .select(&table, &[Filter::eq("collection", record.name.as_str())])?
            .iter()
            .map(|r| parse_membership(dataset_type, r))
            .collect()
    }

    /// Owning run of every dataset of a type.
    pub(crate) fn runs(&self, dataset_type: &DatasetType) -> Result<HashMap<DatasetId, String>> {
        self.db
            .select(tables::DATASET, &[Filter::eq("dataset_type", dataset_type.name())])?
            .iter()
            .map(|r| Ok((get_str(r, "id")?.parse()?, get_str(r, "run")?.to_string())))
            .collect()
    }

    /// Every membership of datasets of one type in the given collections.
    ///
    /// # Errors
    ///
    /// Returns a storage error only.
    pub fn associations(
        &self,
        dataset_type: &DatasetType,
        collections: &[CollectionRecord],
    ) -> Result<Vec<DatasetAssociation>> {
        let runs = self.runs(dataset_type)?;
        let mut out = Vec::new();
        for record in collections {
            for membership in self.memberships(dataset_type, record)? {
                let run = runs.get(&membership.id).cloned().ok_or_else(|| {
                    Error::internal(format!("dataset {} has no run", membership.id))
                })?;
                out.push(DatasetAssociation {
                    dataset: DatasetRef {
                        id: membership.id,
                        dataset_type: dataset_type.clone(),
                        data_id: membership.data_id(dataset_type)?,
                        run,
                    },
                    collection: record.name.clone(),
                    timespan: membership.validity,
                });
            }
        }
        Ok(out)
    }
}

fn require_calibration(dataset_type: &DatasetType) -> Result<()> {
    if dataset_type.is_calibration() {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "dataset type '{}' is not a calibration type",
            dataset_type.name()
        )))
    }
}

impl fmt::Debug for DatasetStorage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetStorage")
            .field("universe", &self.universe.version())
            .finish_non_exhaustive()
    }
}
