//! The registry facade.
//!
//! [`Registry`] owns a database connection and the dimension universe the
//! database was created with, and exposes every catalog operation. Each
//! entry point validates collection types before delegating to the
//! per-concern managers, and runs inside a `registry` span.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};

use datum_core::database::row;
use datum_core::observability::registry_span;
use datum_core::{
    DataCoordinate, Database, DatabaseExt, DatasetId, DimensionConfig, DimensionGraph,
    DimensionRecord, DimensionUniverse, Error, Filter, MemoryStore, Result, Timespan, Value,
};

use crate::collections::{
    ChainLink, CollectionManager, CollectionQuery, CollectionRecord, CollectionType, NamePattern,
    RunRecord,
};
use crate::config::RegistryConfig;
use crate::dataset_type::{DatasetType, DatasetTypeManager};
use crate::datasets::{DatasetAssociation, DatasetRef, DatasetStorage};
use crate::dimension_records::{DimensionRecordStorage, SyncOutcome};
use crate::query::{DatasetSearch, QueryBuilder};
use crate::tables::{self, get_str};
use crate::transfers::{self, ImportSummary, RepoExport};

const ATTR_DIMENSION_CONFIG: &str = "dimension_config";
const ATTR_UNIVERSE_VERSION: &str = "universe_version";

/// Optional constraints shared by the query entry points.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Data ID every result must agree with.
    pub data_id: Option<DataCoordinate>,
    /// Boolean predicate over dimension names and record fields.
    pub where_clause: Option<String>,
    /// Dataset types whose existence in `collections` is required.
    pub datasets: Vec<String>,
    /// Collections to search, in order.
    pub collections: Vec<String>,
    /// Timespan for CALIBRATION lookups when the data ID has none.
    pub timespan: Option<Timespan>,
    /// Keep only the first collection's dataset for each data ID.
    pub find_first: bool,
}

/// A dataset catalog over one database.
#[derive(Clone)]
pub struct Registry {
    db: Arc<dyn Database>,
    universe: &'static DimensionUniverse,
}

impl Registry {
    /// Initializes a registry in an empty database.
    ///
    /// Creating over an existing registry with the same dimension
    /// configuration opens it.
    ///
    /// # Errors
    ///
    /// Returns `ConflictingDefinition` if the database holds a registry
    /// with another dimension configuration, and `ReadOnly` on a read-only
    /// connection.
    pub fn create(db: Arc<dyn Database>, config: &DimensionConfig) -> Result<Self> {
        let universe = DimensionUniverse::from_config(config)?;
        if let Some(existing) = stored_config(db.as_ref())? {
            if existing != *config {
                return Err(Error::conflict(format!(
                    "database already holds a registry with dimension universe version {}",
                    existing.version
                )));
            }
            debug!(version = universe.version(), "registry already initialized");
            return Ok(Self { db, universe });
        }
        db.require_writeable("creating a registry")?;
        let json = serde_json::to_string(config)?;
        db.transaction(false, || {
            for spec in tables::static_specs() {
                db.ensure_table(&spec)?;
            }
            db.insert(
                tables::ATTRIBUTES,
                vec![
                    row([
                        ("name", Value::from(ATTR_DIMENSION_CONFIG)),
                        ("value", Value::from(json.as_str())),
                    ]),
                    row([
                        ("name", Value::from(ATTR_UNIVERSE_VERSION)),
                        ("value", Value::from(universe.version().to_string())),
                    ]),
                ],
            )?;
            DimensionRecordStorage::new(db.as_ref(), universe).ensure_tables()
        })?;
        info!(version = universe.version(), "created registry");
        Ok(Self { db, universe })
    }

    /// Opens the registry stored in a database.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if the database holds no registry.
    pub fn open(db: Arc<dyn Database>) -> Result<Self> {
        let config = stored_config(db.as_ref())?
            .ok_or_else(|| Error::resource_not_found("registry", "attributes"))?;
        let universe = DimensionUniverse::from_config(&config)?;
        debug!(version = universe.version(), writeable = db.is_writeable(), "opened registry");
        Ok(Self { db, universe })
    }

    /// Opens the registry in `store`, creating it first on a writeable
    /// connection if the store is empty.
    ///
    /// # Errors
    ///
    /// As for [`open`](Self::open) and [`create`](Self::create).
    pub fn connect(store: &MemoryStore, config: &RegistryConfig) -> Result<Self> {
        let db: Arc<dyn Database> = Arc::new(store.connect(config.writeable));
        match Self::open(Arc::clone(&db)) {
            Err(err) if err.is_not_found() && config.writeable => {
                Self::create(db, &config.load_dimensions()?)
            }
            other => other,
        }
    }

    /// The dimension universe.
    #[must_use]
    pub const fn universe(&self) -> &'static DimensionUniverse {
        self.universe
    }

    /// The underlying connection.
    #[must_use]
    pub fn database(&self) -> &dyn Database {
        self.db.as_ref()
    }

    /// Whether mutating operations are allowed.
    #[must_use]
    pub fn is_writeable(&self) -> bool {
        self.db.is_writeable()
    }

    /// Runs `body` in a transaction, or a savepoint within the current one.
    ///
    /// # Errors
    ///
    /// Returns the body's error after rolling back its scope.
    pub fn transaction<T>(&self, savepoint: bool, body: impl FnOnce() -> Result<T>) -> Result<T> {
        self.db.transaction(savepoint, body)
    }

    pub(crate) fn collections(&self) -> CollectionManager<'_> {
        CollectionManager::new(self.db.as_ref())
    }

    pub(crate) fn dataset_types(&self) -> DatasetTypeManager<'_> {
        DatasetTypeManager::new(self.db.as_ref(), self.universe)
    }

    pub(crate) fn datasets(&self) -> DatasetStorage<'_> {
        DatasetStorage::new(self.db.as_ref(), self.universe)
    }

    pub(crate) fn dimension_records(&self) -> DimensionRecordStorage<'_> {
        DimensionRecordStorage::new(self.db.as_ref(), self.universe)
    }

    // Collections.

    /// Registers a collection; returns false if it already exists with this
    /// type.
    ///
    /// # Errors
    ///
    /// Returns `ConflictingDefinition` if it exists with another type.
    pub fn register_collection(
        &self,
        name: &str,
        collection_type: CollectionType,
        doc: Option<&str>,
    ) -> Result<bool> {
        let _span = registry_span("register_collection", name).entered();
        self.collections().register(name, collection_type, doc)
    }

    /// Registers a RUN, recording host and timespan metadata.
    ///
    /// # Errors
    ///
    /// Returns `ConflictingDefinition` if a non-RUN collection has the name.
    pub fn register_run(
        &self,
        name: &str,
        host: Option<&str>,
        timespan: Option<Timespan>,
    ) -> Result<bool> {
        let _span = registry_span("register_run", name).entered();
        self.collections().register_run(name, host, timespan)
    }

    /// Looks up a collection.
    ///
    /// # Errors
    ///
    /// Returns `MissingCollection` if there is none.
    pub fn get_collection(&self, name: &str) -> Result<CollectionRecord> {
        self.collections().find(name)
    }

    /// Run metadata.
    ///
    /// # Errors
    ///
    /// Returns `MissingCollection` or `CollectionTypeMismatch`.
    pub fn get_run(&self, name: &str) -> Result<RunRecord> {
        self.collections().run(name)
    }

    /// A collection's documentation string.
    ///
    /// # Errors
    ///
    /// Returns `MissingCollection` if there is none.
    pub fn get_collection_documentation(&self, name: &str) -> Result<Option<String>> {
        Ok(self.collections().find(name)?.doc)
    }

    /// Sets or clears a collection's documentation string.
    ///
    /// # Errors
    ///
    /// Returns `MissingCollection` if there is none.
    pub fn set_collection_documentation(&self, name: &str, doc: Option<&str>) -> Result<()> {
        self.collections().set_doc(name, doc)
    }

    /// Removes a collection and everything it holds.
    ///
    /// Removing a RUN removes its datasets from every collection.
    ///
    /// # Errors
    ///
    /// Returns `ReferentialIntegrity` if a chain references it; nothing is
    /// removed.
    pub fn remove_collection(&self, name: &str) -> Result<()> {
        let _span = registry_span("remove_collection", name).entered();
        let record = self.collections().find(name)?;
        self.db.require_writeable("removing a collection")?;
        self.db.transaction(true, || {
            self.datasets().clear_collection(&record)?;
            self.collections().remove(name)
        })
    }

    /// Children of a CHAINED collection.
    ///
    /// # Errors
    ///
    /// Returns `CollectionTypeMismatch` for other collection types.
    pub fn get_collection_chain(&self, parent: &str) -> Result<Vec<ChainLink>> {
        self.collections().chain(parent)
    }

    /// Replaces the children of a CHAINED collection.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the chain would contain a cycle; the old
    /// chain is kept.
    pub fn set_collection_chain(
        &self,
        parent: &str,
        children: Vec<ChainLink>,
        flatten: bool,
    ) -> Result<()> {
        let _span = registry_span("set_collection_chain", parent).entered();
        self.collections().set_chain(parent, children, flatten)
    }

    /// CHAINED collections that list `child` directly.
    ///
    /// # Errors
    ///
    /// Returns a storage error only.
    pub fn get_collection_parents(&self, child: &str) -> Result<BTreeSet<String>> {
        self.collections().parents(child)
    }

    /// Collections matching a query.
    ///
    /// # Errors
    ///
    /// Returns `MissingCollection` for unknown literal names.
    pub fn query_collections(&self, query: &CollectionQuery) -> Result<Vec<CollectionRecord>> {
        self.collections().query(query)
    }

    // Dataset types.

    /// Registers a dataset type; returns false if it is already registered.
    ///
    /// # Errors
    ///
    /// Returns `ConflictingDefinition` if another definition has the name.
    pub fn register_dataset_type(&self, dataset_type: &DatasetType) -> Result<bool> {
        self.dataset_types().register(dataset_type)
    }

    /// Looks up a dataset type.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if there is none.
    pub fn get_dataset_type(&self, name: &str) -> Result<DatasetType> {
        self.dataset_types().find(name)
    }

    /// Removes a dataset type with no datasets.
    ///
    /// # Errors
    ///
    /// Returns `ReferentialIntegrity` while datasets of the type exist.
    pub fn remove_dataset_type(&self, name: &str) -> Result<()> {
        self.dataset_types().remove(name)
    }

    /// Dataset types matching a name pattern, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns a storage error only.
    pub fn query_dataset_types(&self, pattern: Option<&NamePattern>) -> Result<Vec<DatasetType>> {
        self.dataset_types().query(pattern)
    }

    // Datasets.

    /// Inserts new datasets into a RUN.
    ///
    /// Data IDs are expanded first, so every dimension value must have a
    /// record.
    ///
    /// # Errors
    ///
    /// Returns `CollectionTypeMismatch` if `run` is not a RUN,
    /// `ResourceNotFound` for missing dimension records, and
    /// `ConflictingDefinition` if the run already has one of the data IDs.
    pub fn insert_datasets(
        &self,
        dataset_type: &str,
        data_ids: &[DataCoordinate],
        run: &str,
    ) -> Result<Vec<DatasetRef>> {
        let _span = registry_span("insert_datasets", run).entered();
        let dataset_type = self.dataset_types().find(dataset_type)?;
        self.collections().find(run)?.require(&[CollectionType::Run])?;
        let expanded = self.expand_all(&dataset_type, data_ids)?;
        self.datasets().insert(&dataset_type, run, &expanded, None)
    }

    /// Inserts datasets with the IDs they already carry.
    ///
    /// # Errors
    ///
    /// As for [`insert_datasets`](Self::insert_datasets), plus
    /// `ConflictingDefinition` if an ID is in use.
    pub fn import_datasets(&self, refs: &[DatasetRef]) -> Result<Vec<DatasetRef>> {
        let mut groups: BTreeMap<(String, String), (DatasetType, Vec<DataCoordinate>, Vec<DatasetId>)> =
            BTreeMap::new();
        for dataset in refs {
            let entry = groups
                .entry((dataset.dataset_type.name().to_string(), dataset.run.clone()))
                .or_insert_with(|| (dataset.dataset_type.clone(), Vec::new(), Vec::new()));
            entry.1.push(dataset.data_id.clone());
            entry.2.push(dataset.id);
        }
        self.db.transaction(true, || {
            let mut imported = Vec::with_capacity(refs.len());
            for ((type_name, run), (dataset_type, data_ids, ids)) in &groups {
                let _span = registry_span("import_datasets", run).entered();
                let registered = self.dataset_types().find(type_name)?;
                if registered != *dataset_type {
                    return Err(Error::conflict(format!(
                        "{dataset_type} does not match registered {registered}"
                    )));
                }
                self.collections().find(run)?.require(&[CollectionType::Run])?;
                let expanded = self.expand_all(&registered, data_ids)?;
                imported.extend(self.datasets().insert(&registered, run, &expanded, Some(ids))?);
            }
            Ok(imported)
        })
    }

    fn expand_all(
        &self,
        dataset_type: &DatasetType,
        data_ids: &[DataCoordinate],
    ) -> Result<Vec<DataCoordinate>> {
        let storage = self.dimension_records();
        data_ids
            .iter()
            .map(|d| storage.expand(&d.subset(dataset_type.dimensions())?))
            .collect()
    }

    /// Looks up a dataset by ID.
    ///
    /// # Errors
    ///
    /// Returns a storage error only.
    pub fn get_dataset(&self, id: DatasetId) -> Result<Option<DatasetRef>> {
        self.datasets().get(id)
    }

    /// Removes datasets from the registry and every collection.
    ///
    /// # Errors
    ///
    /// Returns a storage error only.
    pub fn remove_datasets(&self, refs: &[DatasetRef]) -> Result<()> {
        self.datasets().remove(refs)
    }

    /// Searches collections in order for a dataset.
    ///
    /// CHAINED collections are searched through their children. CALIBRATION
    /// collections need `timespan`, or an expanded data ID with a temporal
    /// extent.
    ///
    /// # Errors
    ///
    /// Returns `MissingCollection` for unknown collections, `InvalidInput`
    /// if a calibration search has no timespan, and `AmbiguousResult` if
    /// several certifications match.
    pub fn find_dataset(
        &self,
        dataset_type: &str,
        data_id: &DataCoordinate,
        collections: &[String],
        timespan: Option<Timespan>,
    ) -> Result<Option<DatasetRef>> {
        let dataset_type = self.dataset_types().find(dataset_type)?;
        let searched = self
            .collections()
            .resolve(collections, Some(dataset_type.name()))?;
        let timespan = match timespan {
            Some(t) => Some(t),
            None if data_id.has_records() => data_id.timespan()?,
            None => None,
        };
        self.datasets()
            .find(&dataset_type, data_id, &searched, timespan)
    }

    /// Adds datasets to a TAGGED collection.
    ///
    /// # Errors
    ///
    /// Returns `CollectionTypeMismatch` for other collection types and
    /// `ConflictingDefinition` if another dataset holds a data ID there.
    pub fn associate(&self, collection: &str, refs: &[DatasetRef]) -> Result<()> {
        let _span = registry_span("associate", collection).entered();
        self.collections()
            .find(collection)?
            .require(&[CollectionType::Tagged])?;
        self.datasets().associate(collection, refs)
    }

    /// Removes datasets from a TAGGED collection.
    ///
    /// # Errors
    ///
    /// Returns `CollectionTypeMismatch` for other collection types.
    pub fn disassociate(&self, collection: &str, refs: &[DatasetRef]) -> Result<()> {
        let _span = registry_span("disassociate", collection).entered();
        self.collections()
            .find(collection)?
            .require(&[CollectionType::Tagged])?;
        self.datasets().disassociate(collection, refs)
    }

    /// Certifies calibration datasets into a CALIBRATION collection.
    ///
    /// The whole batch is rejected if any certification would overlap an
    /// existing one for the same data ID.
    ///
    /// # Errors
    ///
    /// Returns `CollectionTypeMismatch` for other collection types and
    /// `ConflictingDefinition` on overlap.
    pub fn certify(&self, collection: &str, refs: &[DatasetRef], timespan: Timespan) -> Result<()> {
        let _span = registry_span("certify", collection).entered();
        self.collections()
            .find(collection)?
            .require(&[CollectionType::Calibration])?;
        let mut by_type: BTreeMap<String, (DatasetType, Vec<DatasetRef>)> = BTreeMap::new();
        for dataset in refs {
            by_type
                .entry(dataset.dataset_type.name().to_string())
                .or_insert_with(|| (dataset.dataset_type.clone(), Vec::new()))
                .1
                .push(dataset.clone());
        }
        self.db.transaction(true, || {
            for (dataset_type, batch) in by_type.values() {
                self.datasets()
                    .certify(collection, dataset_type, batch, timespan)?;
            }
            Ok(())
        })
    }

    /// Removes or trims certifications overlapping `timespan`.
    ///
    /// # Errors
    ///
    /// Returns `CollectionTypeMismatch` for other collection types.
    pub fn decertify(
        &self,
        collection: &str,
        dataset_type: &str,
        timespan: Timespan,
        data_ids: Option<&[DataCoordinate]>,
    ) -> Result<usize> {
        let _span = registry_span("decertify", collection).entered();
        self.collections()
            .find(collection)?
            .require(&[CollectionType::Calibration])?;
        let dataset_type = self.dataset_types().find(dataset_type)?;
        self.datasets()
            .decertify(collection, &dataset_type, timespan, data_ids)
    }

    // Dimensions.

    /// Inserts dimension records.
    ///
    /// # Errors
    ///
    /// Returns `ConflictingDefinition` if a record exists and `replace` is
    /// false.
    pub fn insert_dimension_data(&self, records: &[DimensionRecord], replace: bool) -> Result<()> {
        self.dimension_records().insert(records, replace)
    }

    /// Inserts a dimension record unless an identical one exists.
    ///
    /// # Errors
    ///
    /// Returns `ConflictingDefinition` if a different record exists and
    /// `update` is false.
    pub fn sync_dimension_data(&self, record: &DimensionRecord, update: bool) -> Result<SyncOutcome> {
        self.dimension_records().sync(record, update)
    }

    /// Attaches dimension records to a data ID.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` if a required dimension has no record.
    pub fn expand_data_id(&self, data_id: &DataCoordinate) -> Result<DataCoordinate> {
        self.dimension_records().expand(data_id)
    }

    // Queries.

    /// Starts a query over `requested`.
    #[must_use]
    pub fn query(&self, requested: DimensionGraph) -> QueryBuilder<'_> {
        QueryBuilder::new(self.db.as_ref(), requested)
    }

    fn builder(
        &self,
        requested: DimensionGraph,
        options: &QueryOptions,
    ) -> Result<QueryBuilder<'_>> {
        let mut builder = self.query(requested);
        if let Some(data_id) = &options.data_id {
            builder = builder.where_data_id(data_id)?;
        }
        if let Some(text) = &options.where_clause {
            builder = builder.where_expression(text)?;
        }
        if let Some(timespan) = options.timespan {
            builder = builder.with_timespan(timespan);
        }
        for name in &options.datasets {
            builder = builder.join_dataset(self.search(name, options, false)?)?;
        }
        Ok(builder)
    }

    fn search(&self, dataset_type: &str, options: &QueryOptions, find_first: bool) -> Result<DatasetSearch> {
        if options.collections.is_empty() {
            return Err(Error::InvalidInput(format!(
                "searching for '{dataset_type}' datasets needs collections"
            )));
        }
        let dataset_type = self.dataset_types().find(dataset_type)?;
        let collections = self
            .collections()
            .resolve(&options.collections, Some(dataset_type.name()))?;
        Ok(DatasetSearch {
            dataset_type,
            collections,
            find_first,
        })
    }

    /// Distinct data IDs of `dimensions` satisfying the options.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for malformed predicates and dataset
    /// constraints without collections.
    pub fn query_data_ids<S: AsRef<str>>(
        &self,
        dimensions: &[S],
        options: &QueryOptions,
    ) -> Result<Vec<DataCoordinate>> {
        let requested = self.universe.extract(dimensions.iter().map(AsRef::as_ref))?;
        self.builder(requested, options)?.build()?.data_ids()
    }

    /// Datasets of one type in the option's collections.
    ///
    /// Results are restricted by joins with `dimensions` as well as the
    /// type's own dimensions.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` without collections and `AmbiguousResult` if
    /// a find-first calibration search matches twice in one collection.
    pub fn query_datasets<S: AsRef<str>>(
        &self,
        dataset_type: &str,
        dimensions: &[S],
        options: &QueryOptions,
    ) -> Result<Vec<DatasetRef>> {
        let search = self.search(dataset_type, options, options.find_first)?;
        let requested = self
            .universe
            .extract(dimensions.iter().map(AsRef::as_ref))?
            .union(search.dataset_type.dimensions())?;
        let query = self.builder(requested, options)?.join_dataset(search)?.build()?;
        query.dataset_refs(options.datasets.len())
    }

    /// Records of one element whose data IDs satisfy the options.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` for unknown elements.
    pub fn query_dimension_records(
        &self,
        element: &str,
        options: &QueryOptions,
    ) -> Result<Vec<DimensionRecord>> {
        let element = self.universe.element(element)?;
        let requested = self.universe.extract(element.required())?;
        let storage = self.dimension_records();
        let mut records = Vec::new();
        for data_id in self.builder(requested, options)?.build()?.data_ids()? {
            records.extend(storage.fetch_one(element, &data_id.by_name())?);
        }
        Ok(records)
    }

    /// Every membership of one type's datasets in the matching collections.
    ///
    /// Chains are flattened.
    ///
    /// # Errors
    ///
    /// Returns `ResourceNotFound` for unknown dataset types.
    pub fn query_dataset_associations(
        &self,
        dataset_type: &str,
        collections: &CollectionQuery,
    ) -> Result<Vec<DatasetAssociation>> {
        let dataset_type = self.dataset_types().find(dataset_type)?;
        let query = CollectionQuery {
            flatten_chains: true,
            include_chains: false,
            ..collections.clone()
        };
        let records = self.collections().query(&query)?;
        self.datasets().associations(&dataset_type, &records)
    }

    // Transfers.

    /// Exports the matching collections with everything they need.
    ///
    /// # Errors
    ///
    /// Returns a storage error only.
    pub fn export(&self, description: &str, collections: &CollectionQuery) -> Result<RepoExport> {
        transfers::export(self, description, collections)
    }

    /// Loads an export in one transaction.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the export is malformed (nothing is
    /// written), and any registration or insertion error.
    pub fn import(&self, export: &RepoExport) -> Result<ImportSummary> {
        transfers::import(self, export)
    }
}

fn stored_config(db: &dyn Database) -> Result<Option<DimensionConfig>> {
    let stored = match db.select_one(
        tables::ATTRIBUTES,
        &[Filter::eq("name", ATTR_DIMENSION_CONFIG)],
    ) {
        Ok(stored) => stored,
        Err(err) if err.is_not_found() => return Ok(None),
        Err(err) => return Err(err),
    };
    stored
        .map(|r| DimensionConfig::from_json(get_str(&r, "value")?))
        .transpose()
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("universe", &self.universe.version())
            .field("writeable", &self.db.is_writeable())
            .finish_non_exhaustive()
    }
}
