//! Query composition and execution.
//!
//! A [`QueryBuilder`] collects the dimensions a caller wants, the data ID
//! and predicate that constrain them, and the dataset searches to join.
//! [`QueryBuilder::build`] settles which element tables must be joined and
//! returns a [`Query`] that can be executed any number of times.
//!
//! Execution is a natural join of the element tables on shared dimension
//! values. Elements from distinct spatial families are related by region
//! overlap, skypix dimensions are enumerated from the regions of the other
//! spatial elements in each row, and calibration lookups use the row's
//! temporal extent when no explicit timespan is given.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use tracing::{debug, warn};

use datum_core::database::row;
use datum_core::{
    ColumnSpec, DataCoordinate, DataIdValue, Database, DatasetId, DimensionElement,
    DimensionGraph, DimensionRecord, ElementKind, Error, FieldType, Region, Result, Row,
    TableSpec, Timespan, Value,
};

use crate::collections::{CollectionRecord, CollectionType};
use crate::dataset_type::DatasetType;
use crate::datasets::{DatasetRef, DatasetStorage, Membership};
use crate::dimension_records::DimensionRecordStorage;
use crate::expression::{Expr, Identifier};
use crate::tables::{get_str, get_timespan};

/// One dataset type searched for in an ordered list of collections.
#[derive(Debug, Clone)]
pub struct DatasetSearch {
    /// Type of the datasets.
    pub dataset_type: DatasetType,
    /// Collections to search, already flattened, in search order.
    pub collections: Vec<CollectionRecord>,
    /// Keep only the first collection's match for each data ID.
    pub find_first: bool,
}

/// A dataset matched by one search in one result row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetHit {
    /// Dataset ID.
    pub id: DatasetId,
    /// Collection it was found in.
    pub collection: String,
    /// Validity range, for calibration collections.
    pub validity: Option<Timespan>,
}

/// One result row: a value per dimension plus one hit per dataset search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRow {
    /// Dimension values, keyed by dimension name.
    pub values: BTreeMap<String, DataIdValue>,
    /// Matched datasets, in search order.
    pub datasets: Vec<DatasetHit>,
}

#[derive(Debug, Clone, Default)]
struct Partial {
    values: BTreeMap<String, DataIdValue>,
    records: BTreeMap<String, DimensionRecord>,
    datasets: Vec<DatasetHit>,
}

impl Partial {
    fn region(&self, element: &str) -> Option<&Region> {
        self.records.get(element).and_then(DimensionRecord::region)
    }

    fn resolve(&self, identifier: &Identifier) -> Option<Value> {
        match &identifier.field {
            None => self.values.get(&identifier.element).map(Value::from),
            Some(field) => self
                .records
                .get(&identifier.element)
                .and_then(|r| r.get(field))
                .cloned(),
        }
    }

    fn into_row(self) -> QueryRow {
        QueryRow {
            values: self.values,
            datasets: self.datasets,
        }
    }
}

/// Accumulates the pieces of a query.
pub struct QueryBuilder<'a> {
    db: &'a dyn Database,
    requested: DimensionGraph,
    graph: DimensionGraph,
    constraints: BTreeMap<String, DataIdValue>,
    predicate: Option<Expr>,
    searches: Vec<DatasetSearch>,
    timespan: Option<Timespan>,
}

impl<'a> QueryBuilder<'a> {
    /// Starts a query returning data IDs of `requested`.
    #[must_use]
    pub fn new(db: &'a dyn Database, requested: DimensionGraph) -> Self {
        Self {
            db,
            graph: requested.clone(),
            requested,
            constraints: BTreeMap::new(),
            predicate: None,
            searches: Vec::new(),
            timespan: None,
        }
    }

    /// Constrains results to agree with a data ID, adding its dimensions.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the data ID belongs to another universe.
    pub fn where_data_id(mut self, data_id: &DataCoordinate) -> Result<Self> {
        self.graph = self.graph.union(data_id.graph())?;
        let values = data_id.full().unwrap_or_else(|_| data_id.by_name());
        for (name, value) in values {
            if let Some(existing) = self.constraints.get(&name) {
                if *existing != value {
                    return Err(Error::InvalidInput(format!(
                        "conflicting values {existing} and {value} for '{name}'"
                    )));
                }
            }
            self.constraints.insert(name, value);
        }
        Ok(self)
    }

    /// Adds a boolean predicate, joining the dimensions it names.
    ///
    /// Multiple predicates are combined with AND.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the text does not parse.
    pub fn where_expression(mut self, text: &str) -> Result<Self> {
        let expr = Expr::parse(text)?;
        let universe = self.graph.universe();
        let mut names = BTreeSet::new();
        for identifier in expr.identifiers() {
            match (universe.get(&identifier.element), &identifier.field) {
                (Some(element), None) if element.is_dimension() => {
                    names.insert(identifier.element.clone());
                }
                (Some(element), Some(_)) => {
                    names.extend(element.required().iter().cloned());
                }
                _ => {}
            }
        }
        self.graph = self.graph.union(&universe.extract(names)?)?;
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => Expr::And(Box::new(existing), Box::new(expr)),
            None => expr,
        });
        Ok(self)
    }

    /// Joins a dataset search, adding the type's dimensions.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if a collection is CHAINED or the type
    /// belongs to another universe.
    pub fn join_dataset(mut self, search: DatasetSearch) -> Result<Self> {
        if let Some(chained) = search
            .collections
            .iter()
            .find(|c| c.collection_type == CollectionType::Chained)
        {
            return Err(Error::InvalidInput(format!(
                "collection '{}' must be flattened before searching",
                chained.name
            )));
        }
        self.graph = self.graph.union(search.dataset_type.dimensions())?;
        self.searches.push(search);
        Ok(self)
    }

    /// Sets the timespan used to search calibration collections.
    #[must_use]
    pub fn with_timespan(mut self, timespan: Timespan) -> Self {
        self.timespan = Some(timespan);
        self
    }

    /// Settles the join plan.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the predicate names something outside the
    /// query, or if a skypix dimension has neither a value nor a region to
    /// enumerate it from.
    pub fn build(self) -> Result<Query<'a>> {
        let graph = self.graph;
        let universe = graph.universe();
        if let Some(predicate) = &self.predicate {
            predicate.check(&graph)?;
        }
        let predicate_elements: BTreeSet<&str> = self
            .predicate
            .iter()
            .flat_map(Expr::identifiers)
            .filter(|id| id.field.is_some())
            .map(|id| id.element.as_str())
            .collect();

        let mut joins: Vec<&'static DimensionElement> = graph
            .elements()
            .iter()
            .copied()
            .filter(|e| {
                e.has_table()
                    && (e.is_dimension() || e.always_join() || predicate_elements.contains(e.name()))
            })
            .collect();

        let chosen: Vec<&'static str> = graph
            .spatial()
            .iter()
            .filter_map(|&family| family.choose(|n| graph.contains_element(n)))
            .collect();
        let mut overlaps = Vec::new();
        if chosen.len() > 1 {
            for name in &chosen {
                let element = universe.element(name)?;
                if element.has_table() {
                    joins.push(element);
                }
            }
            for (i, a) in chosen.iter().enumerate() {
                for b in &chosen[i + 1..] {
                    overlaps.push((*a, *b));
                }
            }
        }
        joins.sort();
        joins.dedup();

        let region_sources: Vec<&'static str> = chosen
            .iter()
            .copied()
            .filter(|n| universe.get(n).is_some_and(|e| !e.is_skypix()))
            .collect();
        let skypix: Vec<&'static DimensionElement> = graph
            .dimensions()
            .iter()
            .copied()
            .filter(|d| d.is_skypix())
            .collect();
        for dim in &skypix {
            if !self.constraints.contains_key(dim.name()) && region_sources.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "skypix dimension '{}' needs a value or another spatial dimension",
                    dim.name()
                )));
            }
        }

        debug!(
            graph = %graph,
            joins = joins.len(),
            overlaps = overlaps.len(),
            searches = self.searches.len(),
            "built query"
        );
        Ok(Query {
            db: self.db,
            graph,
            requested: self.requested,
            constraints: self.constraints,
            predicate: self.predicate,
            searches: self.searches,
            timespan: self.timespan,
            joins,
            skypix,
            overlaps,
            region_sources,
        })
    }
}

impl fmt::Debug for QueryBuilder<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("graph", &self.graph.to_string())
            .field("constraints", &self.constraints)
            .field("predicate", &self.predicate.as_ref().map(ToString::to_string))
            .field("searches", &self.searches.len())
            .finish_non_exhaustive()
    }
}

/// An executable query.
pub struct Query<'a> {
    db: &'a dyn Database,
    graph: DimensionGraph,
    requested: DimensionGraph,
    constraints: BTreeMap<String, DataIdValue>,
    predicate: Option<Expr>,
    searches: Vec<DatasetSearch>,
    timespan: Option<Timespan>,
    joins: Vec<&'static DimensionElement>,
    skypix: Vec<&'static DimensionElement>,
    overlaps: Vec<(&'static str, &'static str)>,
    region_sources: Vec<&'static str>,
}

impl<'a> Query<'a> {
    /// Every dimension the query joins.
    #[must_use]
    pub const fn graph(&self) -> &DimensionGraph {
        &self.graph
    }

    /// The dimensions data IDs are projected to.
    #[must_use]
    pub const fn requested(&self) -> &DimensionGraph {
        &self.requested
    }

    /// Runs the query.
    ///
    /// # Errors
    ///
    /// Returns `AmbiguousResult` if a find-first search matches more than
    /// one calibration in a collection, and `InvalidInput` if a calibration
    /// collection is searched with no timespan available.
    pub fn rows(&self) -> Result<Vec<QueryRow>> {
        Ok(self
            .execute()?
            .into_iter()
            .map(Partial::into_row)
            .collect())
    }

    /// Number of result rows.
    ///
    /// # Errors
    ///
    /// As for [`rows`](Self::rows).
    pub fn count(&self) -> Result<usize> {
        Ok(self.execute()?.len())
    }

    /// Distinct data IDs of the requested dimensions, sorted.
    ///
    /// # Errors
    ///
    /// As for [`rows`](Self::rows).
    pub fn data_ids(&self) -> Result<Vec<DataCoordinate>> {
        project(&self.rows()?, &self.requested)
    }

    /// Distinct datasets matched by one search, in row order.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an unknown search index, otherwise as for
    /// [`rows`](Self::rows).
    pub fn dataset_refs(&self, search: usize) -> Result<Vec<DatasetRef>> {
        dataset_refs(self.db, &self.searches, &self.rows()?, search)
    }

    /// Runs the query once and stores its rows in a temporary table.
    ///
    /// # Errors
    ///
    /// As for [`rows`](Self::rows), plus storage errors.
    pub fn materialize(&self) -> Result<MaterializedQuery<'a>> {
        let rows = self.rows()?;
        let mut spec = TableSpec::new("query");
        for dim in self.graph.dimensions() {
            let field_type = dim
                .primary_key()
                .map_or(FieldType::String, |key| key.field_type);
            spec = spec.column(ColumnSpec::nullable(dim.name(), field_type));
        }
        for i in 0..self.searches.len() {
            spec = spec
                .column(ColumnSpec::required(format!("dataset_id_{i}"), FieldType::String))
                .column(ColumnSpec::required(format!("collection_{i}"), FieldType::String))
                .column(ColumnSpec::nullable(format!("validity_{i}"), FieldType::Timespan));
        }
        let table = self.db.create_temporary_table(&spec)?;
        let materialized = MaterializedQuery {
            db: self.db,
            table,
            graph: self.graph.clone(),
            requested: self.requested.clone(),
            searches: self.searches.clone(),
        };
        let stored: Vec<Row> = rows.iter().map(|r| materialized.to_row(r)).collect();
        let count = stored.len();
        if count > 0 {
            self.db.insert(&materialized.table, stored)?;
        }
        debug!(table = %materialized.table, rows = count, "materialized query");
        Ok(materialized)
    }

    fn execute(&self) -> Result<Vec<Partial>> {
        let universe = self.graph.universe();
        let storage = DimensionRecordStorage::new(self.db, universe);
        let mut rows = vec![Partial::default()];
        let mut bound: BTreeSet<String> = BTreeSet::new();
        for element in &self.joins {
            let records = storage.fetch(element.name(), &self.constraints)?;
            rows = self.join_records(rows, &bound, element, records);
            bound.extend(
                element
                    .required()
                    .iter()
                    .chain(element.implied())
                    .filter(|d| self.graph.contains(d))
                    .cloned(),
            );
        }
        for dim in &self.skypix {
            rows = self.enumerate_skypix(rows, dim, &storage)?;
        }
        rows.retain(|row| {
            self.overlaps_hold(row)
                && self.matches_constraints(row)
                && self
                    .predicate
                    .as_ref()
                    .map_or(true, |p| p.evaluate(&|id: &Identifier| row.resolve(id)))
        });
        for search in &self.searches {
            rows = self.join_datasets(rows, search)?;
        }
        Ok(rows)
    }

    /// Hash join of `rows` with an element's records on the dimensions
    /// already bound.
    fn join_records(
        &self,
        rows: Vec<Partial>,
        bound: &BTreeSet<String>,
        element: &DimensionElement,
        records: Vec<DimensionRecord>,
    ) -> Vec<Partial> {
        let dims: Vec<&str> = element
            .required()
            .iter()
            .chain(element.implied())
            .map(String::as_str)
            .filter(|d| self.graph.contains(d))
            .collect();
        let shared: Vec<&str> = dims.iter().copied().filter(|d| bound.contains(*d)).collect();

        let mut index: HashMap<Vec<DataIdValue>, Vec<(Vec<(String, DataIdValue)>, DimensionRecord)>> =
            HashMap::new();
        for record in records {
            // A null implied value never joins.
            let Some(values) = dims
                .iter()
                .map(|d| record.dimension_value(d).map(|v| ((*d).to_string(), v)))
                .collect::<Option<Vec<_>>>()
            else {
                continue;
            };
            let key = shared
                .iter()
                .filter_map(|d| values.iter().find(|(n, _)| n == d).map(|(_, v)| v.clone()))
                .collect();
            index.entry(key).or_default().push((values, record));
        }

        let mut out = Vec::new();
        for row in rows {
            let key: Vec<DataIdValue> = shared
                .iter()
                .filter_map(|d| row.values.get(*d).cloned())
                .collect();
            let Some(matches) = index.get(&key) else {
                continue;
            };
            for (values, record) in matches {
                let mut joined = row.clone();
                joined.values.extend(values.iter().cloned());
                joined.records.insert(element.name().to_string(), record.clone());
                out.push(joined);
            }
        }
        out
    }

    fn enumerate_skypix(
        &self,
        rows: Vec<Partial>,
        dim: &'static DimensionElement,
        storage: &DimensionRecordStorage<'_>,
    ) -> Result<Vec<Partial>> {
        let universe = self.graph.universe();
        let ElementKind::SkyPix { system, level } = dim.kind() else {
            return Err(Error::internal(format!("'{}' is not a skypix dimension", dim.name())));
        };
        let common = universe.common_skypix()?;
        let ElementKind::SkyPix {
            level: common_level,
            ..
        } = common.kind()
        else {
            return Err(Error::internal("common skypix dimension is not skypix"));
        };
        let pixelization = universe
            .skypix_systems()
            .get(system)
            .ok_or_else(|| Error::resource_not_found("skypix system", system))?;

        let mut out = Vec::new();
        for row in rows {
            let pixels: BTreeSet<u64> = if let Some(value) = self.constraints.get(dim.name()) {
                value.as_int().and_then(|v| u64::try_from(v).ok()).into_iter().collect()
            } else {
                let Some(region) = self.region_sources.iter().find_map(|n| row.region(n)) else {
                    continue;
                };
                let mut pixels = BTreeSet::new();
                for pixel in region.pixels() {
                    pixels.extend(pixelization.envelope(*common_level, pixel, *level)?.pixels());
                }
                pixels
            };
            for pixel in pixels {
                let value = DataIdValue::try_from(pixel)?;
                let key = BTreeMap::from([(dim.name().to_string(), value.clone())]);
                let record = storage.fetch_one(dim, &key)?;
                let mut joined = row.clone();
                joined.values.insert(dim.name().to_string(), value);
                if let Some(record) = record {
                    joined.records.insert(dim.name().to_string(), record);
                }
                out.push(joined);
            }
        }
        Ok(out)
    }

    fn overlaps_hold(&self, row: &Partial) -> bool {
        self.overlaps.iter().all(|(a, b)| match (row.region(a), row.region(b)) {
            (Some(x), Some(y)) => x.overlaps(y),
            _ => false,
        })
    }

    fn matches_constraints(&self, row: &Partial) -> bool {
        self.constraints
            .iter()
            .all(|(dim, value)| !self.graph.contains(dim) || row.values.get(dim) == Some(value))
    }

    fn row_timespan(&self, row: &Partial) -> Option<Timespan> {
        let spans: Vec<Timespan> = self
            .graph
            .temporal()
            .iter()
            .filter_map(|&family| family.choose(|n| self.graph.contains_element(n)))
            .filter_map(|n| row.records.get(n).and_then(DimensionRecord::timespan))
            .collect();
        if spans.is_empty() {
            None
        } else {
            Timespan::intersection_of(&spans)
        }
    }

    fn join_datasets(&self, rows: Vec<Partial>, search: &DatasetSearch) -> Result<Vec<Partial>> {
        let dataset_type = &search.dataset_type;
        let storage = DatasetStorage::new(self.db, self.graph.universe());
        let keys: Vec<&str> = dataset_type.dimensions().required_names().collect();

        let mut indexed: Vec<(&CollectionRecord, HashMap<Vec<DataIdValue>, Vec<Membership>>)> =
            Vec::with_capacity(search.collections.len());
        for record in &search.collections {
            let mut index: HashMap<Vec<DataIdValue>, Vec<Membership>> = HashMap::new();
            for membership in storage.memberships(dataset_type, record)? {
                let key = keys
                    .iter()
                    .map(|k| membership.key.get(*k).cloned())
                    .collect::<Option<Vec<_>>>();
                if let Some(key) = key {
                    index.entry(key).or_default().push(membership);
                }
            }
            indexed.push((record, index));
        }

        let mut out = Vec::new();
        for row in rows {
            let Some(key) = keys
                .iter()
                .map(|k| row.values.get(*k).cloned())
                .collect::<Option<Vec<_>>>()
            else {
                continue;
            };
            let mut hits = Vec::new();
            for (record, index) in &indexed {
                let Some(candidates) = index.get(&key) else {
                    continue;
                };
                let matched: Vec<&Membership> =
                    if record.collection_type == CollectionType::Calibration {
                        let timespan = self
                            .timespan
                            .or_else(|| self.row_timespan(&row))
                            .ok_or_else(|| {
                                Error::InvalidInput(format!(
                                    "searching CALIBRATION collection '{}' needs a timespan",
                                    record.name
                                ))
                            })?;
                        candidates
                            .iter()
                            .filter(|m| m.validity.is_some_and(|v| v.overlaps(&timespan)))
                            .collect()
                    } else {
                        candidates.iter().collect()
                    };
                if matched.is_empty() {
                    continue;
                }
                let hit = |m: &Membership| DatasetHit {
                    id: m.id,
                    collection: record.name.clone(),
                    validity: m.validity,
                };
                if search.find_first {
                    if matched.len() > 1 {
                        return Err(Error::ambiguous(format!(
                            "{} '{}' datasets in '{}' match {:?}",
                            matched.len(),
                            dataset_type.name(),
                            record.name,
                            row.values
                        )));
                    }
                    hits.push(hit(matched[0]));
                    break;
                }
                hits.extend(matched.into_iter().map(hit));
            }
            for hit in hits {
                let mut joined = row.clone();
                joined.datasets.push(hit);
                out.push(joined);
            }
        }
        Ok(out)
    }
}

impl fmt::Debug for Query<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("graph", &self.graph.to_string())
            .field("requested", &self.requested.to_string())
            .field(
                "joins",
                &self.joins.iter().map(|e| e.name()).collect::<Vec<_>>(),
            )
            .field("overlaps", &self.overlaps)
            .field("searches", &self.searches.len())
            .finish_non_exhaustive()
    }
}

/// Query results held in a temporary table.
///
/// The table is dropped with the value.
pub struct MaterializedQuery<'a> {
    db: &'a dyn Database,
    table: String,
    graph: DimensionGraph,
    requested: DimensionGraph,
    searches: Vec<DatasetSearch>,
}

impl MaterializedQuery<'_> {
    /// Name of the backing temporary table.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The stored rows.
    ///
    /// # Errors
    ///
    /// Returns a storage error only.
    pub fn rows(&self) -> Result<Vec<QueryRow>> {
        self.db
            .select(&self.table, &[])?
            .iter()
            .map(|r| self.from_row(r))
            .collect()
    }

    /// Distinct data IDs of the requested dimensions, sorted.
    ///
    /// # Errors
    ///
    /// Returns a storage error only.
    pub fn data_ids(&self) -> Result<Vec<DataCoordinate>> {
        project(&self.rows()?, &self.requested)
    }

    /// Distinct datasets matched by one search.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an unknown search index.
    pub fn dataset_refs(&self, search: usize) -> Result<Vec<DatasetRef>> {
        dataset_refs(self.db, &self.searches, &self.rows()?, search)
    }

    fn to_row(&self, query_row: &QueryRow) -> Row {
        let mut stored = row(
            query_row
                .values
                .iter()
                .filter(|(k, _)| self.graph.contains(k))
                .map(|(k, v)| (k.clone(), Value::from(v))),
        );
        for (i, hit) in query_row.datasets.iter().enumerate() {
            stored.insert(format!("dataset_id_{i}"), Value::Str(hit.id.to_string()));
            stored.insert(format!("collection_{i}"), Value::Str(hit.collection.clone()));
            stored.insert(format!("validity_{i}"), Value::from(hit.validity));
        }
        stored
    }

    fn from_row(&self, stored: &Row) -> Result<QueryRow> {
        let mut values = BTreeMap::new();
        for dim in self.graph.dimensions() {
            if let Some(value) = stored.get(dim.name()).filter(|v| !v.is_null()) {
                values.insert(dim.name().to_string(), value.to_data_id_value()?);
            }
        }
        let mut datasets = Vec::with_capacity(self.searches.len());
        for i in 0..self.searches.len() {
            datasets.push(DatasetHit {
                id: get_str(stored, &format!("dataset_id_{i}"))?.parse()?,
                collection: get_str(stored, &format!("collection_{i}"))?.to_string(),
                validity: get_timespan(stored, &format!("validity_{i}"))?,
            });
        }
        Ok(QueryRow { values, datasets })
    }
}

impl Drop for MaterializedQuery<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.db.drop_temporary_table(&self.table) {
            warn!(table = %self.table, error = %err, "failed to drop materialized query");
        }
    }
}

impl fmt::Debug for MaterializedQuery<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaterializedQuery")
            .field("table", &self.table)
            .field("graph", &self.graph.to_string())
            .finish_non_exhaustive()
    }
}

fn project(rows: &[QueryRow], requested: &DimensionGraph) -> Result<Vec<DataCoordinate>> {
    let mut distinct = BTreeSet::new();
    for row in rows {
        distinct.insert(DataCoordinate::from_mapping(&row.values, requested)?);
    }
    Ok(distinct.into_iter().collect())
}

fn dataset_refs(
    db: &dyn Database,
    searches: &[DatasetSearch],
    rows: &[QueryRow],
    search: usize,
) -> Result<Vec<DatasetRef>> {
    let dataset_search = searches
        .get(search)
        .ok_or_else(|| Error::InvalidInput(format!("query has no dataset search {search}")))?;
    let dataset_type = &dataset_search.dataset_type;
    let runs =
        DatasetStorage::new(db, dataset_type.dimensions().universe()).runs(dataset_type)?;
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for query_row in rows {
        let Some(hit) = query_row.datasets.get(search) else {
            continue;
        };
        if !seen.insert(hit.id) {
            continue;
        }
        let run = runs
            .get(&hit.id)
            .cloned()
            .ok_or_else(|| Error::internal(format!("dataset {} has no run", hit.id)))?;
        out.push(DatasetRef {
            id: hit.id,
            dataset_type: dataset_type.clone(),
            data_id: DataCoordinate::from_mapping(&query_row.values, dataset_type.dimensions())?,
            run,
        });
    }
    Ok(out)
}
