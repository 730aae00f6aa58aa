//! Data coordinates.
//!
//! A [`DataCoordinate`] maps the dimensions of a [`DimensionGraph`] to their
//! primary-key values. It has three capability levels, each a superset of
//! the last:
//!
//! - *required-only*: values for the graph's required dimensions;
//! - *full*: also values for its implied dimensions;
//! - *expanded*: also a record (or an explicit absence) for every element.
//!
//! Accessors that need a capability the coordinate lacks return
//! [`Error::MissingCapability`] rather than a partial answer.
//!
//! Equality and hashing look only at the graph and the required values.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::dimensions::{DimensionGraph, DimensionRecord, DimensionUniverse, TopologicalSpace};
use crate::error::{Error, Result};
use crate::region::RegionOutcome;
use crate::timespan::Timespan;
use crate::value::DataIdValue;

/// Records of an expanded coordinate: element name to record, where `None`
/// means the element has no record for this coordinate.
pub type RecordMap = BTreeMap<String, Option<DimensionRecord>>;

/// Input accepted by [`DataCoordinate::standardize`].
#[derive(Debug, Clone, Copy)]
pub enum DataIdInput<'a> {
    /// No base values; everything comes from overrides.
    None,
    /// An existing coordinate.
    Coordinate(&'a DataCoordinate),
    /// A name-keyed mapping.
    Mapping(&'a BTreeMap<String, DataIdValue>),
}

impl<'a> From<&'a DataCoordinate> for DataIdInput<'a> {
    fn from(data_id: &'a DataCoordinate) -> Self {
        Self::Coordinate(data_id)
    }
}

impl<'a> From<&'a BTreeMap<String, DataIdValue>> for DataIdInput<'a> {
    fn from(mapping: &'a BTreeMap<String, DataIdValue>) -> Self {
        Self::Mapping(mapping)
    }
}

#[derive(Clone)]
enum Values {
    /// Required values only, in graph order.
    RequiredOnly(Vec<DataIdValue>),
    /// Required then implied values.
    Full(Vec<DataIdValue>),
    /// Full values plus records for every element of the graph.
    Expanded {
        values: Vec<DataIdValue>,
        records: Arc<RecordMap>,
    },
}

impl Values {
    fn as_slice(&self) -> &[DataIdValue] {
        match self {
            Self::RequiredOnly(v) | Self::Full(v) | Self::Expanded { values: v, .. } => v,
        }
    }
}

/// A validated set of dimension values.
#[derive(Clone)]
pub struct DataCoordinate {
    graph: DimensionGraph,
    values: Values,
}

impl DataCoordinate {
    /// The coordinate with no dimensions. It is trivially expanded.
    #[must_use]
    pub fn make_empty(universe: &'static DimensionUniverse) -> Self {
        Self {
            graph: universe.empty(),
            values: Values::Expanded {
                values: Vec::new(),
                records: Arc::new(RecordMap::new()),
            },
        }
    }

    /// Builds a coordinate from required values, in the graph's required
    /// order.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the number of values is wrong.
    pub fn from_required_values(graph: &DimensionGraph, values: Vec<DataIdValue>) -> Result<Self> {
        if values.len() != graph.required().len() {
            return Err(Error::InvalidInput(format!(
                "{graph} needs {} required values, got {}",
                graph.required().len(),
                values.len()
            )));
        }
        if graph.is_empty() {
            return Ok(Self::make_empty(graph.universe()));
        }
        let values = if graph.implied().is_empty() {
            Values::Full(values)
        } else {
            Values::RequiredOnly(values)
        };
        Ok(Self {
            graph: graph.clone(),
            values,
        })
    }

    /// Builds a coordinate from required then implied values.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the number of values is wrong.
    pub fn from_full_values(graph: &DimensionGraph, values: Vec<DataIdValue>) -> Result<Self> {
        if values.len() != graph.dimensions().len() {
            return Err(Error::InvalidInput(format!(
                "{graph} needs {} values, got {}",
                graph.dimensions().len(),
                values.len()
            )));
        }
        if graph.is_empty() {
            return Ok(Self::make_empty(graph.universe()));
        }
        Ok(Self {
            graph: graph.clone(),
            values: Values::Full(values),
        })
    }

    /// Adapts an existing coordinate or a mapping, plus overrides, into a
    /// coordinate.
    ///
    /// With an existing coordinate and a target graph whose dimensions are
    /// disjoint from the override keys, this is `existing.subset(graph)`;
    /// with a coordinate, no graph and no overrides, it is a clone.
    /// Otherwise values are merged (overrides win), the graph is inferred
    /// from the merged keys if not given, and the result is full if every
    /// dimension of the graph has a value.
    ///
    /// When a graph is given, a key that is not a dimension name but is the
    /// primary-key field name of exactly one unset dimension of the graph is
    /// read as that dimension (`{"instrument": "Cam1", "id": 1}` for a
    /// detector graph).
    ///
    /// # Errors
    ///
    /// Returns `MissingDimension` if a required dimension has no value,
    /// `ResourceNotFound` for unknown names when inferring the graph, and
    /// `InvalidInput` if neither a graph nor a universe is available.
    pub fn standardize(
        input: DataIdInput<'_>,
        graph: Option<&DimensionGraph>,
        universe: Option<&'static DimensionUniverse>,
        overrides: &BTreeMap<String, DataIdValue>,
    ) -> Result<Self> {
        let mut universe = universe;
        let mut merged: BTreeMap<String, DataIdValue> = BTreeMap::new();
        match input {
            DataIdInput::Coordinate(existing) => {
                match graph {
                    None if overrides.is_empty() => return Ok(existing.clone()),
                    Some(target) if overrides.keys().all(|k| !target.contains(k)) => {
                        return existing.subset(target);
                    }
                    _ => {}
                }
                universe = Some(existing.universe());
                let count = if existing.has_full() {
                    existing.graph.dimensions().len()
                } else {
                    existing.graph.required().len()
                };
                let names = existing.graph.required_names().chain(existing.graph.implied_names());
                for (name, value) in names.zip(existing.values.as_slice()).take(count) {
                    merged.insert(name.to_string(), value.clone());
                }
            }
            DataIdInput::Mapping(mapping) => merged.extend(mapping.clone()),
            DataIdInput::None => {}
        }
        merged.extend(overrides.clone());

        let graph = match graph {
            Some(g) => {
                resolve_key_aliases(&mut merged, g);
                g.clone()
            }
            None => {
                let universe = universe.ok_or_else(|| {
                    Error::InvalidInput("a universe is required when no graph is given".into())
                })?;
                universe.extract(merged.keys())?
            }
        };
        if graph.is_empty() {
            return Ok(Self::make_empty(graph.universe()));
        }

        if graph.names().iter().all(|n| merged.contains_key(n)) {
            let values = graph
                .required_names()
                .chain(graph.implied_names())
                .filter_map(|n| merged.remove(n))
                .collect();
            return Self::from_full_values(&graph, values);
        }
        let values = graph
            .required_names()
            .map(|n| merged.remove(n).ok_or_else(|| Error::missing_dimension(n)))
            .collect::<Result<Vec<_>>>()?;
        Self::from_required_values(&graph, values)
    }

    /// Standardizes a name-keyed mapping against a known graph.
    ///
    /// # Errors
    ///
    /// As for [`standardize`](Self::standardize).
    pub fn from_mapping(
        mapping: &BTreeMap<String, DataIdValue>,
        graph: &DimensionGraph,
    ) -> Result<Self> {
        Self::standardize(DataIdInput::Mapping(mapping), Some(graph), None, &BTreeMap::new())
    }

    /// Standardizes a name-keyed mapping, inferring the graph from its keys.
    ///
    /// # Errors
    ///
    /// As for [`standardize`](Self::standardize).
    pub fn infer(
        universe: &'static DimensionUniverse,
        mapping: &BTreeMap<String, DataIdValue>,
    ) -> Result<Self> {
        Self::standardize(DataIdInput::Mapping(mapping), None, Some(universe), &BTreeMap::new())
    }

    /// The dimensions this coordinate identifies.
    #[must_use]
    pub const fn graph(&self) -> &DimensionGraph {
        &self.graph
    }

    /// The universe of the graph.
    #[must_use]
    pub fn universe(&self) -> &'static DimensionUniverse {
        self.graph.universe()
    }

    /// True if implied values are present.
    #[must_use]
    pub const fn has_full(&self) -> bool {
        matches!(self.values, Values::Full(_) | Values::Expanded { .. })
    }

    /// True if records are attached.
    #[must_use]
    pub const fn has_records(&self) -> bool {
        matches!(self.values, Values::Expanded { .. })
    }

    /// The value of a dimension, if this coordinate has it.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&DataIdValue> {
        self.graph
            .value_index(name)
            .and_then(|i| self.values.as_slice().get(i))
    }

    /// Required values, in the graph's required order.
    #[must_use]
    pub fn required_values(&self) -> &[DataIdValue] {
        let n = self.graph.required().len();
        &self.values.as_slice()[..n]
    }

    /// Required values by dimension name.
    #[must_use]
    pub fn by_name(&self) -> BTreeMap<String, DataIdValue> {
        self.graph
            .required_names()
            .map(str::to_string)
            .zip(self.required_values().iter().cloned())
            .collect()
    }

    /// Required then implied values.
    ///
    /// # Errors
    ///
    /// Returns `MissingCapability` unless [`has_full`](Self::has_full).
    pub fn full_values(&self) -> Result<&[DataIdValue]> {
        match &self.values {
            Values::RequiredOnly(_) => Err(self.missing("full")),
            Values::Full(v) | Values::Expanded { values: v, .. } => Ok(v),
        }
    }

    /// All values by dimension name.
    ///
    /// # Errors
    ///
    /// Returns `MissingCapability` unless [`has_full`](Self::has_full).
    pub fn full(&self) -> Result<BTreeMap<String, DataIdValue>> {
        let values = self.full_values()?;
        Ok(self
            .graph
            .required_names()
            .chain(self.graph.implied_names())
            .map(str::to_string)
            .zip(values.iter().cloned())
            .collect())
    }

    /// Records for every element of the graph.
    ///
    /// # Errors
    ///
    /// Returns `MissingCapability` unless [`has_records`](Self::has_records).
    pub fn records(&self) -> Result<&RecordMap> {
        match &self.values {
            Values::Expanded { records, .. } => Ok(records),
            _ => Err(self.missing("records")),
        }
    }

    /// The record for one element.
    ///
    /// # Errors
    ///
    /// Returns `MissingCapability` unless [`has_records`](Self::has_records),
    /// and `ResourceNotFound` if `element` is not in the graph.
    pub fn record(&self, element: &str) -> Result<Option<&DimensionRecord>> {
        self.records()?
            .get(element)
            .map(Option::as_ref)
            .ok_or_else(|| Error::resource_not_found("dimension element in data ID", element))
    }

    /// The region of this coordinate, from its spatial families.
    ///
    /// # Errors
    ///
    /// Returns `MissingCapability` unless [`has_records`](Self::has_records).
    pub fn region(&self) -> Result<RegionOutcome> {
        if !self.has_records() {
            return Err(self.missing("records"));
        }
        let mut regions = Vec::new();
        for element in self.graph.family_choices(TopologicalSpace::Spatial) {
            match self.record(element)?.and_then(DimensionRecord::region) {
                Some(region) => regions.push(region.clone()),
                None => return Ok(RegionOutcome::None),
            }
        }
        Ok(match regions.len() {
            0 => RegionOutcome::None,
            1 => regions.pop().map_or(RegionOutcome::None, RegionOutcome::Single),
            _ => RegionOutcome::Indeterminate,
        })
    }

    /// The intersection of the timespans of this coordinate's temporal
    /// families; `None` if there are none, one is missing, or they do not
    /// overlap.
    ///
    /// # Errors
    ///
    /// Returns `MissingCapability` unless [`has_records`](Self::has_records).
    pub fn timespan(&self) -> Result<Option<Timespan>> {
        if !self.has_records() {
            return Err(self.missing("records"));
        }
        let mut spans = Vec::new();
        for element in self.graph.family_choices(TopologicalSpace::Temporal) {
            match self.record(element)?.and_then(DimensionRecord::timespan) {
                Some(span) => spans.push(span),
                None => return Ok(None),
            }
        }
        Ok(Timespan::intersection_of(&spans))
    }

    /// Packs this coordinate with the named packer, returning the packed
    /// value and the packer's maximum bit width.
    ///
    /// # Errors
    ///
    /// Returns `MissingCapability` unless [`has_records`](Self::has_records),
    /// or an error from the packer.
    pub fn pack(&self, packer: &str) -> Result<(u64, u32)> {
        if !self.has_records() {
            return Err(self.missing("records"));
        }
        let packer = self.universe().make_packer(packer, self)?;
        Ok((packer.pack(self)?, packer.max_bits()))
    }

    /// Restricts this coordinate to a subgraph.
    ///
    /// Full and expanded capability are kept when this coordinate has them
    /// or its required dimensions already cover the target's dimensions.
    ///
    /// # Errors
    ///
    /// Returns `MissingDimension` if a target dimension has no value here.
    pub fn subset(&self, graph: &DimensionGraph) -> Result<Self> {
        if *graph == self.graph {
            return Ok(self.clone());
        }
        if graph.is_empty() {
            return Ok(Self::make_empty(graph.universe()));
        }
        let lookup = |name: &str| {
            self.get(name)
                .cloned()
                .ok_or_else(|| Error::missing_dimension(name))
        };
        let required_cover = graph
            .names()
            .iter()
            .all(|n| self.graph.required_names().any(|r| r == n));
        if self.has_full() || required_cover {
            let values = graph
                .required_names()
                .chain(graph.implied_names())
                .map(lookup)
                .collect::<Result<Vec<_>>>()?;
            if let Values::Expanded { records, .. } = &self.values {
                let records: RecordMap = graph
                    .elements()
                    .iter()
                    .map(|e| (e.name().to_string(), records.get(e.name()).cloned().flatten()))
                    .collect();
                return Ok(Self {
                    graph: graph.clone(),
                    values: Values::Expanded {
                        values,
                        records: Arc::new(records),
                    },
                });
            }
            return Self::from_full_values(graph, values);
        }
        let values = graph
            .required_names()
            .map(lookup)
            .collect::<Result<Vec<_>>>()?;
        Self::from_required_values(graph, values)
    }

    /// Attaches records for every element of the graph.
    ///
    /// Implied values missing from this coordinate are read from the
    /// records of the implied dimensions. Returns a clone if already
    /// expanded.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if `records` lacks an element of the graph,
    /// and `MissingDimension` if an implied value cannot be found.
    pub fn expanded(&self, mut records: RecordMap) -> Result<Self> {
        if self.has_records() {
            return Ok(self.clone());
        }
        let mut values = self.values.as_slice().to_vec();
        if !self.has_full() {
            for dim in self.graph.implied() {
                let value = records
                    .get(dim.name())
                    .and_then(Option::as_ref)
                    .and_then(|r| r.dimension_value(dim.name()))
                    .ok_or_else(|| Error::missing_dimension(dim.name()))?;
                values.push(value);
            }
        }
        let mut attached = RecordMap::new();
        for element in self.graph.elements() {
            let record = records.remove(element.name()).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "no record given for element '{}' of {}",
                    element.name(),
                    self.graph
                ))
            })?;
            attached.insert(element.name().to_string(), record);
        }
        Ok(Self {
            graph: self.graph.clone(),
            values: Values::Expanded {
                values,
                records: Arc::new(attached),
            },
        })
    }

    fn missing(&self, capability: &'static str) -> Error {
        Error::MissingCapability {
            capability,
            coordinate: self.to_string(),
        }
    }
}

fn resolve_key_aliases(merged: &mut BTreeMap<String, DataIdValue>, graph: &DimensionGraph) {
    let stray: Vec<String> = merged
        .keys()
        .filter(|k| !graph.contains(k))
        .cloned()
        .collect();
    for key in stray {
        let mut candidates = graph
            .dimensions()
            .iter()
            .filter(|d| d.primary_key_name() == Some(key.as_str()))
            .filter(|d| !merged.contains_key(d.name()));
        if let (Some(target), None) = (candidates.next(), candidates.next()) {
            let target = target.name().to_string();
            if let Some(value) = merged.remove(&key) {
                merged.insert(target, value);
            }
        }
    }
}

impl PartialEq for DataCoordinate {
    fn eq(&self, other: &Self) -> bool {
        self.graph == other.graph && self.required_values() == other.required_values()
    }
}

impl Eq for DataCoordinate {}

impl Hash for DataCoordinate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.graph.hash(state);
        self.required_values().hash(state);
    }
}

impl PartialOrd for DataCoordinate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DataCoordinate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.graph
            .cmp(&other.graph)
            .then_with(|| self.required_values().cmp(other.required_values()))
    }
}

impl fmt::Display for DataCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, dim) in self.graph.dimensions().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match self.get(dim.name()) {
                Some(value) => write!(f, "{}: {value}", dim.name())?,
                None => write!(f, "{}: ?", dim.name())?,
            }
        }
        write!(f, "}}")
    }
}

impl fmt::Debug for DataCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.values {
            Values::RequiredOnly(_) => "required",
            Values::Full(_) => "full",
            Values::Expanded { .. } => "expanded",
        };
        write!(f, "DataCoordinate[{level}]{self}")
    }
}
